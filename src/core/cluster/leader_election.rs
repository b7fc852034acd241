//! Lease-based leader election
//!
//! This module implements the acquire/renew/release protocol that keeps at most
//! one replica active at a time. Exclusion across processes comes entirely from
//! the conditional writes of the [`ResourceLock`] backend; this side only
//! decides when to write and when to give up.
//!
//! A replica that cannot renew within `renew_deadline` of its last successful
//! renewal steps down, while a challenger waits a full `lease_duration` after it
//! last saw the record change. Since `renew_deadline < lease_duration`, a
//! deposed leader has always stopped before anyone else can start.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::identity::Identity;
use super::resource_lock::{LockConfig, LockError, LockRecord, LockResult, ResourceLock, VersionedRecord};
use crate::core::observability::MetricsRegistry;
use crate::error::{AppError, Result};

/// Timing parameters of the lease protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseTiming {
    /// How long a standby waits after the last observed change before taking over
    pub lease_duration: Duration,
    /// How long the leader keeps retrying a renewal before stepping down
    pub renew_deadline: Duration,
    /// Interval between acquire and renew attempts
    pub retry_period: Duration,
}

impl Default for LeaseTiming {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(15),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(2),
        }
    }
}

impl LeaseTiming {
    /// Enforce `0 < retry_period < renew_deadline < lease_duration`.
    pub fn validate(&self) -> Result<()> {
        if self.retry_period.is_zero() {
            return Err(AppError::ConfigError(
                "retry period must be greater than zero".to_string(),
            ));
        }
        if self.renew_deadline <= self.retry_period {
            return Err(AppError::ConfigError(format!(
                "renew deadline ({:?}) must be greater than retry period ({:?})",
                self.renew_deadline, self.retry_period
            )));
        }
        if self.lease_duration <= self.renew_deadline {
            return Err(AppError::ConfigError(format!(
                "lease duration ({:?}) must be greater than renew deadline ({:?})",
                self.lease_duration, self.renew_deadline
            )));
        }
        Ok(())
    }
}

/// State of the election state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderState {
    /// Not started yet
    Idle,
    /// Contesting the lock
    Acquiring,
    /// Holding the lock, last renewal succeeded
    Leading,
    /// Holding the lock, retrying a failed renewal
    Renewing,
    /// Terminal; leadership will not be resumed in this run
    Released,
}

/// Why leadership ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Renewal failed past the deadline or another identity took the lock
    Lost,
    /// Shutdown was requested while leading
    Cancelled,
}

/// How a call to [`LeaderElector::run`] ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionOutcome {
    /// Shutdown was requested before the lock was ever acquired
    CancelledBeforeLeading,
    /// Leadership ended, see the reason
    Stopped(StopReason),
}

/// Handles passed to the leader callback
#[derive(Debug, Clone)]
pub struct LeaderContext {
    pub identity: Identity,
    pub lease: String,
    /// Cancelled as soon as leadership ends or shutdown is requested
    pub cancel: CancellationToken,
}

/// Transition handlers invoked by the elector
#[async_trait]
pub trait LeadershipHandler: Send + Sync + 'static {
    /// Runs in its own task once the lock is acquired.
    async fn on_started_leading(&self, ctx: LeaderContext);

    /// Invoked exactly once when a run that reached leadership ends.
    fn on_stopped_leading(&self, reason: StopReason);

    /// Invoked whenever the observed holder changes.
    fn on_new_leader(&self, _identity: &str) {}
}

enum Attempt {
    Acquired,
    HeldBy(String),
}

#[derive(Debug, Clone)]
struct ObservedRecord {
    record: VersionedRecord,
    observed_at: Instant,
}

/// Drives the lease protocol for one identity against one lock
pub struct LeaderElector {
    config: LockConfig,
    timing: LeaseTiming,
    lock: Arc<dyn ResourceLock>,
    metrics: Option<Arc<MetricsRegistry>>,
    state: watch::Sender<LeaderState>,
    observed: Arc<RwLock<Option<ObservedRecord>>>,
    started: AtomicBool,
}

impl LeaderElector {
    /// Create an elector; fails when the timing is invalid.
    pub fn new(config: LockConfig, timing: LeaseTiming, lock: Arc<dyn ResourceLock>) -> Result<Self> {
        timing.validate()?;
        let (state, _) = watch::channel(LeaderState::Idle);

        Ok(Self {
            config,
            timing,
            lock,
            metrics: None,
            state,
            observed: Arc::new(RwLock::new(None)),
            started: AtomicBool::new(false),
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn identity(&self) -> &Identity {
        &self.config.identity
    }

    pub fn timing(&self) -> LeaseTiming {
        self.timing
    }

    pub fn state(&self) -> LeaderState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<LeaderState> {
        self.state.subscribe()
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.state(), LeaderState::Leading | LeaderState::Renewing)
    }

    /// Holder identity from the last observed record.
    pub async fn leader(&self) -> Option<String> {
        let observed = self.observed.read().await;
        observed
            .as_ref()
            .map(|o| o.record.record.holder_identity.clone())
            .filter(|holder| !holder.is_empty())
    }

    /// Contest the lock until `cancel` fires or leadership is lost.
    ///
    /// An elector runs at most once; leadership is never resumed after it ends.
    pub async fn run(
        &self,
        cancel: CancellationToken,
        handler: Arc<dyn LeadershipHandler>,
    ) -> Result<ElectionOutcome> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(AppError::InternalError(
                "leader elector can only be run once".to_string(),
            ));
        }

        let acquired_at = match self.acquire(&cancel, handler.as_ref()).await {
            Some(acquired_at) => acquired_at,
            None => {
                self.transition(LeaderState::Released);
                info!(lease = %self.config.describe(), "Stopped contesting lease before acquiring it");
                return Ok(ElectionOutcome::CancelledBeforeLeading);
            }
        };

        let leader_cancel = cancel.child_token();
        let ctx = LeaderContext {
            identity: self.config.identity.clone(),
            lease: self.config.describe(),
            cancel: leader_cancel.clone(),
        };
        let started = handler.clone();
        tokio::spawn(async move {
            started.on_started_leading(ctx).await;
        });

        let reason = self.renew(&cancel, handler.as_ref(), acquired_at).await;

        leader_cancel.cancel();
        self.transition(LeaderState::Released);
        self.report_leading(false);

        if reason == StopReason::Cancelled {
            self.release().await;
        }

        handler.on_stopped_leading(reason);
        Ok(ElectionOutcome::Stopped(reason))
    }

    /// Retry acquisition every `retry_period` until it succeeds or `cancel` fires.
    ///
    /// Returns when the successful attempt started; the write may have landed
    /// any time after that.
    async fn acquire(
        &self,
        cancel: &CancellationToken,
        handler: &dyn LeadershipHandler,
    ) -> Option<Instant> {
        self.transition(LeaderState::Acquiring);
        info!(
            identity = %self.config.identity,
            lease = %self.config.describe(),
            "Attempting to acquire leader lease"
        );

        loop {
            if cancel.is_cancelled() {
                return None;
            }

            let attempt_started = Instant::now();
            let attempt = tokio::time::timeout(
                self.timing.renew_deadline,
                self.try_acquire_or_renew(false, handler),
            )
            .await;

            match attempt {
                Ok(Ok(Attempt::Acquired)) => {
                    info!(
                        identity = %self.config.identity,
                        lease = %self.config.describe(),
                        "Successfully acquired lease"
                    );
                    self.transition(LeaderState::Leading);
                    self.report_leading(true);
                    return Some(attempt_started);
                }
                Ok(Ok(Attempt::HeldBy(holder))) => {
                    debug!(
                        lease = %self.config.describe(),
                        holder = %holder,
                        "Lease is held by another identity and has not yet expired"
                    );
                }
                Ok(Err(e)) => {
                    warn!(lease = %self.config.describe(), error = %e, "Failed to acquire lease");
                }
                Err(_) => {
                    warn!(lease = %self.config.describe(), "Timed out acquiring lease");
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(self.timing.retry_period) => {}
            }
        }
    }

    /// Keep renewing until a renewal misses the deadline, the lock is taken
    /// over, or `cancel` fires.
    ///
    /// The deadline counts from the start of the last successful attempt,
    /// since a standby may have observed that write as soon as it landed.
    async fn renew(
        &self,
        cancel: &CancellationToken,
        handler: &dyn LeadershipHandler,
        acquired_at: Instant,
    ) -> StopReason {
        let mut last_renewal = acquired_at;

        loop {
            let deadline = last_renewal + self.timing.renew_deadline;
            let next_attempt = (Instant::now() + self.timing.retry_period).min(deadline);

            tokio::select! {
                _ = cancel.cancelled() => return StopReason::Cancelled,
                _ = tokio::time::sleep_until(next_attempt) => {}
            }

            if Instant::now() >= deadline {
                error!(
                    identity = %self.config.identity,
                    lease = %self.config.describe(),
                    renew_deadline = ?self.timing.renew_deadline,
                    "Failed to renew lease within the renew deadline"
                );
                return StopReason::Lost;
            }

            let attempt_started = Instant::now();
            let attempt = tokio::select! {
                _ = cancel.cancelled() => return StopReason::Cancelled,
                result = tokio::time::timeout_at(deadline, self.try_acquire_or_renew(true, handler)) => result,
            };

            match attempt {
                Ok(Ok(Attempt::Acquired)) => {
                    last_renewal = attempt_started;
                    if self.state() != LeaderState::Leading {
                        self.transition(LeaderState::Leading);
                    }
                    debug!(lease = %self.config.describe(), "Successfully renewed lease");
                }
                Ok(Ok(Attempt::HeldBy(holder))) => {
                    error!(
                        identity = %self.config.identity,
                        lease = %self.config.describe(),
                        holder = %holder,
                        "Lease was taken over by another identity"
                    );
                    return StopReason::Lost;
                }
                Ok(Err(e)) => {
                    warn!(lease = %self.config.describe(), error = %e, "Failed to renew lease");
                    self.enter_renewing();
                }
                Err(_) => {
                    warn!(lease = %self.config.describe(), "Lease renewal attempt timed out");
                    self.enter_renewing();
                }
            }
        }
    }

    /// One read-check-write round against the lock.
    async fn try_acquire_or_renew(
        &self,
        renewing: bool,
        handler: &dyn LeadershipHandler,
    ) -> LockResult<Attempt> {
        let now = Utc::now();
        let identity = &self.config.identity;
        let mut desired = LockRecord {
            holder_identity: identity.to_string(),
            lease_duration_seconds: lease_seconds(self.timing.lease_duration),
            acquire_time: now,
            renew_time: now,
            leader_transitions: 0,
        };

        let current = match self.lock.get().await {
            Ok(Some(current)) => current,
            Ok(None) | Err(LockError::NotFound(_)) => {
                let created = self.lock.create(&desired).await?;
                self.observe(&created, handler).await;
                return Ok(Attempt::Acquired);
            }
            Err(e) => return Err(e),
        };

        self.observe(&current, handler).await;

        let record = &current.record;
        let held_by_other = !record.is_released() && !record.is_held_by(identity);
        // A leader never reclaims a lock someone else took, expired or not.
        if held_by_other && (renewing || !self.observed_expired().await) {
            return Ok(Attempt::HeldBy(record.holder_identity.clone()));
        }

        if record.is_held_by(identity) {
            desired.acquire_time = record.acquire_time;
            desired.leader_transitions = record.leader_transitions;
        } else {
            desired.leader_transitions = record.leader_transitions.saturating_add(1);
        }

        let updated = self.lock.update(&desired, current.version).await?;
        self.observe(&updated, handler).await;
        Ok(Attempt::Acquired)
    }

    /// Record the latest view of the lock, restarting the expiry clock when
    /// its content changed.
    async fn observe(&self, current: &VersionedRecord, handler: &dyn LeadershipHandler) {
        let new_holder = {
            let mut observed = self.observed.write().await;
            let previous = observed.take();
            let changed = previous
                .as_ref()
                .map_or(true, |p| p.record.record != current.record);

            let observed_at = match &previous {
                Some(p) if !changed => p.observed_at,
                _ => Instant::now(),
            };
            *observed = Some(ObservedRecord {
                record: current.clone(),
                observed_at,
            });

            let holder = &current.record.holder_identity;
            let holder_changed = previous
                .as_ref()
                .map_or(true, |p| &p.record.record.holder_identity != holder);
            (holder_changed && !holder.is_empty()).then(|| holder.clone())
        };

        if let Some(holder) = new_holder {
            info!(lease = %self.config.describe(), leader = %holder, "New leader elected");
            handler.on_new_leader(&holder);
        }
    }

    async fn observed_expired(&self) -> bool {
        let observed = self.observed.read().await;
        match observed.as_ref() {
            Some(o) => {
                let lease = o.record.record.lease_duration().max(self.timing.lease_duration);
                o.observed_at + lease <= Instant::now()
            }
            None => true,
        }
    }

    /// Best-effort hand-off of a lock this identity still holds.
    async fn release(&self) -> bool {
        match tokio::time::timeout(self.timing.renew_deadline, self.try_release()).await {
            Ok(Ok(released)) => released,
            Ok(Err(e)) => {
                warn!(lease = %self.config.describe(), error = %e, "Failed to release lease");
                false
            }
            Err(_) => {
                warn!(lease = %self.config.describe(), "Timed out releasing lease");
                false
            }
        }
    }

    async fn try_release(&self) -> LockResult<bool> {
        let current = match self.lock.get().await? {
            Some(current) => current,
            None => return Ok(false),
        };
        if !current.record.is_held_by(&self.config.identity) {
            return Ok(false);
        }

        let now = Utc::now();
        let released = LockRecord {
            holder_identity: String::new(),
            lease_duration_seconds: 1,
            acquire_time: now,
            renew_time: now,
            leader_transitions: current.record.leader_transitions,
        };
        self.lock.update(&released, current.version).await?;
        info!(lease = %self.config.describe(), "Released leader lease");
        Ok(true)
    }

    fn enter_renewing(&self) {
        if self.state() == LeaderState::Leading {
            self.transition(LeaderState::Renewing);
        }
    }

    fn transition(&self, next: LeaderState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(
                identity = %self.config.identity,
                lease = %self.config.describe(),
                from = ?previous,
                to = ?next,
                "Leader election state changed"
            );
        }
    }

    fn report_leading(&self, leading: bool) {
        if let Some(metrics) = &self.metrics {
            metrics.set_leader_status(&self.config.describe(), leading);
        }
    }
}

/// Whole seconds, rounded up, so the recorded lease never understates the real one.
fn lease_seconds(lease: Duration) -> u64 {
    let secs = lease.as_secs();
    if lease.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs.max(1)
    }
}
