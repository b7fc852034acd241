use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use fleet_descheduler::core::activation::MainLoop;
use fleet_descheduler::core::cluster::{
    LeaderContext, LeadershipHandler, LockError, LockRecord, LockResult, ResourceLock, StopReason,
    VersionedRecord,
};

/// Lock wrapper that fails every call while partitioned
pub struct FlakyLock {
    inner: Arc<dyn ResourceLock>,
    partitioned: AtomicBool,
    calls: AtomicUsize,
    update_reply_delay: Mutex<Option<Duration>>,
}

impl FlakyLock {
    pub fn new(inner: Arc<dyn ResourceLock>) -> Self {
        Self {
            inner,
            partitioned: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
            update_reply_delay: Mutex::new(None),
        }
    }

    /// Commit the next successful update right away but hold its reply back.
    pub fn delay_next_update_reply(&self, delay: Duration) {
        *self.update_reply_delay.lock().unwrap() = Some(delay);
    }

    pub fn set_partitioned(&self, partitioned: bool) {
        self.partitioned.store(partitioned, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn check(&self) -> LockResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.partitioned.load(Ordering::SeqCst) {
            Err(LockError::Transient("backend unreachable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ResourceLock for FlakyLock {
    async fn get(&self) -> LockResult<Option<VersionedRecord>> {
        self.check()?;
        self.inner.get().await
    }

    async fn create(&self, record: &LockRecord) -> LockResult<VersionedRecord> {
        self.check()?;
        self.inner.create(record).await
    }

    async fn update(&self, record: &LockRecord, version: u64) -> LockResult<VersionedRecord> {
        self.check()?;
        let updated = self.inner.update(record, version).await?;

        let delay = self.update_reply_delay.lock().unwrap().take();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(updated)
    }

    fn describe(&self) -> String {
        self.inner.describe()
    }
}

/// Tracks how many handlers across a test are leading at the same time
#[derive(Default)]
pub struct LeaderGauge {
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl LeaderGauge {
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    fn enter(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Leadership handler that records every callback
pub struct RecordingHandler {
    gauge: Arc<LeaderGauge>,
    started: AtomicUsize,
    stopped: Mutex<Vec<StopReason>>,
    new_leaders: Mutex<Vec<String>>,
}

impl RecordingHandler {
    pub fn new(gauge: Arc<LeaderGauge>) -> Arc<Self> {
        Arc::new(Self {
            gauge,
            started: AtomicUsize::new(0),
            stopped: Mutex::new(Vec::new()),
            new_leaders: Mutex::new(Vec::new()),
        })
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn stopped(&self) -> Vec<StopReason> {
        self.stopped.lock().unwrap().clone()
    }

    pub fn new_leaders(&self) -> Vec<String> {
        self.new_leaders.lock().unwrap().clone()
    }
}

#[async_trait]
impl LeadershipHandler for RecordingHandler {
    async fn on_started_leading(&self, ctx: LeaderContext) {
        self.started.fetch_add(1, Ordering::SeqCst);
        self.gauge.enter();
        ctx.cancel.cancelled().await;
        self.gauge.leave();
    }

    fn on_stopped_leading(&self, reason: StopReason) {
        self.stopped.lock().unwrap().push(reason);
    }

    fn on_new_leader(&self, identity: &str) {
        self.new_leaders.lock().unwrap().push(identity.to_string());
    }
}

/// Main loop that runs until cancelled
#[derive(Default)]
pub struct BlockingLoop {
    pub runs: AtomicUsize,
}

#[async_trait]
impl MainLoop for BlockingLoop {
    async fn run(&self, cancel: CancellationToken) {
        self.runs.fetch_add(1, Ordering::SeqCst);
        cancel.cancelled().await;
    }
}

/// Main loop that returns straight away
#[derive(Default)]
pub struct ExitingLoop {
    pub runs: AtomicUsize,
}

#[async_trait]
impl MainLoop for ExitingLoop {
    async fn run(&self, _cancel: CancellationToken) {
        self.runs.fetch_add(1, Ordering::SeqCst);
    }
}
