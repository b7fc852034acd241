//! Process identity used as the holder value of the leader lock.

use std::fmt;

use uuid::Uuid;

use crate::error::{AppError, Result};

/// Opaque token distinguishing this process from every other replica.
///
/// Composed of a host discriminator and a random uniquifier so that two
/// processes on the same host never share an identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity(String);

impl Identity {
    /// Generate an identity for the local host.
    pub fn generate() -> Result<Self> {
        let hostname = hostname::get()
            .map_err(|e| AppError::InternalError(format!("unable to get hostname: {}", e)))?
            .to_string_lossy()
            .to_string();

        Ok(Self::for_host(&hostname))
    }

    /// Generate an identity for an explicit host discriminator.
    pub fn for_host(host: &str) -> Self {
        Self(format!("{}_{}", host, Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}
