//! Registration with the host-side bridge daemon
//!
//! The daemon's client library is opaque to the broker: it connects with a
//! description of this process, exposes one pollable descriptor, and hands
//! over a forwarded debugger connection whenever that descriptor is
//! readable. Connecting is retried forever with a capped backoff until the
//! worker is cancelled.

use std::io;
use std::os::fd::{OwnedFd, RawFd};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use adblink_utils::Result;

use crate::config::{ProcessConfig, RetryConfig};

/// What the bridge is told about this process on registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub debuggable: bool,
    pub profileable: bool,
    /// Instruction set name, e.g. `arm64`
    pub architecture: String,
}

impl ProcessInfo {
    /// Describe the current process
    pub fn current(config: &ProcessConfig) -> Self {
        Self {
            pid: std::process::id(),
            debuggable: config.debuggable,
            profileable: config.profileable,
            architecture: config.architecture.clone(),
        }
    }
}

/// An open registration with the bridge daemon
///
/// Dropping the client destroys the registration.
pub trait BridgeClient: Send {
    /// Descriptor that becomes readable when a connection is forwarded or
    /// the daemon goes away
    fn pollable_fd(&self) -> RawFd;

    /// Take the next forwarded debugger connection
    ///
    /// Must not block: returns `WouldBlock` when nothing is pending. Any
    /// other error means the registration is dead.
    fn receive_forwarded_fd(&mut self) -> io::Result<OwnedFd>;
}

/// Factory for bridge registrations
pub trait BridgeConnector: Send + Sync {
    /// Register this process; an error means "retry later"
    fn connect(&self, info: &ProcessInfo) -> Result<Box<dyn BridgeClient>>;
}

/// Registration retry delays: grows by half of itself, capped
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            current: initial.min(max),
            max,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            Duration::from_millis(config.initial_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
    }

    /// Delay to wait after the current failure
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current + self.current / 2).min(self.max);
        delay
    }
}

/// Connect to the bridge, retrying until success or cancellation
///
/// Returns `None` only when `cancel` fires.
pub async fn connect_with_backoff(
    connector: &dyn BridgeConnector,
    info: &ProcessInfo,
    retry: &RetryConfig,
    cancel: &CancellationToken,
) -> Option<Box<dyn BridgeClient>> {
    let mut backoff = Backoff::from_config(retry);
    let mut attempts: u32 = 0;

    while !cancel.is_cancelled() {
        attempts += 1;
        match connector.connect(info) {
            Ok(client) => {
                info!(pid = info.pid, attempts, "Registered with bridge daemon");
                return Some(client);
            }
            Err(e) => {
                let delay = backoff.next_delay();
                if !e.is_retryable() {
                    error!(error = %e, "Unexpected bridge registration failure, retrying");
                } else if attempts == 1 {
                    warn!(error = %e, "Bridge daemon unavailable, retrying");
                }
                debug!(
                    error = %e,
                    attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Bridge connect failed"
                );
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    debug!("Bridge registration abandoned: shutting down");
    None
}
