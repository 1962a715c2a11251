//! Host implementations of the clock, yield, network, time-sync and
//! restart capabilities.

use super::{Clock, CooperativeYield, Network, PlatformResult, Restart, TimeSync};
use crate::config::WifiCredentials;
use crate::error::PlatformError;
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Monotonic clock backed by tokio's timer.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    /// Clock whose origin is now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Yields to the tokio scheduler.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioYield;

#[async_trait]
impl CooperativeYield for TokioYield {
    async fn yield_now(&self) {
        tokio::task::yield_now().await;
    }
}

/// Network on a host whose link is managed by the operating system.
///
/// `connect` only records a logical connection; the OS owns the real link.
#[derive(Debug, Default)]
pub struct HostNetwork {
    connected: bool,
}

impl HostNetwork {
    /// Start disconnected.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Network for HostNetwork {
    async fn connect(&mut self, credentials: &WifiCredentials) -> PlatformResult<()> {
        if !credentials.ssid.is_empty() {
            debug!("Host network ignores SSID {:?}", credentials.ssid);
        }
        self.connected = true;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }
}

/// Smallest epoch time treated as a synchronised clock (16 hours after 1970).
const MIN_SANE_EPOCH_SECS: i64 = 8 * 3600 * 2;

/// Waits for the system wall clock to leave the epoch.
#[derive(Debug, Clone)]
pub struct SystemTimeSync {
    poll_interval: Duration,
    max_wait: Duration,
}

impl SystemTimeSync {
    /// Poll every `poll_interval`, giving up after `max_wait`.
    #[must_use]
    pub fn new(poll_interval: Duration, max_wait: Duration) -> Self {
        Self {
            poll_interval,
            max_wait,
        }
    }
}

impl Default for SystemTimeSync {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(60))
    }
}

#[async_trait]
impl TimeSync for SystemTimeSync {
    async fn sync(&self) -> PlatformResult<()> {
        let started = Instant::now();
        loop {
            let now = chrono::Utc::now();
            if now.timestamp() >= MIN_SANE_EPOCH_SECS {
                info!("Wall clock synchronised: {}", now.to_rfc3339());
                return Ok(());
            }
            if started.elapsed() >= self.max_wait {
                return Err(PlatformError::new(format!(
                    "wall clock still at {} after {:?}",
                    now.to_rfc3339(),
                    self.max_wait
                )));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

/// Restarts by exiting the process; the service manager starts the new image.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRestart;

impl Restart for ProcessRestart {
    fn restart(&self) {
        warn!("Restarting: exiting so the service manager boots the new image");
        std::process::exit(0);
    }
}
