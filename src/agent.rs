//! Update orchestrator: decides when to check, drives a cycle end to end and
//! guarantees at most one cycle at a time.
//!
//! ```text
//!            due & not busy              newer
//!   Idle ───────────────────► Checking ─────────► Downloading ──► Rebooting
//!    ▲                            │                    │          (terminal)
//!    └──── failed / up to date ───┘◄──── failed ───────┘
//! ```

use crate::config::{AgentConfig, ConnectConfig, WifiCredentials};
use crate::error::{Error, Result};
use crate::event::{notify, Notification, Observer};
use crate::platform::host::{SystemClock, TokioYield};
use crate::platform::{
    Clock, CooperativeYield, FlashWriter, Network, Restart, TimeSync, TransportProvider,
};
use crate::upgrade::{
    version, Cancellation, ConnectionSelector, CycleOutcome, FlashInstaller, InstallOptions,
    MetadataFetcher, UpdateState,
};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, warn};

/// Interval between [`UpdateAgent::run`] polls, measured on the injected clock.
pub const POLL_TICK: Duration = Duration::from_secs(1);

/// Reported when the endpoint offers a newer version.
pub const UPDATE_AVAILABLE: &str = "Update available";

/// Reported when the running firmware is current.
pub const NO_UPDATE: &str = "No update available";

/// Reported after commit, before the restart delay.
pub const RESTARTING: &str = "Update complete, restarting...";

/// What a call to [`UpdateAgent::poll`] did.
#[derive(Debug)]
pub enum PollOutcome {
    /// The check interval has not elapsed.
    NotDue,
    /// Another cycle is in flight.
    Busy,
    /// A restart has been requested; no further cycles run.
    Rebooting,
    /// A cycle ran to completion.
    Completed(CycleOutcome),
}

/// Builder for an [`UpdateAgent`].
///
/// Network, transports, flash and restart are required. Clock and yield
/// default to the tokio host implementations; time sync is optional.
pub struct AgentBuilder {
    config: AgentConfig,
    network: Option<Box<dyn Network>>,
    transports: Option<Arc<dyn TransportProvider>>,
    flash: Option<Box<dyn FlashWriter>>,
    clock: Option<Arc<dyn Clock>>,
    yielder: Option<Arc<dyn CooperativeYield>>,
    time_sync: Option<Arc<dyn TimeSync>>,
    restart: Option<Arc<dyn Restart>>,
    observer: Option<Observer>,
}

impl AgentBuilder {
    /// Create a new builder with the given configuration.
    #[must_use]
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            network: None,
            transports: None,
            flash: None,
            clock: None,
            yielder: None,
            time_sync: None,
            restart: None,
            observer: None,
        }
    }

    /// Network link used before each check.
    #[must_use]
    pub fn network(mut self, network: impl Network + 'static) -> Self {
        self.network = Some(Box::new(network));
        self
    }

    /// Opens plain and encrypted transports.
    #[must_use]
    pub fn transports(mut self, provider: impl TransportProvider + 'static) -> Self {
        self.transports = Some(Arc::new(provider));
        self
    }

    /// Flash slot receiving new images.
    #[must_use]
    pub fn flash(mut self, flash: impl FlashWriter + 'static) -> Self {
        self.flash = Some(Box::new(flash));
        self
    }

    /// Monotonic clock for scheduling, backoff and stall detection.
    #[must_use]
    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    /// Scheduling point awaited between download chunks.
    #[must_use]
    pub fn yielder(mut self, yielder: impl CooperativeYield + 'static) -> Self {
        self.yielder = Some(Arc::new(yielder));
        self
    }

    /// Wall-clock sync run once the network first comes up.
    #[must_use]
    pub fn time_sync(mut self, time_sync: impl TimeSync + 'static) -> Self {
        self.time_sync = Some(Arc::new(time_sync));
        self
    }

    /// Restart invoked after a committed install.
    #[must_use]
    pub fn restart(mut self, restart: impl Restart + 'static) -> Self {
        self.restart = Some(Arc::new(restart));
        self
    }

    /// Observer receiving status notifications.
    #[must_use]
    pub fn observer(mut self, observer: Observer) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Build the agent.
    ///
    /// The first check becomes due one interval after this call.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration is invalid or a
    /// required capability was not supplied.
    pub fn build(self) -> Result<UpdateAgent> {
        self.config.validate()?;

        let network = self.network.ok_or_else(|| missing("network"))?;
        let transports = self.transports.ok_or_else(|| missing("transports"))?;
        let flash = self.flash.ok_or_else(|| missing("flash"))?;
        let restart = self.restart.ok_or_else(|| missing("restart"))?;
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock::new()) as Arc<dyn Clock>);
        let yielder = self
            .yielder
            .unwrap_or_else(|| Arc::new(TokioYield) as Arc<dyn CooperativeYield>);

        info!(
            "Building update agent: version {}, endpoint {}, interval {:?}",
            self.config.current_version,
            self.config.endpoint,
            self.config.check_interval()
        );

        let last_check = clock.now();
        Ok(UpdateAgent {
            inner: Arc::new(Inner {
                config: RwLock::new(self.config),
                observer: RwLock::new(self.observer),
                state: RwLock::new(UpdateState::Idle),
                last_check: Mutex::new(last_check),
                in_progress: AtomicBool::new(false),
                clock_synced: AtomicBool::new(false),
                network: tokio::sync::Mutex::new(network),
                flash: tokio::sync::Mutex::new(flash),
                transports,
                clock,
                yielder,
                time_sync: self.time_sync,
                restart,
            }),
        })
    }
}

fn missing(capability: &str) -> Error {
    Error::Config(format!("no {capability} capability supplied"))
}

struct Inner {
    config: RwLock<AgentConfig>,
    observer: RwLock<Option<Observer>>,
    state: RwLock<UpdateState>,
    last_check: Mutex<Duration>,
    in_progress: AtomicBool,
    clock_synced: AtomicBool,
    network: tokio::sync::Mutex<Box<dyn Network>>,
    flash: tokio::sync::Mutex<Box<dyn FlashWriter>>,
    transports: Arc<dyn TransportProvider>,
    clock: Arc<dyn Clock>,
    yielder: Arc<dyn CooperativeYield>,
    time_sync: Option<Arc<dyn TimeSync>>,
    restart: Arc<dyn Restart>,
}

/// Claim on the single update session. Released on drop.
struct Session {
    inner: Arc<Inner>,
}

impl Drop for Session {
    fn drop(&mut self) {
        {
            let mut state = self.inner.state.write();
            if *state != UpdateState::Rebooting {
                *state = UpdateState::Idle;
            }
        }
        self.inner.in_progress.store(false, Ordering::Release);
    }
}

/// Handle to a cycle running as a background task.
pub struct CycleTask {
    cancel: watch::Sender<bool>,
    handle: JoinHandle<CycleOutcome>,
}

impl CycleTask {
    /// Ask the cycle to stop. A download in flight is aborted.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    /// Whether the task has finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the cycle to finish.
    ///
    /// # Errors
    ///
    /// Returns the join error if the task panicked or was aborted.
    pub async fn join(self) -> std::result::Result<CycleOutcome, JoinError> {
        self.handle.await
    }
}

/// The update agent.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct UpdateAgent {
    inner: Arc<Inner>,
}

impl UpdateAgent {
    /// Start building an agent.
    #[must_use]
    pub fn builder(config: AgentConfig) -> AgentBuilder {
        AgentBuilder::new(config)
    }

    /// Replace the configuration. A cycle already running keeps the
    /// configuration it started with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the new configuration is invalid.
    pub fn configure(&self, config: AgentConfig) -> Result<()> {
        config.validate()?;
        info!("Configuration replaced");
        *self.inner.config.write() = config;
        Ok(())
    }

    /// Current configuration.
    #[must_use]
    pub fn config(&self) -> AgentConfig {
        self.inner.config.read().clone()
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> UpdateState {
        *self.inner.state.read()
    }

    /// Whether a cycle is in flight.
    #[must_use]
    pub fn is_updating(&self) -> bool {
        self.inner.in_progress.load(Ordering::Acquire)
    }

    /// Change the check interval for subsequent cycles.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an interval under one millisecond.
    pub fn set_check_interval(&self, interval: Duration) -> Result<()> {
        let ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        if ms == 0 {
            return Err(Error::Config(
                "check interval must be at least 1ms".to_string(),
            ));
        }
        self.inner.config.write().check_interval_ms = ms;
        debug!("Check interval set to {:?}", interval);
        Ok(())
    }

    /// Replace the observer. `None` silences notifications.
    pub fn set_observer(&self, observer: Option<Observer>) {
        *self.inner.observer.write() = observer;
    }

    /// Whether the network link is up.
    pub async fn is_connected(&self) -> bool {
        self.inner.network.lock().await.is_connected()
    }

    /// Drop the network link. The next cycle reconnects.
    pub async fn disconnect(&self) {
        self.inner.network.lock().await.disconnect();
        info!("Network disconnected");
    }

    /// Bring the agent up: connect when `auto_connect` is set. The wall
    /// clock is synced once the link is up.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionFailed`] if the link does not come up
    /// within the configured attempts.
    pub async fn start(&self) -> Result<()> {
        let config = self.config();
        if !config.auto_connect {
            info!("Auto-connect disabled, skipping network join");
            return Ok(());
        }

        if let Err(e) = self.ensure_connected(&config).await {
            warn!("Start failed: {}", e);
            self.emit(&Notification::status(e.status_text()));
            return Err(e);
        }
        Ok(())
    }

    /// Run a cycle if one is due.
    ///
    /// Returns immediately with [`PollOutcome::NotDue`] when the interval
    /// has not elapsed since the last check. Failures are reported to the
    /// observer and returned inside [`PollOutcome::Completed`].
    pub async fn poll(&self) -> PollOutcome {
        match self.claim(false) {
            Ok(session) => {
                PollOutcome::Completed(self.run_session(session, &Cancellation::never()).await)
            }
            Err(refused) => refused,
        }
    }

    /// Run a cycle now, ignoring the interval. Still refuses while a cycle
    /// is in flight or after a restart was requested.
    pub async fn check_now(&self) -> PollOutcome {
        match self.claim(true) {
            Ok(session) => {
                PollOutcome::Completed(self.run_session(session, &Cancellation::never()).await)
            }
            Err(refused) => refused,
        }
    }

    /// Decide like [`UpdateAgent::poll`], but run the cycle as a spawned
    /// task.
    ///
    /// # Errors
    ///
    /// Returns the refusal ([`PollOutcome::NotDue`], [`PollOutcome::Busy`]
    /// or [`PollOutcome::Rebooting`]) when no cycle was started.
    pub fn try_start_cycle(&self) -> std::result::Result<CycleTask, PollOutcome> {
        let session = self.claim(false)?;
        let (cancel, signal) = Cancellation::channel();
        let agent = self.clone();
        let handle = tokio::spawn(async move { agent.run_session(session, &signal).await });
        Ok(CycleTask { cancel, handle })
    }

    /// Poll every [`POLL_TICK`] until `shutdown` flips to `true` or a
    /// restart is requested.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Update agent running, checking every {:?}",
            self.config().check_interval()
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            if matches!(self.poll().await, PollOutcome::Rebooting) {
                info!("Restart pending, leaving poll loop");
                break;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                () = self.inner.clock.sleep(POLL_TICK) => {}
            }
        }

        info!("Update agent stopped");
    }

    fn is_due(&self) -> bool {
        let interval = self.inner.config.read().check_interval();
        let last_check = *self.inner.last_check.lock();
        self.inner.clock.now().saturating_sub(last_check) >= interval
    }

    fn claim(&self, force: bool) -> std::result::Result<Session, PollOutcome> {
        if self.state() == UpdateState::Rebooting {
            return Err(PollOutcome::Rebooting);
        }
        if self.is_updating() {
            return Err(PollOutcome::Busy);
        }
        if !force && !self.is_due() {
            return Err(PollOutcome::NotDue);
        }
        if self
            .inner
            .in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(PollOutcome::Busy);
        }

        let session = Session {
            inner: Arc::clone(&self.inner),
        };
        if self.state() == UpdateState::Rebooting {
            return Err(PollOutcome::Rebooting);
        }
        Ok(session)
    }

    async fn run_session(&self, session: Session, cancel: &Cancellation) -> CycleOutcome {
        let config = self.config();
        let outcome = match self.cycle(&config, cancel).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Update cycle failed: {}", e);
                self.emit(&Notification::status(e.status_text()));
                CycleOutcome::Failed(e)
            }
        };

        *self.inner.last_check.lock() = self.inner.clock.now();
        drop(session);
        debug!("Cycle finished, state {}", self.state());
        outcome
    }

    async fn cycle(&self, config: &AgentConfig, cancel: &Cancellation) -> Result<CycleOutcome> {
        self.ensure_connected(config).await?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        self.set_state(UpdateState::Checking);
        let selector =
            ConnectionSelector::new(Arc::clone(&self.inner.transports), config.verify_tls);
        let metadata = MetadataFetcher::new(&selector, config.metadata_request)
            .with_body_limit(config.metadata_limit)
            .fetch(&config.endpoint, &config.device_id)
            .await?;

        if !version::is_newer(&config.current_version, &metadata.version)? {
            info!(
                "Firmware {} is current (endpoint offers {})",
                config.current_version, metadata.version
            );
            self.emit(&Notification::status(NO_UPDATE));
            return Ok(CycleOutcome::UpToDate {
                current: config.current_version.clone(),
                available: metadata.version,
            });
        }

        info!(
            "Update available: {} -> {}",
            config.current_version, metadata.version
        );
        self.emit(&Notification::status(UPDATE_AVAILABLE));
        self.set_state(UpdateState::Downloading);

        let observer = self.inner.observer.read().clone();
        let options = InstallOptions {
            chunk_size: config.download.chunk_size,
            inactivity_timeout: Duration::from_secs(config.download.inactivity_timeout_secs),
        };
        let report = {
            let mut flash = self.inner.flash.lock().await;
            FlashInstaller::new(
                &selector,
                self.inner.clock.as_ref(),
                self.inner.yielder.as_ref(),
                observer.as_ref(),
                options,
            )
            .install(&metadata.firmware_url, &mut **flash, cancel)
            .await?
        };

        self.set_state(UpdateState::Rebooting);
        self.emit(&Notification::status(RESTARTING));
        self.inner
            .clock
            .sleep(Duration::from_millis(config.download.restart_delay_ms))
            .await;
        info!("Restarting into firmware {}", metadata.version);
        self.inner.restart.restart();

        Ok(CycleOutcome::Installed {
            version: metadata.version,
            bytes: report.bytes,
        })
    }

    async fn ensure_connected(&self, config: &AgentConfig) -> Result<()> {
        let mut network = self.inner.network.lock().await;
        if !network.is_connected() {
            self.connect_with_retry(&mut **network, &config.wifi, &config.connect)
                .await?;
        }
        drop(network);
        self.sync_clock_once().await;
        Ok(())
    }

    /// Sync the wall clock unless a previous sync succeeded. A failure is
    /// logged and retried on the next call.
    async fn sync_clock_once(&self) {
        let Some(time_sync) = &self.inner.time_sync else {
            return;
        };
        if self.inner.clock_synced.load(Ordering::Acquire) {
            return;
        }
        match time_sync.sync().await {
            Ok(()) => {
                self.inner.clock_synced.store(true, Ordering::Release);
                debug!("Wall clock synchronised");
            }
            Err(e) => warn!("Time sync failed: {}", e),
        }
    }

    async fn connect_with_retry(
        &self,
        network: &mut dyn Network,
        credentials: &WifiCredentials,
        policy: &ConnectConfig,
    ) -> Result<()> {
        info!("Connecting to network {:?}", credentials.ssid);
        let backoff = Duration::from_millis(policy.backoff_ms);
        let mut joined = false;

        for attempt in 1..=policy.attempts {
            if !joined {
                match network.connect(credentials).await {
                    Ok(()) => joined = true,
                    Err(e) => debug!("Connect attempt {} rejected: {}", attempt, e),
                }
            }
            if network.is_connected() {
                info!("Network connected after {} attempt(s)", attempt);
                return Ok(());
            }
            if attempt < policy.attempts {
                self.inner.clock.sleep(backoff).await;
            }
        }

        warn!("Network connection failed after {} attempts", policy.attempts);
        Err(Error::ConnectionFailed {
            attempts: policy.attempts,
        })
    }

    fn set_state(&self, next: UpdateState) {
        let previous = std::mem::replace(&mut *self.inner.state.write(), next);
        info!("State {} -> {}", previous, next);
    }

    fn emit(&self, notification: &Notification) {
        let observer = self.inner.observer.read().clone();
        notify(observer.as_ref(), notification);
    }
}
