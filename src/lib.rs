//! # bitflash
//!
//! Over-the-air firmware update agent.
//!
//! The agent periodically asks an update endpoint which firmware version the
//! device should run. When the endpoint advertises something newer than the
//! running build, the image is streamed into a flash slot, committed, and
//! the device restarts into it.
//!
//! ## Architecture
//!
//! - [`upgrade`]: connection selection, version checks, version comparison
//!   and the flash installer
//! - [`agent`]: the orchestrator deciding when to check and enforcing a
//!   single update cycle at a time
//! - [`platform`]: capability traits (network, transports, flash, clock,
//!   restart) plus host implementations
//!
//! ## Example
//!
//! ```rust,no_run
//! use bitflash::platform::flash::FileFlash;
//! use bitflash::platform::host::{HostNetwork, ProcessRestart};
//! use bitflash::platform::http::HttpTransportProvider;
//! use bitflash::{AgentConfig, PollOutcome, UpdateAgent};
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AgentConfig {
//!     endpoint: "https://updates.example.com/check".to_string(),
//!     current_version: "1.0.0".to_string(),
//!     ..AgentConfig::default()
//! };
//! let flash = FileFlash::new(config.flash.image_path.clone(), config.flash.capacity);
//!
//! let agent = UpdateAgent::builder(config)
//!     .network(HostNetwork::new())
//!     .transports(HttpTransportProvider::new(Duration::from_secs(30))?)
//!     .flash(flash)
//!     .restart(ProcessRestart)
//!     .build()?;
//!
//! agent.start().await?;
//! if let PollOutcome::Completed(outcome) = agent.check_now().await {
//!     println!("{outcome:?}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod config;
pub mod error;
pub mod event;
pub mod platform;
pub mod upgrade;

pub use agent::{AgentBuilder, CycleTask, PollOutcome, UpdateAgent};
pub use config::{AgentConfig, MetadataRequest, WifiCredentials};
pub use error::{Error, PlatformError, RequestFailure, Result};
pub use event::{Notification, Observer};
pub use upgrade::{CycleOutcome, UpdateState};
