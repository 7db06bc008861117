//! # camrelay
//!
//! Camera pipeline supervisor for vehicle deployments.
//!
//! Every configured camera gets a push relay and a segmented recorder, each a
//! supervised transcoder process that is restarted after failures and
//! stopped gracefully on shutdown. A WebSocket live-view hub starts a
//! still-frame extractor for a camera only while someone is watching it.
//!
//! ```no_run
//! use camrelay::{AppConfig, LiveViewHub, LiveViewServer, PipelineService, ServerConfig};
//! use camrelay::process::RelaySettings;
//!
//! # async fn example() -> camrelay::Result<()> {
//! let config = AppConfig::load("config.txt")?;
//!
//! let mut relays = PipelineService::relays(&config, &RelaySettings::default())?;
//! let mut recorders = PipelineService::recorders(&config);
//!
//! let server = LiveViewServer::bind(ServerConfig::from_env(), LiveViewHub::new(&config)).await?;
//! server.run_until(async { let _ = tokio::signal::ctrl_c().await; }).await?;
//!
//! relays.stop_all().await;
//! recorders.stop_all().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod hub;
pub mod pipeline;
pub mod process;
pub mod server;
pub mod service;

pub use config::{AppConfig, CameraSource};
pub use error::{Error, Result};
pub use hub::LiveViewHub;
pub use pipeline::{FrameExtractor, Pipeline, SegmentRecorder, StreamRelay};
pub use process::{PipelineFailure, ProcessEvent, ProcessState, SupervisedProcess};
pub use server::{LiveViewServer, ServerConfig};
pub use service::PipelineService;
