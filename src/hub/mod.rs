//! Live view over WebSocket
//!
//! Viewers pick one camera at a time; the hub runs one frame extractor per
//! watched camera and fans its images out to every subscriber.
//!
//! # Architecture
//!
//! ```text
//!                        Arc<LiveViewHub>
//!              ┌──────────────────────────────────┐
//!              │ viewers: conn → {outbox, camera} │
//!              │ registry: camera → {             │
//!              │   FrameExtractor,                │
//!              │   subscribers: conn → outbox,    │
//!              │ }                                │
//!              └────────────────┬─────────────────┘
//!                               │
//!     FrameExtractor events ──► forward_events ──► fan_out ──► outbox ──► socket
//! ```
//!
//! Frame payloads are `bytes::Bytes` and each frame is encoded once; every
//! subscriber receives a clone of the same text message.

pub mod error;
pub mod live_view;
pub mod protocol;
pub mod registry;

pub use error::HubError;
pub use live_view::{ExtractorFactory, FfmpegExtractors, LiveViewHub};
pub use protocol::{ClientAction, ServerMessage};
pub use registry::{ConnectionId, EntryStats, ExtractorRegistry, Outbox};
