//! WebSocket transport for the live-view hub

pub mod config;
pub mod connection;
pub mod listener;

pub use config::ServerConfig;
pub use listener::LiveViewServer;
