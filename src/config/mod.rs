//! Configuration

pub mod schema;

pub use schema::{AppConfig, AudioConfig, NetworkConfig, VideoConfig};
