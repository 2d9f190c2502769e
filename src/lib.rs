//! Networked camera node runtime
//!
//! Brings a wireless link up and keeps it up, takes commands over a
//! publish/subscribe broker, pushes JPEG frames to a remote collector and
//! serves an RTSP-style live stream to local clients, all sharing one
//! bounded pool of frame buffers:
//!
//! - [`network::ConnectivityManager`] owns the link state machine
//! - [`command::CommandChannel`] keeps the broker session and dispatches commands
//! - [`upload::FrameUploader`] streams frames to the collector
//! - [`rtsp::StreamingResponder`] serves up to `max-clients` viewers
//! - [`supervisor::Supervisor`] boots the camera and places the workers
//!
//! # Example
//!
//! ```no_run
//! use camnode::config::Config;
//! use camnode::supervisor::{Capabilities, Supervisor};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = Config::load("camnode.toml")?;
//! let supervisor = Supervisor::start(&config, Capabilities::from_config(&config))?;
//! tokio::signal::ctrl_c().await?;
//! supervisor.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod camera;
pub mod command;
pub mod config;
pub mod control;
pub mod network;
pub mod retry;
pub mod rtsp;
pub mod shutdown;
pub mod stats;
pub mod supervisor;
pub mod upload;

#[cfg(test)]
mod testing;

// Re-exports for convenience
pub use camera::{FrameBuffer, FrameError, FramePool};
pub use config::Config;
pub use control::{CaptureRequest, StreamToggle};
pub use network::{ConnectivityManager, LinkState};
pub use shutdown::StopSignal;
pub use supervisor::{Capabilities, HealthReport, Supervisor, SupervisorError};
