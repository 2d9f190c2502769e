//! RTSP-style streaming responder: a minimal text control protocol whose
//! PLAY pushes multipart JPEG frames down the same connection.

pub mod protocol;
mod sdp;
mod server;
mod session;

pub use server::{
    bind_with_retry, run_responder, SessionSlots, SlotGuard, StreamStats, StreamStatsSnapshot,
    StreamingResponder,
};
pub use session::{SessionContext, SessionState, StreamSession};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RtspError {
    #[error("failed to bind {0}: {1}")]
    Bind(String, #[source] std::io::Error),
}
