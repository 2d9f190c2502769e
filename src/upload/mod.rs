//! Frame upload to the remote collector.

pub mod codec;
mod transport;
mod worker;

pub use transport::{CollectorConnector, FrameUplink, HttpUplink, TcpCollector};
pub use worker::{FrameUploader, UploadStats, UploadStatsSnapshot, UploadStream};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connect to {0} timed out")]
    ConnectTimeout(String),

    #[error("write stalled for {0:?}")]
    WriteTimeout(std::time::Duration),

    #[error("short write: {written}/{expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[error("upload stream not connected")]
    NotConnected,
}
