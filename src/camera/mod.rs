//! Frame source: the camera capability plus a pool-bounded buffer hand-off
//!
//! The driver hands out frames from a small fixed pool (`fb_count`). Two
//! workers pull frames concurrently, so acquisition is serialized behind a
//! mutex and every [`FrameBuffer`] returns its slot to the pool when dropped,
//! whichever path the holder leaves by.

mod directory;
mod synthetic;

pub use directory::DirectoryCamera;
pub use synthetic::SyntheticCamera;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::CameraConfig;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("camera initialisation failed: {0}")]
    InitFailed(String),

    #[error("frame pool exhausted ({outstanding}/{capacity} buffers outstanding)")]
    Exhausted { outstanding: usize, capacity: usize },

    #[error("camera produced no frame")]
    Unavailable,
}

/// Camera driver capability.
///
/// `grab` returns one encoded frame, or `None` when the sensor has nothing
/// ready. Drivers are only ever called with the pool lock held.
pub trait CameraDriver: Send {
    fn init(&mut self) -> Result<(), FrameError>;

    fn grab(&mut self) -> Option<Bytes>;

    fn describe(&self) -> String;
}

/// Builds the driver named by `camera.source`.
pub fn driver_from_config(config: &CameraConfig) -> Box<dyn CameraDriver> {
    match config.source.as_str() {
        "synthetic" => Box::new(SyntheticCamera::new(
            config.width,
            config.height,
            config.jpeg_quality,
        )),
        dir => Box::new(DirectoryCamera::new(dir)),
    }
}

/// Shared, cloneable handle on the camera and its buffer pool
#[derive(Clone)]
pub struct FramePool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    driver: Mutex<Box<dyn CameraDriver>>,
    capacity: usize,
    outstanding: AtomicUsize,
    sequence: AtomicU64,
    acquired: AtomicU64,
    exhausted: AtomicU64,
    unavailable: AtomicU64,
}

/// Pool counters for the health report
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PoolSnapshot {
    pub capacity: usize,
    pub outstanding: usize,
    pub acquired: u64,
    pub exhausted: u64,
    pub unavailable: u64,
}

impl FramePool {
    /// Initialises the driver and wraps it in a pool of `fb_count` buffers.
    pub fn start(mut driver: Box<dyn CameraDriver>, fb_count: usize) -> Result<Self, FrameError> {
        if fb_count == 0 {
            return Err(FrameError::InitFailed("fb_count must be > 0".to_string()));
        }

        driver.init()?;
        info!(camera = %driver.describe(), fb_count, "Camera initialised");

        Ok(Self {
            inner: Arc::new(PoolInner {
                driver: Mutex::new(driver),
                capacity: fb_count,
                outstanding: AtomicUsize::new(0),
                sequence: AtomicU64::new(0),
                acquired: AtomicU64::new(0),
                exhausted: AtomicU64::new(0),
                unavailable: AtomicU64::new(0),
            }),
        })
    }

    /// Takes one frame from the camera.
    ///
    /// Fails with [`FrameError::Exhausted`] when every buffer is already out,
    /// and with [`FrameError::Unavailable`] when the driver yields nothing.
    /// Neither failure consumes a buffer.
    pub fn acquire(&self) -> Result<FrameBuffer, FrameError> {
        let inner = &self.inner;
        let mut driver = inner.driver.lock();

        let outstanding = inner.outstanding.load(Ordering::Acquire);
        if outstanding >= inner.capacity {
            inner.exhausted.fetch_add(1, Ordering::Relaxed);
            return Err(FrameError::Exhausted {
                outstanding,
                capacity: inner.capacity,
            });
        }

        let Some(data) = driver.grab() else {
            inner.unavailable.fetch_add(1, Ordering::Relaxed);
            return Err(FrameError::Unavailable);
        };

        // incremented under the driver lock so check-then-take cannot race
        inner.outstanding.fetch_add(1, Ordering::AcqRel);
        inner.acquired.fetch_add(1, Ordering::Relaxed);
        let sequence = inner.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(sequence, bytes = data.len(), "Frame acquired");

        Ok(FrameBuffer {
            data,
            sequence,
            pool: Arc::clone(&self.inner),
        })
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            capacity: self.inner.capacity,
            outstanding: self.outstanding(),
            acquired: self.inner.acquired.load(Ordering::Relaxed),
            exhausted: self.inner.exhausted.load(Ordering::Relaxed),
            unavailable: self.inner.unavailable.load(Ordering::Relaxed),
        }
    }
}

/// One frame on loan from the pool; the slot is returned on drop.
pub struct FrameBuffer {
    data: Bytes,
    sequence: u64,
    pool: Arc<PoolInner>,
}

impl FrameBuffer {
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Shared handle on the frame bytes that outlives the loan.
    pub fn bytes(&self) -> Bytes {
        self.data.clone()
    }

    /// Returns the buffer to the pool now rather than at end of scope.
    pub fn release(self) {}
}

impl Drop for FrameBuffer {
    fn drop(&mut self) {
        self.pool.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for FramePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramePool")
            .field("capacity", &self.inner.capacity)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

impl std::fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("sequence", &self.sequence)
            .field("len", &self.data.len())
            .finish()
    }
}
