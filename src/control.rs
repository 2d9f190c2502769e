//! Process-wide control flags flipped by broker commands and read by the
//! frame workers on every cycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// "Streaming enabled" switch shared by the command channel, the uploader
/// and the streaming responder.
#[derive(Debug, Clone)]
pub struct StreamToggle(Arc<AtomicBool>);

impl StreamToggle {
    pub fn new(enabled: bool) -> Self {
        Self(Arc::new(AtomicBool::new(enabled)))
    }

    pub fn is_enabled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Sets the flag and returns the previous value.
    pub fn set(&self, enabled: bool) -> bool {
        self.0.swap(enabled, Ordering::AcqRel)
    }

    pub fn enable(&self) -> bool {
        self.set(true)
    }

    pub fn disable(&self) -> bool {
        self.set(false)
    }
}

impl Default for StreamToggle {
    fn default() -> Self {
        Self::new(true)
    }
}

/// One-shot snapshot request raised by the `capture` command.
#[derive(Debug, Clone, Default)]
pub struct CaptureRequest(Arc<AtomicBool>);

impl CaptureRequest {
    pub fn request(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_pending(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Clears the request, returning whether one was pending.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}
