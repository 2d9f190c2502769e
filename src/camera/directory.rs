//! Replays JPEG files from a directory as camera frames.

use bytes::Bytes;
use std::path::PathBuf;

use super::{CameraDriver, FrameError};

pub struct DirectoryCamera {
    dir: PathBuf,
    frames: Vec<Bytes>,
    next: usize,
}

impl DirectoryCamera {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            frames: Vec::new(),
            next: 0,
        }
    }
}

impl CameraDriver for DirectoryCamera {
    /// Loads every `.jpg`/`.jpeg` file, sorted by name. An unreadable or
    /// empty directory is an initialisation failure.
    fn init(&mut self) -> Result<(), FrameError> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| {
            FrameError::InitFailed(format!("cannot open {}: {}", self.dir.display(), e))
        })?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| ext.eq_ignore_ascii_case("jpg") || ext.eq_ignore_ascii_case("jpeg"))
                    .unwrap_or(false)
            })
            .collect();
        paths.sort();

        let mut frames = Vec::with_capacity(paths.len());
        for path in paths {
            let data = std::fs::read(&path).map_err(|e| {
                FrameError::InitFailed(format!("cannot read {}: {}", path.display(), e))
            })?;
            frames.push(Bytes::from(data));
        }

        if frames.is_empty() {
            return Err(FrameError::InitFailed(format!(
                "no JPEG frames in {}",
                self.dir.display()
            )));
        }

        self.frames = frames;
        self.next = 0;
        Ok(())
    }

    fn grab(&mut self) -> Option<Bytes> {
        if self.frames.is_empty() {
            return None;
        }
        let frame = self.frames[self.next].clone();
        self.next = (self.next + 1) % self.frames.len();
        Some(frame)
    }

    fn describe(&self) -> String {
        format!("directory {} ({} frames)", self.dir.display(), self.frames.len())
    }
}
