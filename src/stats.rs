//! Worker liveness probes and process memory sampling for the health report.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Liveness probe owned by one worker and observed by the supervisor.
#[derive(Debug)]
pub struct WorkerProbe {
    name: &'static str,
    running: AtomicBool,
    cycles: AtomicU64,
}

impl WorkerProbe {
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            running: AtomicBool::new(false),
            cycles: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Marks the worker running until the returned guard drops, panics included.
    pub fn enter(self: &Arc<Self>) -> ProbeGuard {
        self.running.store(true, Ordering::Release);
        ProbeGuard {
            probe: Arc::clone(self),
        }
    }

    pub fn tick(&self) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            name: self.name,
            running: self.is_running(),
            cycles: self.cycles(),
        }
    }
}

pub struct ProbeGuard {
    probe: Arc<WorkerProbe>,
}

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        self.probe.running.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub name: &'static str,
    pub running: bool,
    pub cycles: u64,
}

/// Resident and available memory in KiB, read from procfs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryUsage {
    pub resident_kb: Option<u64>,
    pub available_kb: Option<u64>,
}

impl MemoryUsage {
    /// Samples `/proc/self/status` and `/proc/meminfo`; fields stay `None`
    /// where procfs is unavailable.
    pub fn sample() -> Self {
        let resident_kb = std::fs::read_to_string("/proc/self/status")
            .ok()
            .and_then(|status| find_kb(&status, "VmRSS:"));
        let available_kb = std::fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|meminfo| find_kb(&meminfo, "MemAvailable:"));

        Self {
            resident_kb,
            available_kb,
        }
    }
}

fn find_kb(text: &str, key: &str) -> Option<u64> {
    text.lines()
        .find(|line| line.starts_with(key))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|value| value.parse().ok())
}
