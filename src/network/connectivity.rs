use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{Credentials, LinkDriver, LinkError, LinkInfo, LinkState};
use crate::config::NetworkConfig;
use crate::retry::RetryPolicy;
use crate::shutdown::StopSignal;

const HISTORY_LEN: usize = 32;

/// Attach pacing: poll interval, progress logging and forced-restart cadence.
///
/// `retry` bounds the total number of polls across restarts. Production
/// policies retry forever.
#[derive(Debug, Clone, Copy)]
pub struct AttachPolicy {
    pub poll_interval: Duration,
    pub progress_every: u32,
    pub restart_every: u32,
    pub restart_pause: Duration,
    pub retry: RetryPolicy,
}

impl AttachPolicy {
    pub fn from_config(config: &NetworkConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            progress_every: config.progress_every.max(1),
            restart_every: config.restart_every.max(1),
            restart_pause: config.restart_pause(),
            retry: RetryPolicy::forever(config.poll_interval()),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.retry = self.retry.with_max_attempts(max_attempts);
        self
    }
}

/// One recorded state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: LinkState,
    pub to: LinkState,
}

struct LinkRecord {
    info: LinkInfo,
    connected_at: Option<Instant>,
    history: VecDeque<Transition>,
}

struct Inner {
    driver: Arc<dyn LinkDriver>,
    credentials: Credentials,
    policy: AttachPolicy,
    state: watch::Sender<LinkState>,
    record: Mutex<LinkRecord>,
    attach_lock: tokio::sync::Mutex<()>,
}

/// Owns link state for the node. Cloning shares the same link.
#[derive(Clone)]
pub struct ConnectivityManager {
    inner: Arc<Inner>,
}

impl ConnectivityManager {
    pub fn new(
        driver: Arc<dyn LinkDriver>,
        credentials: Credentials,
        policy: AttachPolicy,
    ) -> Self {
        let (state, _) = watch::channel(LinkState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                driver,
                credentials,
                policy,
                state,
                record: Mutex::new(LinkRecord {
                    info: LinkInfo::default(),
                    connected_at: None,
                    history: VecDeque::with_capacity(HISTORY_LEN),
                }),
                attach_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Current state, without blocking.
    pub fn status(&self) -> LinkState {
        *self.inner.state.borrow()
    }

    /// Read-only handle for workers that only observe the link.
    pub fn watch(&self) -> LinkWatch {
        LinkWatch {
            rx: self.inner.state.subscribe(),
        }
    }

    /// Brings the link up, polling until the driver reports attachment.
    ///
    /// Every `restart_every` polls the attach sequence is torn down and begun
    /// again, resetting the attempt counter. Fails only when the retry policy
    /// carries a ceiling or `stop` fires.
    pub async fn attach(&self, stop: &StopSignal) -> Result<LinkInfo, LinkError> {
        let inner = &self.inner;
        let _guard = inner.attach_lock.lock().await;

        if self.status() == LinkState::Connected {
            return Ok(self.info());
        }

        self.transition(LinkState::Connecting);
        self.set_attempts(0);
        info!(ssid = %inner.credentials.ssid, "Attaching to network");
        self.begin().await;

        let policy = inner.policy;
        let mut polls: u32 = 0;
        let mut attempts: u32 = 0;

        loop {
            if !policy.retry.allows(polls) {
                warn!(polls, "Attach attempts exhausted");
                self.transition(LinkState::Disconnected);
                return Err(LinkError::AttemptsExhausted(polls));
            }

            if !stop.sleep(policy.poll_interval).await {
                self.transition(LinkState::Disconnected);
                return Err(LinkError::Stopped);
            }

            polls += 1;
            attempts += 1;
            self.set_attempts(attempts);

            if inner.driver.is_attached().await {
                return Ok(self.established(attempts).await);
            }

            if attempts % policy.progress_every == 0 {
                info!(attempts, polls, "Still waiting for network");
            }

            if attempts % policy.restart_every == 0 {
                warn!(attempts, "Link stuck, restarting attach sequence");
                inner.driver.disconnect().await;
                if !stop.sleep(policy.restart_pause).await {
                    self.transition(LinkState::Disconnected);
                    return Err(LinkError::Stopped);
                }
                attempts = 0;
                self.set_attempts(0);
                self.begin().await;
            }
        }
    }

    /// Tears the link down and marks it Disconnected.
    pub async fn detach(&self) {
        self.inner.driver.disconnect().await;
        self.mark_lost();
    }

    /// Checks the driver and records a lost link. Returns the resulting state.
    pub async fn refresh(&self) -> LinkState {
        if self.status() == LinkState::Connected && !self.inner.driver.is_attached().await {
            warn!("Network link lost");
            self.mark_lost();
        }
        self.status()
    }

    /// Detach, pause, attach.
    pub async fn reconnect(&self, stop: &StopSignal) -> Result<LinkInfo, LinkError> {
        info!("Reconnecting network link");
        self.detach().await;
        if !stop.sleep(self.inner.policy.restart_pause).await {
            return Err(LinkError::Stopped);
        }
        self.attach(stop).await
    }

    pub fn info(&self) -> LinkInfo {
        let record = self.inner.record.lock();
        let mut info = record.info.clone();
        info.connected_for_secs = record.connected_at.map(|at| at.elapsed().as_secs());
        info
    }

    /// Most recent state changes, oldest first.
    pub fn history(&self) -> Vec<Transition> {
        self.inner.record.lock().history.iter().copied().collect()
    }

    async fn begin(&self) {
        let inner = &self.inner;
        if let Err(e) = inner.driver.begin(&inner.credentials).await {
            // polling continues; the next forced restart begins again
            warn!(error = %e, "Link driver failed to begin attach");
        }
    }

    async fn established(&self, attempts: u32) -> LinkInfo {
        let driver = &self.inner.driver;
        let address = driver.local_addr().await;
        let signal_dbm = driver.signal_dbm().await;

        {
            let mut record = self.inner.record.lock();
            record.info = LinkInfo {
                address,
                signal_dbm,
                ssid: Some(self.inner.credentials.ssid.clone()),
                attempts,
                connected_for_secs: None,
            };
            record.connected_at = Some(Instant::now());
        }
        self.transition(LinkState::Connected);

        info!(
            address = ?address,
            signal_dbm = ?signal_dbm,
            attempts,
            "Network connected"
        );
        self.info()
    }

    fn mark_lost(&self) {
        {
            let mut record = self.inner.record.lock();
            record.info.address = None;
            record.info.signal_dbm = None;
            record.connected_at = None;
        }
        self.transition(LinkState::Disconnected);
    }

    fn set_attempts(&self, attempts: u32) {
        self.inner.record.lock().info.attempts = attempts;
    }

    fn transition(&self, next: LinkState) {
        let mut record = self.inner.record.lock();
        let current = self.status();
        if current == next {
            return;
        }
        if !current.can_transition_to(next) {
            warn!(from = %current, to = %next, "Rejected illegal link transition");
            return;
        }

        if record.history.len() == HISTORY_LEN {
            record.history.pop_front();
        }
        record.history.push_back(Transition { from: current, to: next });
        self.inner.state.send_replace(next);
        debug!(from = %current, to = %next, "Link state changed");
    }
}

/// Observer handle on the link state
#[derive(Clone)]
pub struct LinkWatch {
    rx: watch::Receiver<LinkState>,
}

impl LinkWatch {
    pub fn status(&self) -> LinkState {
        *self.rx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == LinkState::Connected
    }

    /// Waits until the link is Connected. Returns `false` if `stop` fires first.
    pub async fn wait_connected(&mut self, stop: &StopSignal) -> bool {
        loop {
            if stop.is_stopped() {
                return false;
            }
            if *self.rx.borrow_and_update() == LinkState::Connected {
                return true;
            }
            tokio::select! {
                changed = self.rx.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
                _ = stop.stopped() => return false,
            }
        }
    }
}
