//! Accept loop with a fixed number of client slots.

use parking_lot::Mutex;
use serde::Serialize;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::session::{SessionContext, StreamSession};
use super::RtspError;
use crate::camera::FramePool;
use crate::config::StreamingConfig;
use crate::control::StreamToggle;
use crate::network::ConnectivityManager;
use crate::retry::RetryPolicy;
use crate::shutdown::StopSignal;
use crate::stats::WorkerProbe;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
pub struct StreamStats {
    pub(crate) accepted: AtomicU64,
    pub(crate) rejected: AtomicU64,
    pub(crate) frames_pushed: AtomicU64,
    pub(crate) skipped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct StreamStatsSnapshot {
    pub accepted: u64,
    pub rejected: u64,
    pub frames_pushed: u64,
    pub skipped: u64,
}

impl StreamStats {
    pub fn snapshot(&self) -> StreamStatsSnapshot {
        StreamStatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            frames_pushed: self.frames_pushed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }
}

/// Bounded count of live sessions
#[derive(Debug, Clone)]
pub struct SessionSlots {
    active: Arc<Mutex<usize>>,
    max: usize,
}

impl SessionSlots {
    pub fn new(max: usize) -> Self {
        Self {
            active: Arc::new(Mutex::new(0)),
            max,
        }
    }

    /// Claims a slot, or `None` when all are taken.
    pub fn try_acquire(&self) -> Option<SlotGuard> {
        let mut active = self.active.lock();
        if *active >= self.max {
            return None;
        }
        *active += 1;
        Some(SlotGuard {
            active: Arc::clone(&self.active),
        })
    }

    pub fn active(&self) -> usize {
        *self.active.lock()
    }

    pub fn max(&self) -> usize {
        self.max
    }
}

/// Holds one slot until dropped
pub struct SlotGuard {
    active: Arc<Mutex<usize>>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let mut active = self.active.lock();
        *active = active.saturating_sub(1);
    }
}

pub struct StreamingResponder {
    listener: TcpListener,
    slots: SessionSlots,
    ctx: SessionContext,
    stats: Arc<StreamStats>,
}

impl StreamingResponder {
    pub async fn bind(
        config: &StreamingConfig,
        pool: FramePool,
        toggle: StreamToggle,
        stats: Arc<StreamStats>,
        stop: StopSignal,
    ) -> Result<Self, RtspError> {
        let addr = format!("{}:{}", config.bind_ip, config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| RtspError::Bind(addr.clone(), e))?;

        Ok(Self {
            listener,
            slots: SessionSlots::new(config.max_clients),
            ctx: SessionContext {
                pool,
                toggle,
                stats: Arc::clone(&stats),
                stream_path: config.path.clone(),
                frame_interval: config.frame_interval(),
                write_timeout: config.write_timeout(),
                stop,
            },
            stats,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn slots(&self) -> SessionSlots {
        self.slots.clone()
    }

    /// Accepts clients until the stop signal fires, then waits for every
    /// session to close.
    pub async fn serve(self) {
        let stop = self.ctx.stop.clone();
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((socket, peer)) => self.admit(socket, peer, &mut sessions),
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        if !stop.sleep(ACCEPT_BACKOFF).await {
                            break;
                        }
                    }
                },
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
                _ = stop.stopped() => break,
            }
        }

        while sessions.join_next().await.is_some() {}
        debug!("Streaming responder closed");
    }

    fn admit(&self, socket: TcpStream, peer: SocketAddr, sessions: &mut JoinSet<()>) {
        if !self.ctx.toggle.is_enabled() {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            debug!(peer = %peer, "Streaming disabled, closing connection");
            return;
        }

        let Some(slot) = self.slots.try_acquire() else {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(
                peer = %peer,
                max = self.slots.max(),
                "Maximum clients reached, rejecting connection"
            );
            return;
        };

        let local = match socket.local_addr() {
            Ok(addr) => addr.ip(),
            Err(e) => {
                warn!(peer = %peer, error = %e, "Client socket unusable");
                return;
            }
        };
        if let Err(e) = socket.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }

        self.stats.accepted.fetch_add(1, Ordering::Relaxed);
        info!(peer = %peer, active = self.slots.active(), "New client connected");

        let (reader, writer) = socket.into_split();
        let session =
            StreamSession::new(reader, writer, local, peer.to_string(), self.ctx.clone());
        sessions.spawn(async move {
            let _slot = slot;
            let frames = session.run().await;
            info!(peer = %peer, frames, "Client disconnected");
        });
    }
}

/// Binds the listener, retrying on `retry` until it succeeds, the policy is
/// exhausted or the responder stops.
pub async fn bind_with_retry(
    config: &StreamingConfig,
    pool: &FramePool,
    toggle: &StreamToggle,
    stats: &Arc<StreamStats>,
    stop: &StopSignal,
    retry: RetryPolicy,
) -> Option<StreamingResponder> {
    let mut attempts = 0u32;
    loop {
        let bound = StreamingResponder::bind(
            config,
            pool.clone(),
            toggle.clone(),
            Arc::clone(stats),
            stop.clone(),
        )
        .await;

        match bound {
            Ok(responder) => return Some(responder),
            Err(e) => {
                attempts += 1;
                if !retry.allows(attempts) {
                    warn!(error = %e, attempts, "Streaming responder not started");
                    return None;
                }
                let delay = retry.delay_for(attempts);
                warn!(error = %e, attempt = attempts, retry_in = ?delay, "Streaming bind failed");
                if !stop.sleep(delay).await {
                    return None;
                }
            }
        }
    }
}

/// Waits for the link, binds, logs the stream URL and serves until stopped.
pub async fn run_responder(
    config: StreamingConfig,
    link: ConnectivityManager,
    pool: FramePool,
    toggle: StreamToggle,
    stats: Arc<StreamStats>,
    probe: Arc<WorkerProbe>,
    stop: StopSignal,
) {
    let _running = probe.enter();

    let mut watch = link.watch();
    if !watch.is_connected() {
        info!("Streaming responder waiting for network");
    }
    if !watch.wait_connected(&stop).await {
        return;
    }

    let retry = RetryPolicy::forever(config.bind_retry());
    let bound = bind_with_retry(&config, &pool, &toggle, &stats, &stop, retry).await;
    let Some(responder) = bound else {
        return;
    };

    let port = responder.local_addr().map(|a| a.port()).unwrap_or(config.port);
    let host = link
        .info()
        .address
        .map_or_else(|| config.bind_ip.clone(), |ip| ip.to_string());
    info!(
        url = %format!("rtsp://{}:{}{}", host, port, config.path),
        max_clients = config.max_clients,
        "Streaming responder listening"
    );

    probe.tick();
    responder.serve().await;
    info!("Streaming responder stopped");
}
