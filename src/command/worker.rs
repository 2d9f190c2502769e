//! Command channel worker.
//!
//! Keeps one broker session alive while the link is up, answers commands
//! synchronously and publishes a heartbeat on a fixed interval measured
//! against the monotonic clock.

use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{BrokerClient, Command, CommandHandler, InboundMessage, StatusMessage};
use crate::config::BrokerConfig;
use crate::network::{ConnectivityManager, LinkError, LinkState};
use crate::retry::RetryPolicy;
use crate::shutdown::StopSignal;
use crate::stats::WorkerProbe;

/// Messages handled per idle cycle before yielding to pacing
const MAX_DRAIN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChannelState {
    Uninitialized,
    WaitingForLink,
    Subscribing,
    Idle,
    Processing,
}

/// Broker session as seen by the worker. Publishing is a no-op unless
/// `connected` is set.
#[derive(Debug, Default)]
pub struct ChannelSession {
    connected: bool,
    subscriptions: BTreeSet<String>,
    last_heartbeat: Option<Instant>,
}

impl ChannelSession {
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn subscriptions(&self) -> &BTreeSet<String> {
        &self.subscriptions
    }

    pub fn last_heartbeat(&self) -> Option<Instant> {
        self.last_heartbeat
    }

    fn heartbeat_due(&self, now: Instant, interval: Duration) -> bool {
        self.last_heartbeat
            .map_or(true, |last| now.duration_since(last) >= interval)
    }

    fn reset(&mut self) {
        self.connected = false;
        self.subscriptions.clear();
        self.last_heartbeat = None;
    }
}

#[derive(Debug, Default)]
pub struct CommandStats {
    received: AtomicU64,
    published: AtomicU64,
    dropped: AtomicU64,
    sessions: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CommandStatsSnapshot {
    pub received: u64,
    pub published: u64,
    pub dropped: u64,
    pub sessions: u64,
}

impl CommandStats {
    pub fn snapshot(&self) -> CommandStatsSnapshot {
        CommandStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            sessions: self.sessions.load(Ordering::Relaxed),
        }
    }
}

enum Establish {
    Ready,
    LinkLost,
    GaveUp,
    Stopped,
}

pub struct CommandChannel {
    broker: Box<dyn BrokerClient>,
    link: ConnectivityManager,
    handler: CommandHandler,
    command_topic: String,
    status_topic: String,
    heartbeat_interval: Duration,
    loop_interval: Duration,
    reconnect: RetryPolicy,
    state: ChannelState,
    session: ChannelSession,
    stats: Arc<CommandStats>,
    probe: Arc<WorkerProbe>,
}

impl CommandChannel {
    pub fn new(
        broker: Box<dyn BrokerClient>,
        link: ConnectivityManager,
        handler: CommandHandler,
        config: &BrokerConfig,
    ) -> Self {
        Self {
            broker,
            link,
            handler,
            command_topic: config.command_topic.clone(),
            status_topic: config.status_topic.clone(),
            heartbeat_interval: config.heartbeat_interval(),
            loop_interval: config.loop_interval(),
            reconnect: RetryPolicy::forever(config.reconnect_delay()),
            state: ChannelState::Uninitialized,
            session: ChannelSession::default(),
            stats: Arc::new(CommandStats::default()),
            probe: WorkerProbe::new("command"),
        }
    }

    /// Overrides the broker reconnect schedule.
    pub fn with_reconnect_policy(mut self, policy: RetryPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn session(&self) -> &ChannelSession {
        &self.session
    }

    pub fn stats(&self) -> Arc<CommandStats> {
        Arc::clone(&self.stats)
    }

    pub fn probe(&self) -> Arc<WorkerProbe> {
        Arc::clone(&self.probe)
    }

    /// Runs the state machine until `stop` fires, then closes the session.
    pub async fn run(mut self, stop: StopSignal) {
        let _running = self.probe.enter();
        info!(
            command_topic = %self.command_topic,
            status_topic = %self.status_topic,
            "Command channel started"
        );

        while !stop.is_stopped() {
            self.probe.tick();
            if !self.step(&stop).await {
                break;
            }
        }

        self.close_session().await;
        info!("Command channel stopped");
    }

    async fn step(&mut self, stop: &StopSignal) -> bool {
        match self.state {
            ChannelState::Uninitialized => self.enter(ChannelState::WaitingForLink),
            ChannelState::WaitingForLink => match self.link.attach(stop).await {
                Ok(_) => self.enter(ChannelState::Subscribing),
                Err(LinkError::Stopped) => return false,
                Err(e) => {
                    warn!(error = %e, "Link attach failed");
                    return stop.sleep(self.reconnect.interval).await;
                }
            },
            ChannelState::Subscribing => match self.establish(stop).await {
                Establish::Ready => self.enter(ChannelState::Idle),
                Establish::LinkLost => {
                    self.close_session().await;
                    self.enter(ChannelState::WaitingForLink);
                }
                Establish::GaveUp => {
                    error!("Broker unreachable, restarting network link");
                    self.close_session().await;
                    self.link.detach().await;
                    self.enter(ChannelState::WaitingForLink);
                }
                Establish::Stopped => return false,
            },
            ChannelState::Idle | ChannelState::Processing => return self.idle_cycle(stop).await,
        }
        true
    }

    /// Connects, subscribes and announces the node. Re-checks the link before
    /// every attempt so a dead link is never retried against.
    async fn establish(&mut self, stop: &StopSignal) -> Establish {
        let mut failures: u32 = 0;

        loop {
            if stop.is_stopped() {
                return Establish::Stopped;
            }
            if self.link.refresh().await != LinkState::Connected {
                return Establish::LinkLost;
            }

            let attempt = match self.broker.connect().await {
                Ok(()) => self.broker.subscribe(&self.command_topic).await,
                Err(e) => Err(e),
            };

            match attempt {
                Ok(()) => break,
                Err(e) => {
                    failures += 1;
                    warn!(error = %e, failures, "Broker session not established");
                    self.broker.disconnect().await;
                    if !self.reconnect.allows(failures) {
                        return Establish::GaveUp;
                    }
                    if !stop.sleep(self.reconnect.delay_for(failures)).await {
                        return Establish::Stopped;
                    }
                }
            }
        }

        self.stats.sessions.fetch_add(1, Ordering::Relaxed);
        self.session.connected = true;
        self.session.subscriptions.insert(self.command_topic.clone());
        self.session.last_heartbeat = Some(Instant::now());
        info!(topic = %self.command_topic, "Subscribed to command topic");

        self.publish(StatusMessage::Online).await;
        Establish::Ready
    }

    async fn idle_cycle(&mut self, stop: &StopSignal) -> bool {
        if self.link.refresh().await != LinkState::Connected {
            warn!("Link lost, waiting for network");
            self.close_session().await;
            self.enter(ChannelState::WaitingForLink);
            return true;
        }

        if !self.broker.is_connected() {
            warn!("Broker session lost, reconnecting");
            self.session.reset();
            self.enter(ChannelState::Subscribing);
            return true;
        }

        for _ in 0..MAX_DRAIN {
            match self.broker.poll().await {
                Ok(Some(message)) => {
                    self.enter(ChannelState::Processing);
                    self.dispatch(message).await;
                    self.enter(ChannelState::Idle);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Broker poll failed");
                    self.session.reset();
                    self.enter(ChannelState::Subscribing);
                    return true;
                }
            }
        }

        let now = Instant::now();
        if self.session.heartbeat_due(now, self.heartbeat_interval) {
            self.publish(StatusMessage::Heartbeat).await;
            self.session.last_heartbeat = Some(now);
        }

        stop.sleep(self.loop_interval).await
    }

    async fn dispatch(&mut self, message: InboundMessage) {
        self.stats.received.fetch_add(1, Ordering::Relaxed);

        if message.topic != self.command_topic {
            debug!(topic = %message.topic, "Ignoring message on unexpected topic");
            return;
        }

        let text = message.text();
        info!(command = %text, "Command received");
        match text.parse::<Command>() {
            Ok(command) => {
                let ack = self.handler.handle(command);
                self.publish(ack).await;
            }
            Err(e) => warn!(error = %e, "Ignoring command"),
        }
    }

    /// Publishes on the status topic. Does nothing without a live session.
    pub async fn publish(&mut self, status: StatusMessage) -> bool {
        if !self.session.connected || !self.broker.is_connected() {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(status = %status, "No broker session, status not published");
            return false;
        }

        match self
            .broker
            .publish(&self.status_topic, status.as_str().as_bytes())
            .await
        {
            Ok(()) => {
                self.stats.published.fetch_add(1, Ordering::Relaxed);
                info!(status = %status, "Published status");
                true
            }
            Err(e) => {
                warn!(error = %e, status = %status, "Status publish failed");
                false
            }
        }
    }

    async fn close_session(&mut self) {
        if self.session.connected || self.broker.is_connected() {
            self.broker.disconnect().await;
        }
        self.session.reset();
    }

    fn enter(&mut self, next: ChannelState) {
        if self.state == next {
            return;
        }
        // per-message flips are too chatty for info
        if next == ChannelState::Processing || self.state == ChannelState::Processing {
            debug!(from = ?self.state, to = ?next, "Command channel state");
        } else {
            info!(from = ?self.state, to = ?next, "Command channel state");
        }
        self.state = next;
    }
}
