//! Fakes for the node's external collaborators.
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use camnode::camera::{CameraDriver, FrameError};
use camnode::command::{BrokerClient, BrokerError, InboundMessage};
use camnode::config::Config;
use camnode::network::{Credentials, LinkDriver, LinkError};
use camnode::supervisor::Capabilities;
use camnode::upload::{CollectorConnector, FrameUplink, UploadError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};

pub const JPEG: &[u8] = b"\xff\xd8\xff\xe0integration\xff\xd9";

pub struct StaticCamera;

impl CameraDriver for StaticCamera {
    fn init(&mut self) -> Result<(), FrameError> {
        Ok(())
    }

    fn grab(&mut self) -> Option<Bytes> {
        Some(Bytes::from_static(JPEG))
    }

    fn describe(&self) -> String {
        "static".to_string()
    }
}

/// Camera whose initialisation always fails
pub struct BrokenCamera;

impl CameraDriver for BrokenCamera {
    fn init(&mut self) -> Result<(), FrameError> {
        Err(FrameError::InitFailed("sensor not detected".to_string()))
    }

    fn grab(&mut self) -> Option<Bytes> {
        None
    }

    fn describe(&self) -> String {
        "broken".to_string()
    }
}

/// Link that attaches on the first poll
pub struct LoopbackLink;

#[async_trait]
impl LinkDriver for LoopbackLink {
    async fn begin(&self, _: &Credentials) -> Result<(), LinkError> {
        Ok(())
    }

    async fn is_attached(&self) -> bool {
        true
    }

    async fn disconnect(&self) {}

    async fn local_addr(&self) -> Option<IpAddr> {
        Some(IpAddr::from([127, 0, 0, 1]))
    }

    async fn signal_dbm(&self) -> Option<i32> {
        Some(-42)
    }
}

#[derive(Default)]
pub struct BrokerLog {
    pub connected: bool,
    pub subscriptions: Vec<String>,
    pub published: Vec<(String, String)>,
    pub inbox: VecDeque<InboundMessage>,
}

/// In-memory broker; the test keeps a handle on the shared log
#[derive(Clone, Default)]
pub struct ScriptedBroker {
    pub log: Arc<Mutex<BrokerLog>>,
}

impl ScriptedBroker {
    pub fn deliver(&self, topic: &str, payload: &str) {
        self.log
            .lock()
            .inbox
            .push_back(InboundMessage::new(topic, Bytes::copy_from_slice(payload.as_bytes())));
    }

    pub fn statuses(&self) -> Vec<String> {
        self.log.lock().published.iter().map(|(_, p)| p.clone()).collect()
    }
}

#[async_trait]
impl BrokerClient for ScriptedBroker {
    async fn connect(&mut self) -> Result<(), BrokerError> {
        self.log.lock().connected = true;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.log.lock().connected
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
        self.log.lock().subscriptions.push(topic.to_string());
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), BrokerError> {
        self.log.lock().published.push((
            topic.to_string(),
            String::from_utf8_lossy(payload).to_string(),
        ));
        Ok(())
    }

    async fn poll(&mut self) -> Result<Option<InboundMessage>, BrokerError> {
        Ok(self.log.lock().inbox.pop_front())
    }

    async fn disconnect(&mut self) {
        self.log.lock().connected = false;
    }
}

/// Collector that accepts everything and counts what arrives
#[derive(Clone, Default)]
pub struct CountingCollector {
    pub opened: Arc<AtomicUsize>,
    pub bytes: Arc<AtomicUsize>,
}

struct CountingUplink {
    bytes: Arc<AtomicUsize>,
}

#[async_trait]
impl FrameUplink for CountingUplink {
    async fn write(&mut self, data: &[u8]) -> Result<usize, UploadError> {
        self.bytes.fetch_add(data.len(), Ordering::SeqCst);
        Ok(data.len())
    }

    async fn close(&mut self) {}
}

#[async_trait]
impl CollectorConnector for CountingCollector {
    async fn open(&self, head: &[u8]) -> Result<Box<dyn FrameUplink>, UploadError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        self.bytes.fetch_add(head.len(), Ordering::SeqCst);
        Ok(Box::new(CountingUplink {
            bytes: Arc::clone(&self.bytes),
        }))
    }

    fn host(&self) -> &str {
        "collector.test"
    }
}

/// Collector that accepts the request head, then never drains the body
#[derive(Clone, Default)]
pub struct StalledCollector {
    pub opened: Arc<AtomicUsize>,
}

struct StalledUplink;

#[async_trait]
impl FrameUplink for StalledUplink {
    async fn write(&mut self, _: &[u8]) -> Result<usize, UploadError> {
        std::future::pending().await
    }

    async fn close(&mut self) {}
}

#[async_trait]
impl CollectorConnector for StalledCollector {
    async fn open(&self, _: &[u8]) -> Result<Box<dyn FrameUplink>, UploadError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(StalledUplink))
    }

    fn host(&self) -> &str {
        "stalled.test"
    }
}

/// Config with short intervals and an ephemeral loopback streaming port.
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.network.poll_interval_ms = 1;
    config.network.restart_pause_ms = 1;
    config.broker.loop_interval_ms = 5;
    config.broker.reconnect_delay_secs = 1;
    config.collector.start_delay_ms = 10;
    config.collector.frame_interval_ms = 10;
    config.streaming.bind_ip = "127.0.0.1".to_string();
    config.streaming.port = 0;
    config.streaming.frame_interval_ms = 10;
    config.supervisor.report_interval_secs = 1;
    config
}

pub fn capabilities(broker: &ScriptedBroker, collector: &CountingCollector) -> Capabilities {
    Capabilities {
        camera: Box::new(StaticCamera),
        link: Arc::new(LoopbackLink),
        broker: Box::new(broker.clone()),
        collector: Arc::new(collector.clone()),
    }
}

/// Reads one response head, up to and including the blank line.
pub async fn read_head<R: AsyncRead + Unpin>(reader: &mut R) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = reader.read(&mut byte).await.expect("read response");
        assert!(n > 0, "connection closed mid-response: {:?}", String::from_utf8_lossy(&head));
        head.push(byte[0]);
    }
    String::from_utf8_lossy(&head).to_string()
}

/// Reads one full response, including a `Content-Length` body if present.
pub async fn read_response<R: AsyncRead + Unpin>(reader: &mut R) -> String {
    let head = read_head(reader).await;
    let length = head
        .lines()
        .find_map(|l| l.strip_prefix("Content-Length: "))
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(0);

    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await.expect("read body");
    head + &String::from_utf8_lossy(&body)
}

/// Polls `check` every 10 ms until it holds or two seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
