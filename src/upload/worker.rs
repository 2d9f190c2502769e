//! Frame upload worker.
//!
//! Each cycle checks the streaming toggle and the link before touching the
//! camera, so no frame is taken while the transport cannot succeed. Every
//! acquired frame is released before the cycle ends, whatever the write did.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::codec;
use super::{CollectorConnector, FrameUplink, UploadError};
use crate::camera::{FrameBuffer, FramePool};
use crate::config::{CollectorConfig, UploadMode};
use crate::control::{CaptureRequest, StreamToggle};
use crate::network::LinkWatch;
use crate::shutdown::StopSignal;
use crate::stats::WorkerProbe;

/// The persistent multipart request. The frame counter restarts with every
/// newly established stream.
#[derive(Default)]
pub struct UploadStream {
    uplink: Option<Box<dyn FrameUplink>>,
    frame_counter: u64,
}

impl UploadStream {
    pub fn is_connected(&self) -> bool {
        self.uplink.is_some()
    }

    pub fn frame_counter(&self) -> u64 {
        self.frame_counter
    }

    fn establish(&mut self, uplink: Box<dyn FrameUplink>) {
        self.uplink = Some(uplink);
        self.frame_counter = 0;
    }

    async fn teardown(&mut self) {
        if let Some(mut uplink) = self.uplink.take() {
            uplink.close().await;
            debug!(frames = self.frame_counter, "Upload stream closed");
        }
    }
}

#[derive(Debug, Default)]
pub struct UploadStats {
    frames_sent: AtomicU64,
    send_errors: AtomicU64,
    connect_failures: AtomicU64,
    streams_opened: AtomicU64,
    skipped: AtomicU64,
    snapshots: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct UploadStatsSnapshot {
    pub frames_sent: u64,
    pub send_errors: u64,
    pub connect_failures: u64,
    pub streams_opened: u64,
    pub skipped: u64,
    pub snapshots: u64,
}

impl UploadStats {
    pub fn snapshot(&self) -> UploadStatsSnapshot {
        UploadStatsSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            streams_opened: self.streams_opened.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            snapshots: self.snapshots.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum SingleUpload {
    Sent,
    NoConnection,
    Failed,
}

pub struct FrameUploader {
    connector: Arc<dyn CollectorConnector>,
    pool: FramePool,
    link: LinkWatch,
    toggle: StreamToggle,
    capture: CaptureRequest,
    mode: UploadMode,
    device_id: String,
    frame_interval: Duration,
    idle_interval: Duration,
    link_down_interval: Duration,
    connect_retry: Duration,
    start_delay: Duration,
    stream: UploadStream,
    /// Frames uploaded one request at a time, never reset
    single_counter: u64,
    stats: Arc<UploadStats>,
    probe: Arc<WorkerProbe>,
}

impl FrameUploader {
    pub fn new(
        connector: Arc<dyn CollectorConnector>,
        pool: FramePool,
        link: LinkWatch,
        toggle: StreamToggle,
        capture: CaptureRequest,
        config: &CollectorConfig,
    ) -> Self {
        Self {
            connector,
            pool,
            link,
            toggle,
            capture,
            mode: config.mode,
            device_id: config.device_id.clone(),
            frame_interval: config.frame_interval(),
            idle_interval: config.idle_interval(),
            link_down_interval: config.link_down_interval(),
            connect_retry: config.connect_retry(),
            start_delay: config.start_delay(),
            stream: UploadStream::default(),
            single_counter: 0,
            stats: Arc::new(UploadStats::default()),
            probe: WorkerProbe::new("upload"),
        }
    }

    pub fn stream(&self) -> &UploadStream {
        &self.stream
    }

    pub fn stats(&self) -> Arc<UploadStats> {
        Arc::clone(&self.stats)
    }

    pub fn probe(&self) -> Arc<WorkerProbe> {
        Arc::clone(&self.probe)
    }

    pub async fn run(mut self, stop: StopSignal) {
        let _running = self.probe.enter();
        info!(
            mode = ?self.mode,
            device_id = %self.device_id,
            collector = %self.connector.host(),
            "Frame uploader started"
        );

        if stop.sleep(self.start_delay).await {
            loop {
                self.probe.tick();
                let pause = tokio::select! {
                    pause = self.cycle() => pause,
                    _ = stop.stopped() => break,
                };
                if !stop.sleep(pause).await {
                    break;
                }
            }
        }

        self.stream.teardown().await;
        info!("Frame uploader stopped");
    }

    /// Runs one upload cycle and returns how long to pause before the next.
    pub async fn cycle(&mut self) -> Duration {
        if !self.toggle.is_enabled() {
            self.stream.teardown().await;
            if self.capture.take() && self.link.is_connected() {
                self.snapshot().await;
            }
            return self.idle_interval;
        }

        // frames flow anyway while streaming
        self.capture.take();

        if !self.link.is_connected() {
            self.stream.teardown().await;
            return self.link_down_interval;
        }

        match self.mode {
            UploadMode::Stream => self.stream_cycle().await,
            UploadMode::PerFrame => self.single_cycle().await,
        }
    }

    async fn stream_cycle(&mut self) -> Duration {
        if !self.stream.is_connected() {
            let head = codec::stream_request_head(&self.device_id, self.connector.host());
            match self.connector.open(head.as_bytes()).await {
                Ok(uplink) => {
                    self.stream.establish(uplink);
                    self.stats.streams_opened.fetch_add(1, Ordering::Relaxed);
                    info!("Upload stream established");
                }
                Err(e) => {
                    self.stats.connect_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "Collector connect failed");
                    return self.connect_retry;
                }
            }
        }

        let Some(frame) = self.acquire() else {
            return self.frame_interval;
        };

        self.stream.frame_counter += 1;
        let counter = self.stream.frame_counter;
        let part = codec::part(frame.data());
        let len = frame.len();
        frame.release();

        let result = match self.stream.uplink.as_mut() {
            Some(uplink) => uplink.write(&part).await,
            None => Err(UploadError::NotConnected),
        };

        let result = result.and_then(|written| {
            if written == part.len() {
                Ok(())
            } else {
                Err(UploadError::ShortWrite {
                    written,
                    expected: part.len(),
                })
            }
        });

        match result {
            Ok(()) => {
                self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                debug!(frame = counter, bytes = len, "Frame streamed");
            }
            Err(e) => {
                self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
                warn!(frame = counter, error = %e, "Frame send failed, dropping stream");
                self.stream.teardown().await;
            }
        }

        self.frame_interval
    }

    async fn single_cycle(&mut self) -> Duration {
        let Some(frame) = self.acquire() else {
            return self.frame_interval;
        };

        match self.send_single(frame).await {
            SingleUpload::NoConnection => self.connect_retry,
            SingleUpload::Sent | SingleUpload::Failed => self.frame_interval,
        }
    }

    /// One frame for a `capture` command while streaming is off.
    async fn snapshot(&mut self) {
        let Some(frame) = self.acquire() else {
            warn!("Snapshot skipped, no frame available");
            return;
        };
        if self.send_single(frame).await == SingleUpload::Sent {
            self.stats.snapshots.fetch_add(1, Ordering::Relaxed);
            info!(frame = self.single_counter, "Snapshot uploaded");
        }
    }

    /// Connect, send one frame, disconnect. The slot goes back to the pool
    /// before any network I/O.
    async fn send_single(&mut self, frame: FrameBuffer) -> SingleUpload {
        let data = frame.bytes();
        let len = data.len();
        frame.release();

        let head = codec::single_frame_head(&self.device_id, self.connector.host(), len);
        let mut uplink = match self.connector.open(head.as_bytes()).await {
            Ok(uplink) => uplink,
            Err(e) => {
                self.stats.connect_failures.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Collector connect failed");
                return SingleUpload::NoConnection;
            }
        };

        self.single_counter += 1;
        let counter = self.single_counter;
        let result = uplink.write(&data).await;
        uplink.close().await;

        match result {
            Ok(written) if written == len => {
                self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                debug!(frame = counter, bytes = len, "Frame uploaded");
                SingleUpload::Sent
            }
            Ok(written) => {
                self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
                warn!(frame = counter, written, expected = len, "Frame upload incomplete");
                SingleUpload::Failed
            }
            Err(e) => {
                self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
                warn!(frame = counter, error = %e, "Frame upload failed");
                SingleUpload::Failed
            }
        }
    }

    fn acquire(&self) -> Option<FrameBuffer> {
        match self.pool.acquire() {
            Ok(frame) => Some(frame),
            Err(e) => {
                self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                debug!(error = %e, "No frame this cycle");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, JPEG};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct CollectorLog {
        heads: Vec<String>,
        writes: Vec<Vec<u8>>,
        closes: usize,
        refuse_opens: usize,
        /// 1-based index of a write that fails
        fail_write: Option<usize>,
        write_count: usize,
        /// Writes never complete, as with a collector that stopped reading
        stall_writes: bool,
    }

    #[derive(Clone, Default)]
    struct FakeCollector(Arc<Mutex<CollectorLog>>);

    struct FakeUplink(Arc<Mutex<CollectorLog>>);

    #[async_trait]
    impl FrameUplink for FakeUplink {
        async fn write(&mut self, data: &[u8]) -> Result<usize, UploadError> {
            if self.0.lock().stall_writes {
                return std::future::pending().await;
            }
            let mut log = self.0.lock();
            log.write_count += 1;
            if log.fail_write == Some(log.write_count) {
                return Ok(data.len() / 2);
            }
            log.writes.push(data.to_vec());
            Ok(data.len())
        }

        async fn close(&mut self) {
            self.0.lock().closes += 1;
        }
    }

    #[async_trait]
    impl CollectorConnector for FakeCollector {
        async fn open(&self, head: &[u8]) -> Result<Box<dyn FrameUplink>, UploadError> {
            let mut log = self.0.lock();
            if log.refuse_opens > 0 {
                log.refuse_opens -= 1;
                return Err(UploadError::Io(std::io::ErrorKind::ConnectionRefused.into()));
            }
            log.heads.push(String::from_utf8_lossy(head).to_string());
            Ok(Box::new(FakeUplink(Arc::clone(&self.0))))
        }

        fn host(&self) -> &str {
            "collector.local"
        }
    }

    struct Rig {
        collector: FakeCollector,
        pool: FramePool,
        toggle: StreamToggle,
        capture: CaptureRequest,
        link: Arc<testing::SwitchLink>,
        manager: crate::network::ConnectivityManager,
        uploader: FrameUploader,
    }

    async fn rig(mode: UploadMode) -> Rig {
        let collector = FakeCollector::default();
        let pool = testing::pool(2);
        let toggle = StreamToggle::new(true);
        let capture = CaptureRequest::default();
        let (manager, link) = testing::connected_manager().await;
        let config = CollectorConfig {
            mode,
            ..Default::default()
        };
        let uploader = FrameUploader::new(
            Arc::new(collector.clone()),
            pool.clone(),
            manager.watch(),
            toggle.clone(),
            capture.clone(),
            &config,
        );
        Rig {
            collector,
            pool,
            toggle,
            capture,
            link,
            manager,
            uploader,
        }
    }

    #[tokio::test]
    async fn test_stream_sends_head_then_parts() {
        let mut rig = rig(UploadMode::Stream).await;

        assert_eq!(rig.uploader.cycle().await, Duration::from_millis(50));
        assert_eq!(rig.uploader.cycle().await, Duration::from_millis(50));

        let log = rig.collector.0.lock();
        assert_eq!(log.heads.len(), 1);
        assert!(log.heads[0]
            .starts_with("POST /video_stream/RI1 HTTP/1.1\r\nHost: collector.local\r\n"));
        assert_eq!(log.writes.len(), 2);
        assert_eq!(log.writes[0], codec::part(JPEG).to_vec());
        assert_eq!(rig.uploader.stream().frame_counter(), 2);
        assert_eq!(rig.pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_counter_restarts_after_failed_write() {
        let mut rig = rig(UploadMode::Stream).await;
        rig.collector.0.lock().fail_write = Some(3);

        for expected in 1..=2 {
            rig.uploader.cycle().await;
            assert_eq!(rig.uploader.stream().frame_counter(), expected);
        }

        rig.uploader.cycle().await;
        assert!(!rig.uploader.stream().is_connected());
        assert_eq!(rig.pool.outstanding(), 0);

        rig.uploader.cycle().await;
        assert!(rig.uploader.stream().is_connected());
        assert_eq!(rig.uploader.stream().frame_counter(), 1);

        let stats = rig.uploader.stats().snapshot();
        assert_eq!(stats.frames_sent, 3);
        assert_eq!(stats.send_errors, 1);
        assert_eq!(stats.streams_opened, 2);
        assert_eq!(rig.collector.0.lock().closes, 1);
    }

    #[tokio::test]
    async fn test_every_write_failing_never_leaks_buffers() {
        let mut rig = rig(UploadMode::Stream).await;

        for n in 1..=20 {
            rig.collector.0.lock().fail_write = Some(n);
            rig.uploader.cycle().await;
            assert_eq!(rig.pool.outstanding(), 0);
        }
        assert_eq!(rig.uploader.stats().snapshot().send_errors, 20);
    }

    #[tokio::test]
    async fn test_connect_failure_takes_no_frame() {
        let mut rig = rig(UploadMode::Stream).await;
        rig.collector.0.lock().refuse_opens = 1;

        assert_eq!(rig.uploader.cycle().await, Duration::from_millis(2000));
        assert_eq!(rig.pool.snapshot().acquired, 0);

        rig.uploader.cycle().await;
        assert_eq!(rig.pool.snapshot().acquired, 1);
    }

    #[tokio::test]
    async fn test_disabled_toggle_tears_down_and_idles() {
        let mut rig = rig(UploadMode::Stream).await;
        rig.uploader.cycle().await;
        assert!(rig.uploader.stream().is_connected());

        rig.toggle.disable();
        assert_eq!(rig.uploader.cycle().await, Duration::from_millis(500));
        assert!(!rig.uploader.stream().is_connected());
        assert_eq!(rig.collector.0.lock().closes, 1);
        assert_eq!(rig.pool.snapshot().acquired, 1);
    }

    #[tokio::test]
    async fn test_link_down_releases_transport() {
        let mut rig = rig(UploadMode::Stream).await;
        rig.uploader.cycle().await;

        rig.link.set(false);
        rig.manager.refresh().await;

        assert_eq!(rig.uploader.cycle().await, Duration::from_millis(1000));
        assert!(!rig.uploader.stream().is_connected());
        assert_eq!(rig.pool.snapshot().acquired, 1);
    }

    #[tokio::test]
    async fn test_per_frame_mode_opens_one_request_per_frame() {
        let mut rig = rig(UploadMode::PerFrame).await;

        for _ in 0..3 {
            rig.uploader.cycle().await;
        }

        let log = rig.collector.0.lock();
        assert_eq!(log.heads.len(), 3);
        assert!(log.heads[0].starts_with("POST /video_frame/RI1 HTTP/1.1\r\n"));
        assert!(log.heads[0].contains(&format!("Content-Length: {}\r\n", JPEG.len())));
        assert_eq!(log.writes[2], JPEG);
        assert_eq!(log.closes, 3);
        assert_eq!(rig.uploader.single_counter, 3);
        assert_eq!(rig.pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_capture_request_uploads_one_snapshot_while_disabled() {
        let mut rig = rig(UploadMode::Stream).await;
        rig.toggle.disable();
        rig.capture.request();

        rig.uploader.cycle().await;
        rig.uploader.cycle().await;

        let log = rig.collector.0.lock();
        assert_eq!(log.heads.len(), 1);
        assert!(log.heads[0].starts_with("POST /video_frame/RI1"));
        assert!(!rig.capture.is_pending());
        assert_eq!(rig.uploader.stats().snapshot().snapshots, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_paces_at_frame_interval() {
        let rig = rig(UploadMode::Stream).await;
        let stop = StopSignal::new();
        let stats = rig.uploader.stats();
        let task = tokio::spawn(rig.uploader.run(stop.clone()));

        // start delay, then one second of streaming
        tokio::time::sleep(Duration::from_millis(2000 + 1000 + 10)).await;
        stop.stop();
        task.await.unwrap();

        let sent = stats.snapshot().frames_sent;
        assert!((19..=21).contains(&sent), "sent {}", sent);
        assert_eq!(rig.collector.0.lock().closes, 1);
        assert_eq!(rig.pool.outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_interrupts_stalled_write() {
        let rig = rig(UploadMode::Stream).await;
        rig.collector.0.lock().stall_writes = true;
        let stop = StopSignal::new();
        let task = tokio::spawn(rig.uploader.run(stop.clone()));

        // past the start delay, parked in the first frame write
        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert!(!task.is_finished());
        assert_eq!(rig.collector.0.lock().heads.len(), 1);
        assert_eq!(rig.pool.snapshot().acquired, 1);
        assert_eq!(rig.pool.outstanding(), 0);

        stop.stop();
        tokio::time::timeout(Duration::from_millis(100), task)
            .await
            .expect("uploader stops while its write is stalled")
            .unwrap();
        assert_eq!(rig.collector.0.lock().closes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_frame_stall_holds_no_buffer() {
        let mut rig = rig(UploadMode::PerFrame).await;
        rig.collector.0.lock().stall_writes = true;

        let cycle = tokio::time::timeout(Duration::from_secs(1), rig.uploader.cycle()).await;
        assert!(cycle.is_err());
        assert_eq!(rig.pool.snapshot().acquired, 1);
        assert_eq!(rig.pool.outstanding(), 0);
    }
}
