//! Boot, worker placement and health reporting.
//!
//! The camera is brought up first and is a hard dependency: if it fails,
//! [`Supervisor::start`] returns an error and nothing else is started. Workers
//! then run on two execution contexts, each an OS thread driving its own
//! single-threaded runtime, so a stalled camera path cannot starve command
//! handling:
//!
//! * `camera-core`: frame upload and the streaming responder
//! * `network-core`: the command channel and the health reporter

use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::camera::{driver_from_config, CameraDriver, FrameError, FramePool, PoolSnapshot};
use crate::command::{
    BrokerClient, CommandChannel, CommandHandler, CommandStats, CommandStatsSnapshot, MqttBroker,
};
use crate::config::Config;
use crate::control::{CaptureRequest, StreamToggle};
use crate::network::{
    AttachPolicy, ConnectivityManager, Credentials, HostLink, LinkDriver, LinkInfo, LinkState,
};
use crate::rtsp::{run_responder, StreamStats, StreamStatsSnapshot};
use crate::shutdown::StopSignal;
use crate::stats::{MemoryUsage, WorkerProbe, WorkerSnapshot};
use crate::upload::{
    CollectorConnector, FrameUploader, TcpCollector, UploadStats, UploadStatsSnapshot,
};

type Task = Pin<Box<dyn Future<Output = ()> + Send>>;

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("camera unavailable: {0}")]
    Camera(#[from] FrameError),

    #[error("failed to start execution context {0}: {1}")]
    Context(&'static str, #[source] std::io::Error),
}

/// External collaborators the workers are built on
pub struct Capabilities {
    pub camera: Box<dyn CameraDriver>,
    pub link: Arc<dyn LinkDriver>,
    pub broker: Box<dyn BrokerClient>,
    pub collector: Arc<dyn CollectorConnector>,
}

impl Capabilities {
    /// Production adapters for a hosted node.
    pub fn from_config(config: &Config) -> Self {
        Self {
            camera: driver_from_config(&config.camera),
            link: Arc::new(HostLink::new(config.probe_addr())),
            broker: Box::new(MqttBroker::new(&config.broker)),
            collector: Arc::new(TcpCollector::new(&config.collector)),
        }
    }
}

/// Point-in-time view of the node
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub uptime_secs: u64,
    pub link: LinkState,
    pub link_info: LinkInfo,
    pub streaming_enabled: bool,
    pub pool: PoolSnapshot,
    pub upload: UploadStatsSnapshot,
    pub streaming: StreamStatsSnapshot,
    pub commands: CommandStatsSnapshot,
    pub workers: Vec<WorkerSnapshot>,
    pub memory: MemoryUsage,
}

/// Read-only handles on everything the health report covers
#[derive(Clone)]
struct HealthSources {
    started: Instant,
    link: ConnectivityManager,
    toggle: StreamToggle,
    pool: FramePool,
    upload: Arc<UploadStats>,
    streaming: Arc<StreamStats>,
    commands: Arc<CommandStats>,
    probes: Vec<Arc<WorkerProbe>>,
}

impl HealthSources {
    fn report(&self) -> HealthReport {
        HealthReport {
            uptime_secs: self.started.elapsed().as_secs(),
            link: self.link.status(),
            link_info: self.link.info(),
            streaming_enabled: self.toggle.is_enabled(),
            pool: self.pool.snapshot(),
            upload: self.upload.snapshot(),
            streaming: self.streaming.snapshot(),
            commands: self.commands.snapshot(),
            workers: self.probes.iter().map(|p| p.snapshot()).collect(),
            memory: MemoryUsage::sample(),
        }
    }
}

/// Logs a health report every interval. Low memory is reported, never acted on.
async fn report_health(
    sources: HealthSources,
    probe: Arc<WorkerProbe>,
    interval: std::time::Duration,
    low_memory_kb: u64,
    stop: StopSignal,
) {
    let _running = probe.enter();

    while stop.sleep(interval).await {
        probe.tick();
        let report = sources.report();

        match serde_json::to_string(&report) {
            Ok(json) => info!(
                uptime_secs = report.uptime_secs,
                link = %report.link,
                frames_uploaded = report.upload.frames_sent,
                frames_streamed = report.streaming.frames_pushed,
                pool_outstanding = report.pool.outstanding,
                report = %json,
                "Health report"
            ),
            Err(e) => warn!(error = %e, "Health report serialization failed"),
        }

        for worker in report.workers.iter().filter(|w| !w.running) {
            warn!(worker = worker.name, "Worker not running");
        }

        if let Some(available) = report.memory.available_kb {
            if available < low_memory_kb {
                warn!(available_kb = available, threshold_kb = low_memory_kb, "Low memory");
            }
        }
    }
}

struct ExecutionContext {
    name: &'static str,
    thread: JoinHandle<()>,
}

impl ExecutionContext {
    fn spawn(name: &'static str, tasks: Vec<Task>) -> Result<Self, SupervisorError> {
        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!(context = name, error = %e, "Failed to build runtime");
                        return;
                    }
                };

                runtime.block_on(async move {
                    let mut workers = JoinSet::new();
                    for task in tasks {
                        workers.spawn(task);
                    }
                    while let Some(result) = workers.join_next().await {
                        if let Err(e) = result {
                            error!(context = name, error = %e, "Worker aborted");
                        }
                    }
                });
                info!(context = name, "Execution context finished");
            })
            .map_err(|e| SupervisorError::Context(name, e))?;

        Ok(Self { name, thread })
    }
}

pub struct Supervisor {
    stop: StopSignal,
    contexts: Vec<ExecutionContext>,
    health: HealthSources,
    capture: CaptureRequest,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("stop", &self.stop)
            .field("contexts", &self.contexts.len())
            .field("capture", &self.capture)
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    /// Initialises the camera, then launches every worker.
    pub fn start(config: &Config, capabilities: Capabilities) -> Result<Self, SupervisorError> {
        let Capabilities {
            camera,
            link,
            broker,
            collector,
        } = capabilities;

        let pool = FramePool::start(camera, config.camera.fb_count).map_err(|e| {
            error!(error = %e, "Camera initialisation failed");
            e
        })?;

        let stop = StopSignal::new();
        let toggle = StreamToggle::new(config.streaming.enabled);
        let capture = CaptureRequest::default();

        let credentials = Credentials {
            ssid: config.network.ssid.clone(),
            password: config.network.password.clone(),
        };
        let policy = AttachPolicy::from_config(&config.network);
        let manager = ConnectivityManager::new(link, credentials, policy);

        let channel = CommandChannel::new(
            broker,
            manager.clone(),
            CommandHandler::new(toggle.clone(), capture.clone()),
            &config.broker,
        );
        let uploader = FrameUploader::new(
            collector,
            pool.clone(),
            manager.watch(),
            toggle.clone(),
            capture.clone(),
            &config.collector,
        );
        let stream_stats = Arc::new(StreamStats::default());
        let responder_probe = WorkerProbe::new("streaming");
        let reporter_probe = WorkerProbe::new("health");

        let health = HealthSources {
            started: Instant::now(),
            link: manager.clone(),
            toggle: toggle.clone(),
            pool: pool.clone(),
            upload: uploader.stats(),
            streaming: Arc::clone(&stream_stats),
            commands: channel.stats(),
            probes: vec![
                channel.probe(),
                uploader.probe(),
                Arc::clone(&responder_probe),
                Arc::clone(&reporter_probe),
            ],
        };

        // the responder always runs; the toggle decides whether it serves
        let camera_tasks: Vec<Task> = vec![
            Box::pin(uploader.run(stop.clone())),
            Box::pin(run_responder(
                config.streaming.clone(),
                manager.clone(),
                pool.clone(),
                toggle.clone(),
                stream_stats,
                responder_probe,
                stop.clone(),
            )),
        ];
        let network_tasks: Vec<Task> = vec![
            Box::pin(channel.run(stop.clone())),
            Box::pin(report_health(
                health.clone(),
                reporter_probe,
                config.supervisor.report_interval(),
                config.supervisor.low_memory_threshold_kb,
                stop.clone(),
            )),
        ];

        let mut supervisor = Self {
            stop,
            contexts: Vec::with_capacity(2),
            health,
            capture,
        };
        for (name, tasks) in [("camera-core", camera_tasks), ("network-core", network_tasks)] {
            match ExecutionContext::spawn(name, tasks) {
                Ok(context) => supervisor.contexts.push(context),
                Err(e) => {
                    supervisor.stop.stop();
                    return Err(e);
                }
            }
        }

        info!(contexts = supervisor.contexts.len(), "All workers started");
        Ok(supervisor)
    }

    pub fn health(&self) -> HealthReport {
        self.health.report()
    }

    pub fn link(&self) -> &ConnectivityManager {
        &self.health.link
    }

    pub fn frame_pool(&self) -> &FramePool {
        &self.health.pool
    }

    pub fn toggle(&self) -> &StreamToggle {
        &self.health.toggle
    }

    pub fn capture_request(&self) -> &CaptureRequest {
        &self.capture
    }

    /// Stops every worker and waits for the execution contexts to exit.
    pub async fn shutdown(mut self) {
        info!("Stopping workers");
        self.stop.stop();

        let contexts = std::mem::take(&mut self.contexts);
        let joined = tokio::task::spawn_blocking(move || {
            for context in contexts {
                if context.thread.join().is_err() {
                    error!(context = context.name, "Execution context panicked");
                }
            }
        })
        .await;

        if let Err(e) = joined {
            error!(error = %e, "Failed to join execution contexts");
        }
        info!("All workers stopped");
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.stop.stop();
    }
}
