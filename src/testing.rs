//! Fakes shared by unit tests.

use async_trait::async_trait;
use bytes::Bytes;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::camera::{CameraDriver, FrameError, FramePool};
use crate::config::NetworkConfig;
use crate::network::{AttachPolicy, ConnectivityManager, Credentials, LinkDriver, LinkError};
use crate::shutdown::StopSignal;

pub const JPEG: &[u8] = b"\xff\xd8\xff\xe0test-frame\xff\xd9";

/// Link that is up exactly while `up` is set
pub struct SwitchLink {
    pub up: AtomicBool,
}

impl SwitchLink {
    pub fn new(up: bool) -> Arc<Self> {
        Arc::new(Self {
            up: AtomicBool::new(up),
        })
    }

    pub fn set(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }
}

#[async_trait]
impl LinkDriver for SwitchLink {
    async fn begin(&self, _: &Credentials) -> Result<(), LinkError> {
        Ok(())
    }

    async fn is_attached(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) {}

    async fn local_addr(&self) -> Option<IpAddr> {
        Some(IpAddr::from([127, 0, 0, 1]))
    }

    async fn signal_dbm(&self) -> Option<i32> {
        Some(-50)
    }
}

/// Manager over `link` with a 1 ms poll interval.
pub fn manager(link: &Arc<SwitchLink>) -> ConnectivityManager {
    let config = NetworkConfig {
        poll_interval_ms: 1,
        restart_pause_ms: 1,
        ..Default::default()
    };
    ConnectivityManager::new(
        link.clone(),
        Credentials {
            ssid: config.ssid.clone(),
            password: config.password.clone(),
        },
        AttachPolicy::from_config(&config),
    )
}

/// Manager whose link is already Connected.
pub async fn connected_manager() -> (ConnectivityManager, Arc<SwitchLink>) {
    let link = SwitchLink::new(true);
    let manager = manager(&link);
    manager
        .attach(&StopSignal::new())
        .await
        .expect("fake link attaches");
    (manager, link)
}

/// Camera that always has the same frame ready
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

pub fn pool(fb_count: usize) -> FramePool {
    FramePool::start(Box::new(StaticCamera), fb_count).expect("static camera starts")
}
