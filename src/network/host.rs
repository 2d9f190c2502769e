//! Link driver for a hosted Linux node.
//!
//! Association itself belongs to the operating system; this driver reports
//! the link as attached while the kernel has a route towards the probe
//! address, and reads signal level from `/proc/net/wireless`.

use async_trait::async_trait;
use std::net::{IpAddr, UdpSocket};
use tracing::{debug, info};

use super::{Credentials, LinkDriver, LinkError};

pub struct HostLink {
    probe_addr: String,
}

impl HostLink {
    pub fn new(probe_addr: impl Into<String>) -> Self {
        Self {
            probe_addr: probe_addr.into(),
        }
    }

    /// Local address the kernel would use to reach the probe address.
    /// Connecting a UDP socket sends no packets.
    fn route_source(&self) -> Option<IpAddr> {
        let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
        socket.connect(&self.probe_addr).ok()?;
        let addr = socket.local_addr().ok()?.ip();
        (!addr.is_unspecified()).then_some(addr)
    }
}

#[async_trait]
impl LinkDriver for HostLink {
    async fn begin(&self, credentials: &Credentials) -> Result<(), LinkError> {
        info!(ssid = %credentials.ssid, probe = %self.probe_addr, "Waiting for host network route");
        Ok(())
    }

    async fn is_attached(&self) -> bool {
        self.route_source().is_some()
    }

    async fn disconnect(&self) {
        debug!("Host link released");
    }

    async fn local_addr(&self) -> Option<IpAddr> {
        self.route_source()
    }

    async fn signal_dbm(&self) -> Option<i32> {
        let table = tokio::fs::read_to_string("/proc/net/wireless").await.ok()?;
        parse_wireless_level(&table)
    }
}

/// Signal level of the first interface in a `/proc/net/wireless` table.
fn parse_wireless_level(table: &str) -> Option<i32> {
    table
        .lines()
        .skip(2)
        .filter_map(|line| line.split_whitespace().nth(3))
        .find_map(|level| level.trim_end_matches('.').parse::<f32>().ok())
        .map(|level| level as i32)
}
