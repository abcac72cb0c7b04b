use crate::structs::ScannedNetwork;
use std::net::Ipv4Addr;
use tokio::time::Instant;

/// Network mode as seen by the rest of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkMode {
    ApOnly,
    ApPlusStaConnecting,
    ApPlusStaConnected,
    ApPlusStaFailed,
}

impl NetworkMode {
    pub fn label(&self) -> &'static str {
        match self {
            NetworkMode::ApOnly => "ap-only",
            NetworkMode::ApPlusStaConnecting => "ap+sta connecting",
            NetworkMode::ApPlusStaConnected => "ap+sta connected",
            NetworkMode::ApPlusStaFailed => "ap+sta failed",
        }
    }
}

/// An in-flight station connection attempt, advanced by `reconcile()`.
#[derive(Debug, Clone, Copy)]
pub struct ConnectAttempt {
    pub generation: u64,
    /// Status checks that found no link yet.
    pub misses: u32,
    pub next_poll: Instant,
}

#[derive(Debug, Clone)]
pub struct NetworkState {
    pub mode: NetworkMode,
    pub sta_ssid: String,
    pub sta_password: String,
    /// Persisted intent to auto-connect.
    pub sta_enabled: bool,
    /// Address held by the station interface while its link is up.
    pub station_ip: Option<Ipv4Addr>,
    pub ap_active: bool,
    /// Never empty.
    pub broadcast_addresses: Vec<Ipv4Addr>,
    pub attempt: Option<ConnectAttempt>,
    /// Earliest time an idle link status query may run again.
    pub next_link_check: Option<Instant>,
}

impl Default for NetworkState {
    fn default() -> Self {
        Self {
            mode: NetworkMode::ApOnly,
            sta_ssid: String::new(),
            sta_password: String::new(),
            sta_enabled: false,
            station_ip: None,
            ap_active: false,
            broadcast_addresses: vec![super::broadcast::AP_BROADCAST],
            attempt: None,
            next_link_check: None,
        }
    }
}

impl NetworkState {
    /// True only when the station is both intended and linked.
    pub fn station_connected(&self) -> bool {
        self.mode == NetworkMode::ApPlusStaConnected && self.station_ip.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanPhase {
    Idle,
    Running,
    /// Only reported through `ScanPoll::phase`; the controller goes from
    /// `Running` straight back to `Idle` once results are handed over.
    Ready,
    Failed,
}

/// Answer to a scan poll. `Ready` hands the results over exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanPoll {
    Idle,
    Running,
    Ready(Vec<ScannedNetwork>),
    Failed,
}

impl ScanPoll {
    pub fn phase(&self) -> ScanPhase {
        match self {
            ScanPoll::Idle => ScanPhase::Idle,
            ScanPoll::Running => ScanPhase::Running,
            ScanPoll::Ready(_) => ScanPhase::Ready,
            ScanPoll::Failed => ScanPhase::Failed,
        }
    }
}

/// Final result of a station connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected { ip: Ipv4Addr },
    Failed { reason: String },
}
