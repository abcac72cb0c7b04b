use crate::network::broadcast::AP_ADDRESS;
use crate::structs::{AccessPointSettings, LinkStatus, RadioMode, RadioScan, ScannedNetwork};
use crate::traits::WifiRadio;
use crate::{Error, Result};
use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::sync::{Mutex, MutexGuard};

/// A network the simulated radio can see and join.
#[derive(Debug, Clone)]
pub struct MockNetwork {
    pub ssid: String,
    /// `None` for an open network.
    pub password: Option<String>,
    pub rssi: i32,
    /// Address handed out once associated.
    pub lease: Ipv4Addr,
    /// Status polls before the association completes.
    pub join_polls: u32,
}

impl MockNetwork {
    pub fn secured(ssid: &str, password: &str, rssi: i32, lease: Ipv4Addr) -> Self {
        Self {
            ssid: ssid.to_string(),
            password: Some(password.to_string()),
            rssi,
            lease,
            join_polls: 0,
        }
    }

    pub fn open(ssid: &str, rssi: i32, lease: Ipv4Addr) -> Self {
        Self {
            ssid: ssid.to_string(),
            password: None,
            rssi,
            lease,
            join_polls: 0,
        }
    }

    pub fn with_join_polls(mut self, polls: u32) -> Self {
        self.join_polls = polls;
        self
    }
}

#[derive(Debug, Clone)]
enum Join {
    Succeeds(Ipv4Addr),
    Rejected,
    /// Unknown SSID: the radio keeps trying forever.
    NeverCompletes,
}

#[derive(Debug)]
struct MockState {
    mode: RadioMode,
    country: Option<String>,
    access_point: Option<AccessPointSettings>,
    networks: Vec<MockNetwork>,
    link: LinkStatus,
    pending: Option<(Join, u32)>,
    scan: RadioScan,
    scan_countdown: u32,
    scan_polls: u32,
    scans_started: usize,
    reject_access_point: bool,
    fail_scan: bool,
    fail_disconnect: bool,
    clients: usize,
    link_queries: usize,
}

/// A simulated radio for development and tests.
/// It never touches hardware; association and scan progress are driven
/// by how often the status is polled.
#[derive(Debug)]
pub struct MockBackend {
    inner: Mutex<MockState>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    /// A radio surrounded by a fixed set of fake networks.
    pub fn new() -> Self {
        Self::with_networks(vec![
            MockNetwork::secured("MyHomeWiFi", "correct horse", -42, Ipv4Addr::new(192, 168, 1, 57))
                .with_join_polls(4),
            MockNetwork::open("CafeGuest", -67, Ipv4Addr::new(10, 20, 0, 113)).with_join_polls(2),
            MockNetwork::secured(
                "Neighbor's Network",
                "hunter22",
                -81,
                Ipv4Addr::new(192, 168, 0, 12),
            ),
            MockNetwork::secured("xfinitywifi", "xfinity!", -58, Ipv4Addr::new(10, 0, 0, 31)),
        ])
    }

    pub fn with_networks(networks: Vec<MockNetwork>) -> Self {
        Self {
            inner: Mutex::new(MockState {
                mode: RadioMode::Off,
                country: None,
                access_point: None,
                networks,
                link: LinkStatus::Disconnected,
                pending: None,
                scan: RadioScan::NotStarted,
                scan_countdown: 0,
                scan_polls: 0,
                scans_started: 0,
                reject_access_point: false,
                fail_scan: false,
                fail_disconnect: false,
                clients: 0,
                link_queries: 0,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        // 测试替身：锁中毒时继续使用内部数据
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_reject_access_point(&self, reject: bool) {
        self.state().reject_access_point = reject;
    }

    pub fn set_fail_scan(&self, fail: bool) {
        self.state().fail_scan = fail;
    }

    /// Number of `scan_status` polls a scan stays running for.
    pub fn set_scan_polls(&self, polls: u32) {
        self.state().scan_polls = polls;
    }

    pub fn set_clients(&self, clients: usize) {
        self.state().clients = clients;
    }

    /// Simulates the station losing its link.
    pub fn drop_link(&self) {
        let mut state = self.state();
        state.link = LinkStatus::Disconnected;
        state.pending = None;
    }

    /// Simulates the radio re-associating on its own.
    pub fn restore_link(&self, ip: Ipv4Addr) {
        self.state().link = LinkStatus::Connected(ip);
    }

    pub fn access_point(&self) -> Option<AccessPointSettings> {
        self.state().access_point.clone()
    }

    pub fn country(&self) -> Option<String> {
        self.state().country.clone()
    }

    pub fn mode_now(&self) -> RadioMode {
        self.state().mode
    }

    pub fn scans_started(&self) -> usize {
        self.state().scans_started
    }

    pub fn set_fail_disconnect(&self, fail: bool) {
        self.state().fail_disconnect = fail;
    }

    /// Number of `station_link` calls so far.
    pub fn link_queries(&self) -> usize {
        self.state().link_queries
    }
}

#[async_trait]
impl WifiRadio for MockBackend {
    async fn set_country(&self, code: &str) -> Result<()> {
        tracing::info!("🤖 [MockBackend] Country set to {}", code);
        self.state().country = Some(code.to_string());
        Ok(())
    }

    async fn set_mode(&self, mode: RadioMode) -> Result<()> {
        let mut state = self.state();
        if mode != RadioMode::AccessPointStation {
            state.link = LinkStatus::Disconnected;
            state.pending = None;
        }
        if mode == RadioMode::Off {
            state.access_point = None;
        }
        tracing::debug!("🤖 [MockBackend] Mode {:?} -> {:?}", state.mode, mode);
        state.mode = mode;
        Ok(())
    }

    async fn mode(&self) -> RadioMode {
        self.state().mode
    }

    async fn start_access_point(&self, settings: &AccessPointSettings) -> Result<()> {
        let mut state = self.state();
        if state.reject_access_point {
            return Err(Error::Radio("simulated AP configuration rejected".into()));
        }
        tracing::info!(
            "🤖 [MockBackend] AP '{}' up on {} (channel {})",
            settings.ssid,
            settings.address,
            settings.channel
        );
        state.access_point = Some(settings.clone());
        Ok(())
    }

    async fn access_point_ip(&self) -> Ipv4Addr {
        self.state()
            .access_point
            .as_ref()
            .map(|ap| ap.address)
            .unwrap_or(AP_ADDRESS)
    }

    async fn access_point_clients(&self) -> usize {
        self.state().clients
    }

    async fn begin_station(&self, ssid: &str, password: &str) -> Result<()> {
        let mut state = self.state();
        if state.mode != RadioMode::AccessPointStation {
            return Err(Error::Radio("station side is not enabled".into()));
        }
        tracing::info!(
            "🤖 [MockBackend] Attempting to connect to SSID: '{}' with password: '{}'",
            ssid,
            if password.is_empty() { "(empty)" } else { "********" }
        );

        let pending = match state.networks.iter().find(|n| n.ssid == ssid) {
            Some(network) => {
                let accepted = match &network.password {
                    None => true,
                    Some(expected) => expected == password,
                };
                let join = if accepted { Join::Succeeds(network.lease) } else { Join::Rejected };
                (join, network.join_polls)
            }
            None => (Join::NeverCompletes, 0),
        };
        state.pending = Some(pending);
        state.link = LinkStatus::Connecting;
        Ok(())
    }

    async fn disconnect_station(&self) -> Result<()> {
        let mut state = self.state();
        if state.fail_disconnect {
            return Err(Error::Radio("simulated teardown failure".into()));
        }
        state.link = LinkStatus::Disconnected;
        state.pending = None;
        Ok(())
    }

    async fn station_link(&self) -> LinkStatus {
        let mut state = self.state();
        state.link_queries += 1;
        if let Some((join, remaining)) = state.pending.take() {
            if remaining > 0 {
                state.pending = Some((join, remaining - 1));
            } else {
                match join {
                    Join::Succeeds(ip) => state.link = LinkStatus::Connected(ip),
                    Join::Rejected => {
                        state.link = LinkStatus::Failed("authentication rejected".into())
                    }
                    Join::NeverCompletes => state.pending = Some((Join::NeverCompletes, 0)),
                }
            }
        }
        state.link.clone()
    }

    async fn start_scan(&self) -> Result<()> {
        let mut state = self.state();
        if state.fail_scan {
            return Err(Error::Radio("simulated scan rejection".into()));
        }
        tracing::info!("🤖 [MockBackend] Scanning for networks...");
        state.scan = RadioScan::Running;
        state.scan_countdown = state.scan_polls;
        state.scans_started += 1;
        Ok(())
    }

    async fn scan_status(&self) -> RadioScan {
        let mut state = self.state();
        if state.scan == RadioScan::Running {
            if state.scan_countdown > 0 {
                state.scan_countdown -= 1;
            } else {
                let networks: Vec<ScannedNetwork> = state
                    .networks
                    .iter()
                    .map(|n| ScannedNetwork {
                        ssid: n.ssid.clone(),
                        rssi: n.rssi,
                        secure: n.password.is_some(),
                    })
                    .collect();
                tracing::info!("🤖 [MockBackend] Found {} networks.", networks.len());
                state.scan = RadioScan::Done(networks);
            }
        }
        state.scan.clone()
    }

    async fn clear_scan(&self) {
        self.state().scan = RadioScan::NotStarted;
    }
}
