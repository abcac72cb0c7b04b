//! Network mode state machine.
//!
//! Owns the access point, drives station connection attempts and serves the
//! asynchronous scan protocol. Nothing in here blocks: a connection attempt
//! is advanced one status check at a time by `reconcile()`, which the
//! scheduler calls on every tick.

use super::broadcast::{self, Topology, AP_ADDRESS, AP_NETMASK};
use super::state::{ConnectAttempt, ConnectOutcome, NetworkMode, NetworkState, ScanPhase, ScanPoll};
use crate::config::{ApConfig, ConnectPolicy};
use crate::settings::Scope;
use crate::structs::{AccessPointSettings, LinkStatus, RadioMode, RadioScan};
use crate::traits::{SettingsStore, TemplateVariables, TopologySource, WifiRadio};
use crate::Result;
use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;

pub const WIFI_NAMESPACE: &str = "wifi";

/// Minimum WPA2 passphrase length; anything shorter opens the AP.
const MIN_AP_PASSWORD_LEN: usize = 8;

#[derive(Debug, Clone, Default)]
struct AttemptReport {
    generation: u64,
    outcome: Option<ConnectOutcome>,
}

/// Handle returned by `connect()`; resolves once the attempt is decided.
#[derive(Debug)]
pub struct ConnectTicket {
    generation: u64,
    rx: watch::Receiver<AttemptReport>,
}

impl ConnectTicket {
    /// Waits for the outcome. Requires someone to keep calling `reconcile()`.
    pub async fn outcome(mut self) -> ConnectOutcome {
        loop {
            {
                let report = self.rx.borrow_and_update();
                if report.generation > self.generation {
                    return ConnectOutcome::Failed {
                        reason: "Superseded by a newer connection request".into(),
                    };
                }
                if report.generation == self.generation {
                    if let Some(outcome) = &report.outcome {
                        return outcome.clone();
                    }
                }
            }
            if self.rx.changed().await.is_err() {
                return ConnectOutcome::Failed {
                    reason: "Network controller stopped".into(),
                };
            }
        }
    }
}

pub struct NetworkModeController {
    radio: Arc<dyn WifiRadio>,
    store: Arc<dyn SettingsStore>,
    ap: ApConfig,
    policy: ConnectPolicy,
    portal_title: String,
    portal_subtitle: String,
    state: Mutex<NetworkState>,
    scan: Mutex<ScanPhase>,
    reports: watch::Sender<AttemptReport>,
    battery_percent: AtomicU8,
}

impl NetworkModeController {
    pub fn new(
        radio: Arc<dyn WifiRadio>,
        store: Arc<dyn SettingsStore>,
        ap: ApConfig,
        policy: ConnectPolicy,
    ) -> Self {
        let (reports, _) = watch::channel(AttemptReport::default());
        Self {
            radio,
            store,
            ap,
            policy,
            portal_title: "WiFi Manager".to_string(),
            portal_subtitle: String::new(),
            state: Mutex::new(NetworkState::default()),
            scan: Mutex::new(ScanPhase::Idle),
            reports,
            battery_percent: AtomicU8::new(100),
        }
    }

    pub fn with_portal_labels(mut self, title: &str, subtitle: &str) -> Self {
        self.portal_title = title.to_string();
        self.portal_subtitle = subtitle.to_string();
        self
    }

    /// Boot sequence: saved credentials, access point, auto-connect, first scan.
    pub async fn begin(&self) {
        if let Err(e) = self.load_saved_wifi().await {
            tracing::warn!("Failed to load saved WiFi settings, starting fresh: {}", e);
        }
        self.start_access_point().await;
        self.connect_to_saved_wifi().await;
        self.start_scan().await;
    }

    async fn load_saved_wifi(&self) -> Result<()> {
        let scope = Scope::open(self.store.as_ref(), WIFI_NAMESPACE, true)?;
        let ssid = scope.get_string("ssid", "");
        let password = scope.get_string("password", "");
        let enabled = scope.get_bool("enabled", false);
        scope.end()?;

        if enabled && !ssid.is_empty() {
            tracing::info!(ssid = %ssid, "Found saved WiFi");
        }
        let mut state = self.state.lock().await;
        state.sta_ssid = ssid;
        state.sta_password = password;
        state.sta_enabled = enabled;
        Ok(())
    }

    async fn connect_to_saved_wifi(&self) {
        let mut state = self.state.lock().await;
        if !state.sta_enabled || state.sta_ssid.is_empty() {
            return;
        }
        tracing::info!(ssid = %state.sta_ssid, "Connecting to saved WiFi");
        let (ssid, password) = (state.sta_ssid.clone(), state.sta_password.clone());
        self.begin_attempt(&mut state, &ssid, &password).await;
    }

    /// Brings up the access point on 192.168.4.1/24.
    ///
    /// A radio that refuses the configuration leaves the AP down; this is
    /// logged and reported through the return value, never escalated.
    pub async fn start_access_point(&self) -> bool {
        tracing::info!(ssid = %self.ap.ssid, "Starting WiFi access point");

        if let Err(e) = self.radio.disconnect_station().await {
            tracing::debug!("Ignoring station teardown error before AP start: {}", e);
        }

        if !self.ap.country_code.is_empty() {
            tracing::info!(country = %self.ap.country_code, "Setting WiFi country");
            if let Err(e) = self.radio.set_country(&self.ap.country_code).await {
                tracing::warn!("Failed to set WiFi country: {}", e);
            }
        }

        if let Err(e) = self.radio.set_mode(RadioMode::AccessPoint).await {
            tracing::error!("Failed to switch radio to AP mode: {}", e);
        }

        let password =
            (self.ap.password.len() >= MIN_AP_PASSWORD_LEN).then(|| self.ap.password.clone());
        let settings = AccessPointSettings {
            ssid: self.ap.ssid.clone(),
            password,
            channel: self.ap.channel,
            address: AP_ADDRESS,
            gateway: AP_ADDRESS,
            netmask: AP_NETMASK,
        };

        let ap_active = match self.radio.start_access_point(&settings).await {
            Ok(()) => {
                tracing::info!(
                    ssid = %settings.ssid,
                    ip = %AP_ADDRESS,
                    channel = settings.channel,
                    open = settings.password.is_none(),
                    "AP started successfully"
                );
                true
            }
            Err(e) => {
                tracing::error!("AP failed to start, continuing degraded: {}", e);
                false
            }
        };

        let mut state = self.state.lock().await;
        state.ap_active = ap_active;
        Self::recompute_broadcast(&mut state);
        ap_active
    }

    /// Starts a connection attempt and returns immediately.
    ///
    /// Credentials and the auto-connect flag are persisted before the
    /// outcome is known. Await the ticket for the result.
    pub async fn connect(&self, ssid: &str, password: &str) -> ConnectTicket {
        if let Err(e) = self.persist_credentials(ssid, password) {
            tracing::error!("Failed to persist WiFi credentials: {}", e);
        }

        let mut state = self.state.lock().await;
        state.sta_ssid = ssid.to_string();
        state.sta_password = password.to_string();
        state.sta_enabled = true;
        self.begin_attempt(&mut state, ssid, password).await
    }

    fn persist_credentials(&self, ssid: &str, password: &str) -> Result<()> {
        let mut scope = Scope::open(self.store.as_ref(), WIFI_NAMESPACE, false)?;
        scope.put_string("ssid", ssid)?;
        scope.put_string("password", password)?;
        scope.put_bool("enabled", true)?;
        scope.end()
    }

    async fn begin_attempt(
        &self,
        state: &mut NetworkState,
        ssid: &str,
        password: &str,
    ) -> ConnectTicket {
        let generation = self.reports.borrow().generation + 1;
        self.reports.send_replace(AttemptReport {
            generation,
            outcome: None,
        });
        let ticket = ConnectTicket {
            generation,
            rx: self.reports.subscribe(),
        };

        if let Err(e) = self.radio.set_mode(RadioMode::AccessPointStation).await {
            tracing::error!("Failed to switch radio to dual mode: {}", e);
        }
        // Clean slate before associating with the new network.
        if let Err(e) = self.radio.disconnect_station().await {
            tracing::debug!("Ignoring station teardown error: {}", e);
        }

        state.mode = NetworkMode::ApPlusStaConnecting;
        state.station_ip = None;
        Self::recompute_broadcast(state);

        if let Err(e) = self.radio.begin_station(ssid, password).await {
            tracing::warn!(ssid = %ssid, "Radio refused to start association: {}", e);
            self.fail_attempt(state, generation, format!("Connection failed: {}", e)).await;
            return ticket;
        }

        tracing::info!(ssid = %ssid, "Connection attempt started");
        state.attempt = Some(ConnectAttempt {
            generation,
            misses: 0,
            next_poll: Instant::now(),
        });
        ticket
    }

    /// Drops the station, clears the auto-connect flag and returns to AP only.
    pub async fn disconnect(&self) -> Result<()> {
        let persisted = self.persist_disabled();

        let mut state = self.state.lock().await;
        state.sta_enabled = false;
        if let Some(attempt) = state.attempt.take() {
            self.publish(attempt.generation, ConnectOutcome::Failed {
                reason: "Disconnected".into(),
            });
        }
        if let Err(e) = self.radio.disconnect_station().await {
            tracing::warn!("Station teardown failed: {}", e);
        }
        if let Err(e) = self.radio.set_mode(RadioMode::AccessPoint).await {
            tracing::error!("Failed to switch radio back to AP mode: {}", e);
        }
        state.mode = NetworkMode::ApOnly;
        state.station_ip = None;
        Self::recompute_broadcast(&mut state);
        tracing::info!("Disconnected from WiFi, AP only mode");

        persisted
    }

    fn persist_disabled(&self) -> Result<()> {
        let mut scope = Scope::open(self.store.as_ref(), WIFI_NAMESPACE, false)?;
        scope.put_bool("enabled", false)?;
        scope.end()
    }

    /// Called on every scheduler tick. Never waits on the radio beyond a
    /// single status query.
    pub async fn reconcile(&self) {
        let mut state = self.state.lock().await;
        match state.mode {
            NetworkMode::ApPlusStaConnecting => self.advance_attempt(&mut state).await,
            NetworkMode::ApPlusStaFailed => {
                state.mode = NetworkMode::ApOnly;
                tracing::debug!("Failed attempt settled, back to AP only");
            }
            NetworkMode::ApOnly | NetworkMode::ApPlusStaConnected => {
                self.track_link(&mut state).await
            }
        }
    }

    async fn advance_attempt(&self, state: &mut NetworkState) {
        let Some(mut attempt) = state.attempt else {
            // Connecting without an attempt cannot make progress.
            state.mode = NetworkMode::ApOnly;
            Self::recompute_broadcast(state);
            return;
        };
        let now = Instant::now();
        if now < attempt.next_poll {
            return;
        }

        match self.radio.station_link().await {
            LinkStatus::Connected(ip) => {
                state.attempt = None;
                state.mode = NetworkMode::ApPlusStaConnected;
                state.station_ip = Some(ip);
                Self::recompute_broadcast(state);
                tracing::info!(ssid = %state.sta_ssid, ip = %ip, "Connected");
                self.publish(attempt.generation, ConnectOutcome::Connected { ip });
            }
            LinkStatus::Failed(reason) => {
                let reason = format!("Connection failed: {}", reason);
                self.fail_attempt(state, attempt.generation, reason).await;
            }
            LinkStatus::Disconnected | LinkStatus::Connecting => {
                attempt.misses += 1;
                if attempt.misses > self.policy.max_attempts {
                    self.fail_attempt(state, attempt.generation, "Connection failed".into()).await;
                } else {
                    attempt.next_poll = now + self.policy.poll_interval;
                    state.attempt = Some(attempt);
                }
            }
        }
    }

    async fn fail_attempt(&self, state: &mut NetworkState, generation: u64, reason: String) {
        state.attempt = None;
        if let Err(e) = self.radio.disconnect_station().await {
            tracing::debug!("Ignoring station teardown error: {}", e);
        }
        if let Err(e) = self.radio.set_mode(RadioMode::AccessPoint).await {
            tracing::error!("Failed to revert radio to AP mode: {}", e);
        }
        state.mode = NetworkMode::ApPlusStaFailed;
        state.station_ip = None;
        Self::recompute_broadcast(state);
        tracing::warn!(
            ssid = %state.sta_ssid,
            reason = %reason,
            "Failed to connect, reverted to AP-only mode"
        );
        self.publish(generation, ConnectOutcome::Failed { reason });
    }

    /// Link changes the controller did not initiate.
    async fn track_link(&self, state: &mut NetworkState) {
        if !state.sta_enabled && state.station_ip.is_none() {
            return;
        }
        let now = Instant::now();
        if state.next_link_check.is_some_and(|next| now < next) {
            return;
        }
        state.next_link_check = Some(now + self.policy.poll_interval);

        let link = self.radio.station_link().await;
        match (state.station_ip, link) {
            (None, LinkStatus::Connected(ip)) if state.sta_enabled => {
                state.mode = NetworkMode::ApPlusStaConnected;
                state.station_ip = Some(ip);
                Self::recompute_broadcast(state);
                tracing::info!(ip = %ip, "WiFi reconnected");
            }
            (Some(old), LinkStatus::Connected(ip)) if old != ip => {
                state.station_ip = Some(ip);
                Self::recompute_broadcast(state);
                tracing::info!(old = %old, ip = %ip, "Station address changed");
            }
            (
                Some(_),
                LinkStatus::Disconnected | LinkStatus::Connecting | LinkStatus::Failed(_),
            ) => {
                // The connected-intent label stays until an explicit disconnect.
                state.station_ip = None;
                Self::recompute_broadcast(state);
                tracing::warn!("WiFi connection lost, using AP broadcast");
            }
            _ => {}
        }
    }

    fn publish(&self, generation: u64, outcome: ConnectOutcome) {
        self.reports.send_replace(AttemptReport {
            generation,
            outcome: Some(outcome),
        });
    }

    fn topology_of(state: &NetworkState) -> Topology {
        Topology {
            access_point: state.ap_active.then_some(AP_ADDRESS),
            station: if state.station_connected() { state.station_ip } else { None },
        }
    }

    fn recompute_broadcast(state: &mut NetworkState) {
        state.broadcast_addresses = broadcast::resolve("", &Self::topology_of(state));
    }

    /// Starts an asynchronous scan unless one is already running.
    pub async fn start_scan(&self) -> ScanPhase {
        let mut scan = self.scan.lock().await;
        if *scan == ScanPhase::Running {
            return ScanPhase::Running;
        }

        let (mode, linked) = {
            let state = self.state.lock().await;
            (state.mode, state.station_ip.is_some())
        };

        match self.radio.mode().await {
            RadioMode::AccessPoint | RadioMode::Off => {
                // Scanning needs the station side; the AP stays up.
                if let Err(e) = self.radio.set_mode(RadioMode::AccessPointStation).await {
                    tracing::error!("Failed to enable dual mode for scanning: {}", e);
                }
                if let Err(e) = self.radio.disconnect_station().await {
                    tracing::debug!("Ignoring station teardown error before scan: {}", e);
                }
            }
            RadioMode::AccessPointStation => {
                if !linked && mode != NetworkMode::ApPlusStaConnecting {
                    if let Err(e) = self.radio.disconnect_station().await {
                        tracing::debug!("Ignoring station teardown error before scan: {}", e);
                    }
                }
            }
        }

        *scan = match self.radio.start_scan().await {
            Ok(()) => {
                tracing::debug!("WiFi scan started");
                ScanPhase::Running
            }
            Err(e) => {
                tracing::error!("Scan request rejected: {}", e);
                ScanPhase::Failed
            }
        };
        *scan
    }

    /// Reports scan progress, handing over completed results exactly once.
    pub async fn poll_scan(&self) -> ScanPoll {
        let mut scan = self.scan.lock().await;
        match *scan {
            ScanPhase::Idle | ScanPhase::Ready => return ScanPoll::Idle,
            ScanPhase::Failed => return ScanPoll::Failed,
            ScanPhase::Running => {}
        }

        match self.radio.scan_status().await {
            RadioScan::Running => ScanPoll::Running,
            RadioScan::Done(networks) => {
                self.radio.clear_scan().await;
                *scan = ScanPhase::Idle;
                tracing::debug!(count = networks.len(), "WiFi scan complete");
                ScanPoll::Ready(networks)
            }
            RadioScan::Failed | RadioScan::NotStarted => {
                tracing::warn!("WiFi scan failed");
                *scan = ScanPhase::Failed;
                ScanPoll::Failed
            }
        }
    }

    pub async fn mode(&self) -> NetworkMode {
        self.state.lock().await.mode
    }

    pub async fn snapshot(&self) -> NetworkState {
        self.state.lock().await.clone()
    }

    pub async fn broadcast_addresses(&self) -> Vec<Ipv4Addr> {
        self.state.lock().await.broadcast_addresses.clone()
    }

    pub async fn is_station_connected(&self) -> bool {
        self.state.lock().await.station_connected()
    }

    pub async fn station_ip(&self) -> Option<Ipv4Addr> {
        let state = self.state.lock().await;
        if state.station_connected() { state.station_ip } else { None }
    }

    pub async fn access_point_ip(&self) -> Ipv4Addr {
        self.radio.access_point_ip().await
    }

    pub async fn client_count(&self) -> usize {
        self.radio.access_point_clients().await
    }

    pub fn set_battery_percent(&self, percent: u8) {
        self.battery_percent.store(percent.min(100), Ordering::Relaxed);
    }

    pub fn battery_percent(&self) -> u8 {
        self.battery_percent.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl TopologySource for NetworkModeController {
    async fn topology(&self) -> Topology {
        Self::topology_of(&*self.state.lock().await)
    }
}

#[async_trait]
impl TemplateVariables for NetworkModeController {
    async fn variable(&self, name: &str) -> Option<String> {
        let (connected, ssid, ip) = {
            let state = self.state.lock().await;
            (state.station_connected(), state.sta_ssid.clone(), state.station_ip)
        };
        let hidden = |visible: bool| if visible { String::new() } else { "hidden".to_string() };

        let value = match name {
            "BATTERY" => self.battery_percent().to_string(),
            "MODE" => (if connected { "AP + Station" } else { "Access Point" }).to_string(),
            "STA_SSID" => if connected { ssid } else { "-".to_string() },
            "STA_IP" => match ip {
                Some(ip) if connected => ip.to_string(),
                _ => "-".to_string(),
            },
            "STA_STATUS_CLASS" | "DISCONNECT_CLASS" => hidden(connected),
            "AP_CLIENTS" => self.client_count().await.to_string(),
            "AP_SSID" => self.ap.ssid.clone(),
            "AP_IP" => self.access_point_ip().await.to_string(),
            "PORTAL_TITLE" => self.portal_title.clone(),
            "PORTAL_SUBTITLE" => self.portal_subtitle.clone(),
            _ => return None,
        };
        Some(value)
    }
}
