//! OSC trigger dispatcher.
//!
//! Holds the persisted OSC settings, resolves where a trigger has to go
//! and sends one datagram per target. A test request from the portal is
//! an edge-triggered flag that the scheduler consumes.

use super::codec::OscMessage;
use crate::network::broadcast;
use crate::settings::Scope;
use crate::structs::OscSettingsRequest;
use crate::traits::{DatagramSink, SettingsStore, TemplateVariables, TopologySource};
use crate::{Error, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

pub const OSC_NAMESPACE: &str = "osc";
pub const DEFAULT_PORT: u16 = 8001;
pub const DEFAULT_ADDRESS_FORMAT: &str = "/kmpush";

/// Settings as served by `GET /osc`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OscConfig {
    pub port: u16,
    /// Empty means "broadcast on every active interface".
    #[serde(rename = "targetip")]
    pub target_ip: String,
    #[serde(rename = "addressFormat")]
    pub address_format: String,
}

impl Default for OscConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            target_ip: String::new(),
            address_format: DEFAULT_ADDRESS_FORMAT.to_string(),
        }
    }
}

/// What `POST /testosc` reports back before the send happens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestPreview {
    pub address: String,
    /// `"ip:port"` strings.
    pub targets: Vec<String>,
}

/// Outcome of one dispatch. Failed targets do not stop the others.
#[derive(Debug, Clone, Default)]
pub struct DispatchReport {
    pub address: String,
    pub sent: Vec<SocketAddr>,
    pub failed: Vec<(SocketAddr, String)>,
}

fn validate_port(port: i64) -> Result<u16> {
    u16::try_from(port)
        .ok()
        .filter(|p| *p != 0)
        .ok_or(Error::InvalidPort(port))
}

/// Appends the trigger number to the configured address.
/// `"/kmpush"` gives `"/kmpush1"`, `"/km/push/"` gives `"/km/push/1"`.
pub fn format_address(template: &str, trigger_id: u32) -> String {
    format!("{}{}", template, trigger_id)
}

pub struct OscDispatcher {
    store: Arc<dyn SettingsStore>,
    topology: Arc<dyn TopologySource>,
    sink: Arc<dyn DatagramSink>,
    config: Mutex<OscConfig>,
    test_requested: AtomicBool,
}

impl OscDispatcher {
    /// Creates the dispatcher and loads its settings from the store.
    /// Unreadable settings fall back to defaults.
    pub fn new(
        store: Arc<dyn SettingsStore>,
        topology: Arc<dyn TopologySource>,
        sink: Arc<dyn DatagramSink>,
    ) -> Self {
        let config = match Self::load(store.as_ref()) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load OSC settings, using defaults: {}", e);
                OscConfig::default()
            }
        };
        tracing::info!(
            "OSC configured: port={}, target={}, format={}",
            config.port,
            target_label(&config.target_ip),
            config.address_format
        );
        Self {
            store,
            topology,
            sink,
            config: Mutex::new(config),
            test_requested: AtomicBool::new(false),
        }
    }

    fn load(store: &dyn SettingsStore) -> Result<OscConfig> {
        let scope = Scope::open(store, OSC_NAMESPACE, true)?;
        let stored_port = scope.get_int("port", i64::from(DEFAULT_PORT));
        let port = validate_port(stored_port).unwrap_or_else(|e| {
            tracing::warn!("Ignoring stored OSC port: {}", e);
            DEFAULT_PORT
        });
        let config = OscConfig {
            port,
            target_ip: scope.get_string("targetip", ""),
            address_format: scope.get_string("addrfmt", DEFAULT_ADDRESS_FORMAT),
        };
        scope.end()?;
        Ok(config)
    }

    fn save(&self, config: &OscConfig) -> Result<()> {
        let mut scope = Scope::open(self.store.as_ref(), OSC_NAMESPACE, false)?;
        scope.put_int("port", i64::from(config.port))?;
        scope.put_string("targetip", &config.target_ip)?;
        scope.put_string("addrfmt", &config.address_format)?;
        scope.end()
    }

    pub async fn config(&self) -> OscConfig {
        self.config.lock().await.clone()
    }

    pub async fn port(&self) -> u16 {
        self.config.lock().await.port
    }

    pub async fn target_ip(&self) -> String {
        self.config.lock().await.target_ip.clone()
    }

    pub async fn address_format(&self) -> String {
        self.config.lock().await.address_format.clone()
    }

    pub async fn set_port(&self, port: i64) -> Result<()> {
        let port = validate_port(port)?;
        let mut config = self.config.lock().await;
        config.port = port;
        self.save(&config)
    }

    pub async fn set_target_ip(&self, target: &str) -> Result<()> {
        let mut config = self.config.lock().await;
        config.target_ip = target.to_string();
        self.save(&config)
    }

    pub async fn set_address_format(&self, format: &str) -> Result<()> {
        let mut config = self.config.lock().await;
        config.address_format = format.to_string();
        self.save(&config)
    }

    /// Applies whatever fields of a portal form are valid and persists once.
    /// Returns whether anything was accepted.
    pub async fn apply_update(&self, request: &OscSettingsRequest) -> Result<bool> {
        let mut config = self.config.lock().await;
        let mut changed = false;

        if let Some(raw) = &request.port {
            match raw.trim().parse::<i64>().ok().and_then(|p| validate_port(p).ok()) {
                Some(port) => {
                    config.port = port;
                    changed = true;
                }
                None => tracing::warn!("Ignoring invalid OSC port '{}'", raw),
            }
        }
        if let Some(target) = &request.targetip {
            config.target_ip = target.clone();
            changed = true;
        }
        if let Some(format) = &request.address_format {
            config.address_format = format.clone();
            changed = true;
        }

        if changed {
            self.save(&config)?;
            tracing::info!(
                "OSC settings saved: port={}, target={}, format={}",
                config.port,
                target_label(&config.target_ip),
                config.address_format
            );
        }
        Ok(changed)
    }

    pub async fn format_address(&self, trigger_id: u32) -> String {
        format_address(&self.config.lock().await.address_format, trigger_id)
    }

    /// The override when it parses, otherwise every active broadcast address.
    pub async fn target_addresses(&self) -> Vec<Ipv4Addr> {
        let target_ip = self.target_ip().await;
        let topology = self.topology.topology().await;
        broadcast::resolve(&target_ip, &topology)
    }

    /// Sends `<address><id>` with a single `1.0` float to every target.
    pub async fn dispatch(&self, trigger_id: u32) -> DispatchReport {
        let config = self.config().await;
        let address = format_address(&config.address_format, trigger_id);
        let payload = OscMessage::trigger(address.clone()).encode();
        let targets = broadcast::resolve(&config.target_ip, &self.topology.topology().await);

        let mut report = DispatchReport {
            address,
            ..Default::default()
        };
        for ip in targets {
            let target = SocketAddr::V4(SocketAddrV4::new(ip, config.port));
            match self.sink.send_to(&payload, target).await {
                Ok(_) => {
                    tracing::info!(
                        address = %report.address,
                        dest = %target,
                        "OSC sent (value=1.0)"
                    );
                    report.sent.push(target);
                }
                Err(e) => {
                    tracing::warn!(dest = %target, "OSC send failed: {}", e);
                    report.failed.push((target, e.to_string()));
                }
            }
        }
        report
    }

    /// Flags a test trigger and describes where it will go.
    pub async fn request_test(&self, trigger_id: u32) -> TestPreview {
        let port = self.port().await;
        let preview = TestPreview {
            address: self.format_address(trigger_id).await,
            targets: self
                .target_addresses()
                .await
                .into_iter()
                .map(|ip| format!("{}:{}", ip, port))
                .collect(),
        };
        self.test_requested.store(true, Ordering::SeqCst);
        tracing::info!("OSC test requested via web UI");
        preview
    }

    /// True exactly once per request; repeated requests coalesce.
    pub fn check_and_clear_test_request(&self) -> bool {
        self.test_requested.swap(false, Ordering::SeqCst)
    }
}

fn target_label(target_ip: &str) -> &str {
    if target_ip.is_empty() { "broadcast" } else { target_ip }
}

#[async_trait]
impl TemplateVariables for OscDispatcher {
    async fn variable(&self, name: &str) -> Option<String> {
        let config = self.config.lock().await;
        match name {
            "OSC_PORT" => Some(config.port.to_string()),
            "OSC_TARGET_IP" => Some(target_label(&config.target_ip).to_string()),
            "OSC_ADDRESS_FORMAT" => Some(config.address_format.clone()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::broadcast::{Topology, AP_BROADCAST};
    use crate::settings::MemoryStore;
    use std::sync::Mutex as StdMutex;

    struct FixedTopology(StdMutex<Topology>);

    impl FixedTopology {
        fn new(topology: Topology) -> Arc<Self> {
            Arc::new(Self(StdMutex::new(topology)))
        }
    }

    #[async_trait]
    impl TopologySource for FixedTopology {
        async fn topology(&self) -> Topology {
            *self.0.lock().unwrap()
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        sent: StdMutex<Vec<(Vec<u8>, SocketAddr)>>,
        refuse: Option<SocketAddr>,
    }

    #[async_trait]
    impl DatagramSink for RecordingSink {
        async fn send_to(&self, payload: &[u8], target: SocketAddr) -> std::io::Result<usize> {
            self.sent.lock().unwrap().push((payload.to_vec(), target));
            if self.refuse == Some(target) {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    "refused",
                ));
            }
            Ok(payload.len())
        }
    }

    const STATION: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 42);
    const STATION_BROADCAST: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 255);

    fn dispatcher(
        store: Arc<MemoryStore>,
        topology: Topology,
        sink: Arc<RecordingSink>,
    ) -> OscDispatcher {
        OscDispatcher::new(store, FixedTopology::new(topology), sink)
    }

    fn target(ip: Ipv4Addr, port: u16) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(ip, port))
    }

    #[test]
    fn address_formatting_always_appends() {
        assert_eq!(format_address("/kmpush", 1), "/kmpush1");
        assert_eq!(format_address("/km/push/", 1), "/km/push/1");
        assert_eq!(format_address("kmpush", 12), "kmpush12");
        assert_eq!(format_address("", 3), "3");
    }

    #[tokio::test]
    async fn defaults_without_stored_settings() {
        let d = dispatcher(Arc::new(MemoryStore::new()), Topology::ap_only(), Arc::default());
        assert_eq!(d.config().await, OscConfig::default());
        assert_eq!(d.port().await, 8001);
        assert_eq!(d.variable("OSC_TARGET_IP").await.as_deref(), Some("broadcast"));
        assert_eq!(d.variable("OSC_PORT").await.as_deref(), Some("8001"));
        assert_eq!(d.variable("AP_SSID").await, None);
    }

    #[tokio::test]
    async fn port_survives_reload() {
        let store = Arc::new(MemoryStore::new());
        let d = dispatcher(store.clone(), Topology::ap_only(), Arc::default());
        d.set_port(9000).await.unwrap();
        d.set_address_format("/km/push/").await.unwrap();

        let reloaded = dispatcher(store, Topology::ap_only(), Arc::default());
        assert_eq!(reloaded.port().await, 9000);
        assert_eq!(reloaded.address_format().await, "/km/push/");
    }

    #[tokio::test]
    async fn out_of_range_port_is_rejected() {
        let d = dispatcher(Arc::new(MemoryStore::new()), Topology::ap_only(), Arc::default());
        assert!(matches!(d.set_port(0).await, Err(Error::InvalidPort(0))));
        assert!(matches!(d.set_port(65536).await, Err(Error::InvalidPort(65536))));
        assert!(d.set_port(65535).await.is_ok());
        assert_eq!(d.port().await, 65535);
    }

    #[tokio::test]
    async fn update_applies_valid_fields_only() {
        let store = Arc::new(MemoryStore::new());
        let d = dispatcher(store.clone(), Topology::ap_only(), Arc::default());

        let changed = d
            .apply_update(&OscSettingsRequest {
                port: Some("99999".into()),
                targetip: Some("10.0.0.7".into()),
                address_format: None,
            })
            .await
            .unwrap();
        assert!(changed);
        assert_eq!(d.port().await, 8001);
        assert_eq!(d.target_ip().await, "10.0.0.7");

        let reloaded = dispatcher(store, Topology::ap_only(), Arc::default());
        assert_eq!(reloaded.target_ip().await, "10.0.0.7");
    }

    #[tokio::test]
    async fn empty_update_changes_nothing() {
        let d = dispatcher(Arc::new(MemoryStore::new()), Topology::ap_only(), Arc::default());
        assert!(!d.apply_update(&OscSettingsRequest::default()).await.unwrap());
        assert!(!d
            .apply_update(&OscSettingsRequest {
                port: Some("abc".into()),
                ..Default::default()
            })
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn dispatch_sends_once_per_broadcast_target() {
        let sink = Arc::new(RecordingSink::default());
        let d = dispatcher(Arc::new(MemoryStore::new()), Topology::dual(STATION), sink.clone());

        let report = d.dispatch(1).await;
        assert_eq!(report.address, "/kmpush1");
        assert_eq!(
            report.sent,
            vec![target(STATION_BROADCAST, 8001), target(AP_BROADCAST, 8001)]
        );

        let expected = OscMessage::trigger("/kmpush1").encode();
        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|(payload, _)| *payload == expected));
    }

    #[tokio::test]
    async fn override_target_replaces_broadcast() {
        let sink = Arc::new(RecordingSink::default());
        let d = dispatcher(Arc::new(MemoryStore::new()), Topology::dual(STATION), sink.clone());
        d.set_target_ip("192.168.1.20").await.unwrap();

        let report = d.dispatch(4).await;
        assert_eq!(report.sent, vec![target(Ipv4Addr::new(192, 168, 1, 20), 8001)]);
        assert_eq!(report.address, "/kmpush4");
    }

    #[tokio::test]
    async fn failed_target_does_not_stop_the_rest() {
        let sink = Arc::new(RecordingSink {
            refuse: Some(target(STATION_BROADCAST, 8001)),
            ..Default::default()
        });
        let d = dispatcher(Arc::new(MemoryStore::new()), Topology::dual(STATION), sink.clone());

        let report = d.dispatch(2).await;
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.sent, vec![target(AP_BROADCAST, 8001)]);
        assert_eq!(sink.sent.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_request_is_consumed_once() {
        let d = dispatcher(Arc::new(MemoryStore::new()), Topology::ap_only(), Arc::default());
        assert!(!d.check_and_clear_test_request());

        let preview = d.request_test(1).await;
        assert_eq!(preview.address, "/kmpush1");
        assert_eq!(preview.targets, vec!["192.168.4.255:8001".to_string()]);

        d.request_test(1).await;
        assert!(d.check_and_clear_test_request());
        assert!(!d.check_and_clear_test_request());
    }
}
