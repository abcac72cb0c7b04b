use crate::network::broadcast::Topology;
use crate::structs::{AccessPointSettings, LinkStatus, RadioMode, RadioScan};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};

// 在这里定义所有后端和协作者共享的 trait。

/// Raw control over the Wi-Fi radio.
///
/// Implementations only execute commands and report status; all mode
/// bookkeeping lives in `NetworkModeController`.
#[async_trait]
pub trait WifiRadio: Send + Sync {
    /// Applies a regulatory country code (e.g. "NL").
    async fn set_country(&self, code: &str) -> crate::Result<()>;

    async fn set_mode(&self, mode: RadioMode) -> crate::Result<()>;

    async fn mode(&self) -> RadioMode;

    /// Configures the AP subnet and starts broadcasting.
    async fn start_access_point(&self, settings: &AccessPointSettings) -> crate::Result<()>;

    async fn access_point_ip(&self) -> Ipv4Addr;

    /// Number of clients associated with the access point.
    async fn access_point_clients(&self) -> usize;

    /// Starts associating with a network. Returns before the outcome is known.
    async fn begin_station(&self, ssid: &str, password: &str) -> crate::Result<()>;

    async fn disconnect_station(&self) -> crate::Result<()>;

    async fn station_link(&self) -> LinkStatus;

    /// Requests an asynchronous scan. Results are collected via `scan_status`.
    async fn start_scan(&self) -> crate::Result<()>;

    async fn scan_status(&self) -> RadioScan;

    /// Drops completed scan results so the next poll starts from scratch.
    async fn clear_scan(&self);
}

/// The values stored under one namespace.
pub type SettingsMap = BTreeMap<String, Value>;

/// 命名空间键值存储
/// Synchronous by contract; see `settings::Scope` for the open/close handle.
pub trait SettingsStore: Send + Sync {
    fn read(&self, namespace: &str) -> crate::Result<SettingsMap>;
    fn write(&self, namespace: &str, values: &SettingsMap) -> crate::Result<()>;
}

/// Narrow view of the network state needed to resolve broadcast targets.
#[async_trait]
pub trait TopologySource: Send + Sync {
    async fn topology(&self) -> Topology;
}

/// The UDP side of the OSC dispatcher.
#[async_trait]
pub trait DatagramSink: Send + Sync {
    async fn send_to(&self, payload: &[u8], target: SocketAddr) -> std::io::Result<usize>;
}

/// Supplies named values to the portal page renderer.
///
/// Returns `None` when the variable is not owned by this provider.
#[async_trait]
pub trait TemplateVariables: Send + Sync {
    async fn variable(&self, name: &str) -> Option<String>;
}
