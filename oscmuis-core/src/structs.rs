use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// 无线电当前的工作模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioMode {
    Off,
    /// Access point only.
    AccessPoint,
    /// Access point plus station (dual mode).
    AccessPointStation,
}

/// Association state of the station interface as reported by the radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkStatus {
    Disconnected,
    Connecting,
    Connected(Ipv4Addr),
    /// The radio gave up on its own (e.g. authentication rejected).
    Failed(String),
}

/// 表示扫描到的单个 Wi-Fi 网络
/// Serialized exactly as the portal expects: `{"ssid","rssi","secure"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScannedNetwork {
    pub ssid: String,
    pub rssi: i32, // dBm
    pub secure: bool,
}

/// Progress of the radio's own asynchronous scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioScan {
    NotStarted,
    Running,
    Done(Vec<ScannedNetwork>),
    Failed,
}

/// Everything the radio needs to bring up the access point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPointSettings {
    pub ssid: String,
    /// `None` means an open network.
    pub password: Option<String>,
    pub channel: u8,
    pub address: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub netmask: Ipv4Addr,
}

/// /connect 的表单请求体
/// Both fields are optional so a missing parameter can be reported
/// instead of being rejected by the extractor.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectionRequest {
    pub ssid: Option<String>,
    pub password: Option<String>,
}

/// POST /osc 的表单请求体
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OscSettingsRequest {
    pub port: Option<String>,
    pub targetip: Option<String>,
    #[serde(rename = "addressFormat")]
    pub address_format: Option<String>,
}
