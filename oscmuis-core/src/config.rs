use crate::{Error, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// 默认配置，编译进二进制
pub const DEFAULT_CONFIG_TOML: &str = include_str!("../../configs.toml");

pub const DEFAULT_AP_CHANNEL: u8 = 6;
pub const DEFAULT_COUNTRY: &str = "NL";

/// 顶层应用配置
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub ap: ApConfig,
    pub station: StationConfig,
    pub portal: PortalConfig,
    pub storage: StorageConfig,
    pub scheduler: SchedulerConfig,
    pub connect: ConnectPolicy,
}

// ============= AP 配置 =============

#[derive(Debug, Clone)]
pub struct ApConfig {
    pub ssid: String,
    /// Shorter than 8 characters means an open network.
    pub password: String,
    pub channel: u8,
    /// Empty leaves the radio's regulatory domain alone.
    pub country_code: String,
    pub interface: String,
}

#[derive(Debug, Clone)]
pub struct StationConfig {
    pub interface: String,
}

#[derive(Debug, Clone)]
pub struct PortalConfig {
    pub title: String,
    pub subtitle: String,
    pub bind_addr: SocketAddr,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick: Duration,
    /// Trigger id sent when the portal asks for a test message.
    pub test_trigger_id: u32,
}

/// Bounds of a single station connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectPolicy {
    pub poll_interval: Duration,
    pub max_attempts: u32,
}

impl Default for ConnectPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            max_attempts: 20,
        }
    }
}

/// 用于解析 TOML 的临时结构
#[derive(Deserialize)]
struct AppConfigFile {
    ap: ApConfigToml,
    #[serde(default)]
    station: StationConfigToml,
    #[serde(default)]
    portal: PortalConfigToml,
    #[serde(default)]
    storage: StorageConfigToml,
    #[serde(default)]
    scheduler: SchedulerConfigToml,
    #[serde(default)]
    connect: ConnectConfigToml,
}

#[derive(Deserialize)]
struct ApConfigToml {
    ssid: String,
    #[serde(default)]
    password: String,
    #[serde(default = "default_channel")]
    channel: u8,
    #[serde(default = "default_country")]
    country_code: String,
    #[serde(default = "default_ap_interface")]
    interface: String,
}

#[derive(Deserialize)]
struct StationConfigToml {
    #[serde(default = "default_station_interface")]
    interface: String,
}

impl Default for StationConfigToml {
    fn default() -> Self {
        Self {
            interface: default_station_interface(),
        }
    }
}

#[derive(Deserialize)]
struct PortalConfigToml {
    #[serde(default = "default_title")]
    title: String,
    #[serde(default)]
    subtitle: String,
    #[serde(default = "default_bind_addr")]
    bind_addr: String,
}

impl Default for PortalConfigToml {
    fn default() -> Self {
        Self {
            title: default_title(),
            subtitle: String::new(),
            bind_addr: default_bind_addr(),
        }
    }
}

#[derive(Deserialize)]
struct StorageConfigToml {
    #[serde(default = "default_storage_dir")]
    dir: String,
}

impl Default for StorageConfigToml {
    fn default() -> Self {
        Self {
            dir: default_storage_dir(),
        }
    }
}

#[derive(Deserialize)]
struct SchedulerConfigToml {
    #[serde(default = "default_tick_ms")]
    tick_ms: u64,
    #[serde(default = "default_test_trigger_id")]
    test_trigger_id: u32,
}

impl Default for SchedulerConfigToml {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            test_trigger_id: default_test_trigger_id(),
        }
    }
}

#[derive(Deserialize)]
struct ConnectConfigToml {
    #[serde(default = "default_poll_interval_ms")]
    poll_interval_ms: u64,
    #[serde(default = "default_max_attempts")]
    max_attempts: u32,
}

impl Default for ConnectConfigToml {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_channel() -> u8 {
    DEFAULT_AP_CHANNEL
}
fn default_country() -> String {
    DEFAULT_COUNTRY.to_string()
}
fn default_ap_interface() -> String {
    "wlan0".to_string()
}
fn default_station_interface() -> String {
    "wlan1".to_string()
}
fn default_title() -> String {
    "WiFi Manager".to_string()
}
fn default_bind_addr() -> String {
    "192.168.4.1:80".to_string()
}
fn default_storage_dir() -> String {
    "/var/lib/oscmuis".to_string()
}
fn default_tick_ms() -> u64 {
    50
}
fn default_test_trigger_id() -> u32 {
    1
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_max_attempts() -> u32 {
    20
}

impl TryFrom<AppConfigFile> for AppConfig {
    type Error = Error;

    fn try_from(t: AppConfigFile) -> Result<Self> {
        if t.ap.ssid.is_empty() {
            return Err(Error::Config("ap.ssid must not be empty".into()));
        }
        if !(1..=13).contains(&t.ap.channel) {
            return Err(Error::Config(format!(
                "ap.channel must be 1-13, got {}",
                t.ap.channel
            )));
        }
        let bind_addr = SocketAddr::from_str(&t.portal.bind_addr).map_err(|e| {
            Error::Config(format!("invalid portal.bind_addr '{}': {}", t.portal.bind_addr, e))
        })?;
        if t.scheduler.tick_ms == 0 {
            return Err(Error::Config("scheduler.tick_ms must be positive".into()));
        }
        if t.connect.max_attempts == 0 {
            return Err(Error::Config("connect.max_attempts must be positive".into()));
        }

        Ok(AppConfig {
            ap: ApConfig {
                ssid: t.ap.ssid,
                password: t.ap.password,
                channel: t.ap.channel,
                country_code: t.ap.country_code,
                interface: t.ap.interface,
            },
            station: StationConfig {
                interface: t.station.interface,
            },
            portal: PortalConfig {
                title: t.portal.title,
                subtitle: t.portal.subtitle,
                bind_addr,
            },
            storage: StorageConfig {
                dir: PathBuf::from(t.storage.dir),
            },
            scheduler: SchedulerConfig {
                tick: Duration::from_millis(t.scheduler.tick_ms),
                test_trigger_id: t.scheduler.test_trigger_id,
            },
            connect: ConnectPolicy {
                poll_interval: Duration::from_millis(t.connect.poll_interval_ms),
                max_attempts: t.connect.max_attempts,
            },
        })
    }
}

// ============= 配置加载函数 =============

/// 从 TOML 字符串加载应用配置
pub fn load_config_from_toml_str(s: &str) -> Result<AppConfig> {
    let parsed: AppConfigFile = toml::from_str(s)?;
    AppConfig::try_from(parsed)
}

/// Loads the config file at `path`, or the built-in defaults when `None`.
pub fn load_config(path: Option<&std::path::Path>) -> Result<AppConfig> {
    match path {
        Some(p) => {
            let content = std::fs::read_to_string(p)?;
            load_config_from_toml_str(&content)
        }
        None => load_config_from_toml_str(DEFAULT_CONFIG_TOML),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_config_parses() {
        let config = load_config(None).unwrap();
        assert_eq!(config.ap.channel, 6);
        assert_eq!(config.ap.country_code, "NL");
        assert_eq!(config.connect, ConnectPolicy::default());
        assert_eq!(config.portal.bind_addr.port(), 80);
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let config = load_config_from_toml_str("[ap]\nssid = \"OSC-Muis\"\n").unwrap();
        assert_eq!(config.ap.password, "");
        assert_eq!(config.scheduler.tick, Duration::from_millis(50));
        assert_eq!(config.scheduler.test_trigger_id, 1);
        assert_eq!(config.station.interface, "wlan1");
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            load_config_from_toml_str("[ap]\nssid = \"\"\n"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            load_config_from_toml_str("[ap]\nssid = \"x\"\nchannel = 14\n"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            load_config_from_toml_str("[ap]\nssid = \"x\"\n[portal]\nbind_addr = \"nope\"\n"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            load_config_from_toml_str("ap = 3"),
            Err(Error::Toml(_))
        ));
    }
}
