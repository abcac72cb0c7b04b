// 后端：nmcli（通过 NetworkManager 命令行控制无线电）
// AP 与 station 使用两个独立的接口，以便同时运行。

use crate::config::{ApConfig, StationConfig};
use crate::network::broadcast::AP_ADDRESS;
use crate::structs::{AccessPointSettings, LinkStatus, RadioMode, RadioScan, ScannedNetwork};
use crate::traits::WifiRadio;
use crate::{Error, Result};
use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

const AP_CONNECTION_NAME: &str = "oscmuis-ap";
// 每次连接都复用同一个 station 配置名，断开时删除
const STATION_CONNECTION_NAME: &str = "oscmuis-sta";

#[derive(Debug)]
pub struct NmcliBackend {
    ap_iface: String,
    sta_iface: String,
    mode: Mutex<RadioMode>,
    ap_settings: Mutex<Option<AccessPointSettings>>,
    // 正在进行的 `nmcli device wifi connect` 进程
    joining: Mutex<Option<Child>>,
    scan: Arc<Mutex<RadioScan>>,
}

impl NmcliBackend {
    pub fn new(ap: &ApConfig, station: &StationConfig) -> Result<Self> {
        if ap.interface == station.interface {
            return Err(Error::Config(format!(
                "nmcli backend needs separate AP and station interfaces, both are '{}'",
                ap.interface
            )));
        }
        Ok(Self {
            ap_iface: ap.interface.clone(),
            sta_iface: station.interface.clone(),
            mode: Mutex::new(RadioMode::Off),
            ap_settings: Mutex::new(None),
            joining: Mutex::new(None),
            scan: Arc::new(Mutex::new(RadioScan::NotStarted)),
        })
    }

    async fn stop_ap(&self) {
        let _ = Command::new("nmcli")
            .args(["connection", "down", AP_CONNECTION_NAME])
            .output()
            .await;
        let _ = Command::new("nmcli")
            .args(["connection", "delete", AP_CONNECTION_NAME])
            .output()
            .await;
        *self.ap_settings.lock().await = None;
    }

    async fn forget_station_profile(&self) {
        let out = Command::new("nmcli")
            .args(["connection", "delete", "id", STATION_CONNECTION_NAME])
            .output()
            .await;
        match out {
            Ok(out) if out.status.success() => {
                tracing::debug!("Removed station connection profile");
            }
            // 配置不存在时 nmcli 会报错，忽略
            Ok(_) => {}
            Err(e) => tracing::debug!("Could not remove station connection profile: {}", e),
        }
    }

    async fn stop_joining(&self) {
        if let Some(mut child) = self.joining.lock().await.take() {
            let _ = child.start_kill();
        }
    }
}

/// Runs a command and returns its stdout, or its stderr as the error.
async fn run(program: &str, args: &[&str]) -> Result<String> {
    let output = Command::new(program).args(args).output().await?;
    if !output.status.success() {
        let err = String::from_utf8_lossy(&output.stderr);
        return Err(Error::CommandFailed(format!(
            "{} {} failed: {}",
            program,
            args.first().copied().unwrap_or_default(),
            err.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Arguments for `nmcli device wifi connect` under the fixed station profile name.
fn station_connect_args(ssid: &str, password: &str, iface: &str) -> Vec<String> {
    let mut args: Vec<String> = ["device", "wifi", "connect", ssid]
        .iter()
        .map(|s| s.to_string())
        .collect();
    if !password.is_empty() {
        args.extend(["password".to_string(), password.to_string()]);
    }
    args.extend([
        "ifname".to_string(),
        iface.to_string(),
        "name".to_string(),
        STATION_CONNECTION_NAME.to_string(),
    ]);
    args
}

fn prefix_len(netmask: Ipv4Addr) -> u32 {
    u32::from(netmask).count_ones()
}

/// Splits one line of `nmcli -t` output, honouring `\:` and `\\` escapes.
fn split_terse(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            ':' => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    fields.push(current);
    fields
}

/// Parses `nmcli -t -f SSID,SIGNAL,SECURITY device wifi list`.
/// nmcli reports signal quality in percent; it is mapped back to dBm.
fn parse_wifi_list(output: &str) -> Vec<ScannedNetwork> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let fields = split_terse(line);
            let ssid = fields.first()?.clone();
            if ssid.is_empty() {
                return None;
            }
            let quality: i32 = fields.get(1).and_then(|s| s.parse().ok()).unwrap_or(0);
            let security = fields.get(2).map(String::as_str).unwrap_or("");
            Some(ScannedNetwork {
                ssid,
                rssi: quality.clamp(0, 100) / 2 - 100,
                secure: !security.is_empty() && security != "--",
            })
        })
        .collect()
}

/// Parses `nmcli -t -f GENERAL.STATE,IP4.ADDRESS device show <iface>`.
fn parse_device_show(output: &str) -> LinkStatus {
    let mut state_code: Option<u32> = None;
    let mut address: Option<Ipv4Addr> = None;
    for line in output.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        if key == "GENERAL.STATE" {
            state_code = value.split_whitespace().next().and_then(|c| c.parse().ok());
        } else if key.starts_with("IP4.ADDRESS") && address.is_none() {
            address = value.split('/').next().and_then(|a| a.parse().ok());
        }
    }

    match (state_code, address) {
        (Some(100), Some(ip)) => LinkStatus::Connected(ip),
        (Some(code), _) if (40..=100).contains(&code) => LinkStatus::Connecting,
        (Some(120), _) => LinkStatus::Failed("NetworkManager reported activation failure".into()),
        _ => LinkStatus::Disconnected,
    }
}

#[async_trait]
impl WifiRadio for NmcliBackend {
    async fn set_country(&self, code: &str) -> Result<()> {
        run("iw", &["reg", "set", code]).await.map(|_| ())
    }

    async fn set_mode(&self, mode: RadioMode) -> Result<()> {
        let mut current = self.mode.lock().await;
        if mode != RadioMode::AccessPointStation {
            self.stop_joining().await;
            let _ = run("nmcli", &["device", "disconnect", self.sta_iface.as_str()]).await;
        }
        if mode == RadioMode::Off {
            self.stop_ap().await;
        }
        *current = mode;
        Ok(())
    }

    async fn mode(&self) -> RadioMode {
        *self.mode.lock().await
    }

    async fn start_access_point(&self, settings: &AccessPointSettings) -> Result<()> {
        // 删除旧的热点连接，确保新配置生效
        self.stop_ap().await;

        let cidr = format!("{}/{}", settings.address, prefix_len(settings.netmask));
        let channel = settings.channel.to_string();
        let mut args: Vec<&str> = vec![
            "connection", "add",
            "type", "wifi",
            "ifname", self.ap_iface.as_str(),
            "con-name", AP_CONNECTION_NAME,
            "autoconnect", "no",
            "ssid", settings.ssid.as_str(),
            "802-11-wireless.mode", "ap",
            "802-11-wireless.band", "bg",
            "802-11-wireless.channel", channel.as_str(),
            "ipv4.method", "shared",
            "ipv4.addresses", cidr.as_str(),
        ];
        if let Some(psk) = &settings.password {
            args.extend(["wifi-sec.key-mgmt", "wpa-psk", "wifi-sec.psk", psk.as_str()]);
        }
        run("nmcli", &args).await?;
        run("nmcli", &["connection", "up", AP_CONNECTION_NAME]).await?;

        *self.ap_settings.lock().await = Some(settings.clone());
        Ok(())
    }

    async fn access_point_ip(&self) -> Ipv4Addr {
        self.ap_settings
            .lock()
            .await
            .as_ref()
            .map(|s| s.address)
            .unwrap_or(AP_ADDRESS)
    }

    async fn access_point_clients(&self) -> usize {
        match run("iw", &["dev", self.ap_iface.as_str(), "station", "dump"]).await {
            Ok(out) => out.lines().filter(|l| l.starts_with("Station ")).count(),
            Err(e) => {
                tracing::debug!("Could not list AP clients: {}", e);
                0
            }
        }
    }

    async fn begin_station(&self, ssid: &str, password: &str) -> Result<()> {
        self.stop_joining().await;
        self.forget_station_profile().await;
        let child = Command::new("nmcli")
            .args(station_connect_args(ssid, password, &self.sta_iface))
            .spawn()?;
        *self.joining.lock().await = Some(child);
        Ok(())
    }

    async fn disconnect_station(&self) -> Result<()> {
        self.stop_joining().await;
        let result = match run("nmcli", &["device", "disconnect", self.sta_iface.as_str()]).await {
            Ok(_) => Ok(()),
            // 未连接时 nmcli 也会报错，忽略
            Err(Error::CommandFailed(msg)) if msg.contains("not active") => Ok(()),
            Err(e) => Err(e),
        };
        self.forget_station_profile().await;
        result
    }

    async fn station_link(&self) -> LinkStatus {
        {
            let mut joining = self.joining.lock().await;
            if let Some(child) = joining.as_mut() {
                if let Ok(Some(status)) = child.try_wait() {
                    joining.take();
                    if !status.success() {
                        return LinkStatus::Failed(format!("nmcli connect exited with {}", status));
                    }
                }
            }
        }
        match run(
            "nmcli",
            &["-t", "-f", "GENERAL.STATE,IP4.ADDRESS", "device", "show", self.sta_iface.as_str()],
        )
        .await
        {
            Ok(out) => parse_device_show(&out),
            Err(e) => {
                tracing::debug!("Station status query failed: {}", e);
                LinkStatus::Disconnected
            }
        }
    }

    async fn start_scan(&self) -> Result<()> {
        {
            let mut scan = self.scan.lock().await;
            if *scan == RadioScan::Running {
                return Ok(());
            }
            *scan = RadioScan::Running;
        }

        let slot = self.scan.clone();
        let iface = self.sta_iface.clone();
        tokio::spawn(async move {
            let _ = run("nmcli", &["device", "wifi", "rescan", "ifname", iface.as_str()]).await;
            let result = run(
                "nmcli",
                &[
                    "-t",
                    "-f",
                    "SSID,SIGNAL,SECURITY",
                    "device",
                    "wifi",
                    "list",
                    "ifname",
                    iface.as_str(),
                ],
            )
            .await;
            *slot.lock().await = match result {
                Ok(out) => RadioScan::Done(parse_wifi_list(&out)),
                Err(e) => {
                    tracing::error!("nmcli scan failed: {}", e);
                    RadioScan::Failed
                }
            };
        });
        Ok(())
    }

    async fn scan_status(&self) -> RadioScan {
        self.scan.lock().await.clone()
    }

    async fn clear_scan(&self) {
        let mut scan = self.scan.lock().await;
        if *scan != RadioScan::Running {
            *scan = RadioScan::NotStarted;
        }
    }
}
