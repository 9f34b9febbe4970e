use serde::{Deserialize, Serialize};

use crate::signal::SignalKind;

pub const DEFAULT_HOSTNAME: &str = "ESP32-Sensor-Monitor";
pub const DEFAULT_OTA_PASSWORD: &str = "admin";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub collector_host: String,
    pub collector_port: u16,
    pub signal: SignalKind,
    pub signal_pin: i32,
    pub sample_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            collector_host: "192.168.1.200".to_string(),
            collector_port: 80,
            signal: SignalKind::Touch {
                threshold: 40_000,
                rises_on_touch: true,
            },
            signal_pin: 4,
            sample_interval_ms: 100,
            heartbeat_interval_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub hostname: String,
    pub ota_password: String,
    pub http_port: u16,
    pub use_static_ip: bool,
    pub static_ip: Option<[u8; 4]>,
    pub gateway: Option<[u8; 4]>,
    pub subnet: Option<[u8; 4]>,
    pub dns: Option<[u8; 4]>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            hostname: DEFAULT_HOSTNAME.to_string(),
            ota_password: DEFAULT_OTA_PASSWORD.to_string(),
            http_port: 80,
            use_static_ip: true,
            static_ip: Some([192, 168, 1, 200]),
            gateway: Some([192, 168, 1, 2]),
            subnet: Some([255, 255, 255, 0]),
            dns: Some([8, 8, 8, 8]),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedConfig {
    pub pin: i32,
    pub brightness: u8,
}

impl Default for LedConfig {
    fn default() -> Self {
        Self {
            pin: 48,
            brightness: 128,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub led: LedConfig,
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.node.sanitize();
        self.network.sanitize();
        self.led.sanitize();
    }
}

impl NodeConfig {
    pub fn sanitize(&mut self) {
        if self.collector_port == 0 {
            self.collector_port = 80;
        }
        if self.signal_pin < 0 {
            self.signal_pin = 4;
        }
        self.sample_interval_ms = self.sample_interval_ms.clamp(20, 10_000);
        self.heartbeat_interval_ms = self.heartbeat_interval_ms.clamp(1_000, 600_000);
    }

    pub fn collector_url(&self) -> String {
        format!("http://{}:{}", self.collector_host, self.collector_port)
    }
}

impl NetworkConfig {
    pub fn sanitize(&mut self) {
        if self.hostname.trim().is_empty() {
            self.hostname = DEFAULT_HOSTNAME.to_string();
        }
        if self.http_port == 0 {
            self.http_port = 80;
        }
        if self.use_static_ip
            && (self.static_ip.is_none() || self.gateway.is_none() || self.subnet.is_none())
        {
            self.use_static_ip = false;
        }
    }
}

impl LedConfig {
    pub fn sanitize(&mut self) {
        if self.pin < 0 {
            self.pin = 48;
        }
    }
}

#[derive(Debug, Serialize)]
pub struct NetworkConfigView {
    #[serde(rename = "wifiSsid")]
    pub wifi_ssid: String,
    #[serde(rename = "wifiPassSet")]
    pub wifi_pass_set: bool,
    pub hostname: String,
    #[serde(rename = "otaPasswordSet")]
    pub ota_password_set: bool,
    #[serde(rename = "useStaticIp")]
    pub use_static_ip: bool,
    #[serde(rename = "staticIp")]
    pub static_ip: Option<[u8; 4]>,
    pub gateway: Option<[u8; 4]>,
    pub subnet: Option<[u8; 4]>,
    pub dns: Option<[u8; 4]>,
    #[serde(rename = "collectorHost")]
    pub collector_host: String,
    #[serde(rename = "collectorPort")]
    pub collector_port: u16,
}

#[derive(Debug, Deserialize)]
pub struct NetworkConfigUpdate {
    #[serde(rename = "wifiSsid")]
    pub wifi_ssid: String,
    #[serde(rename = "wifiPass", default)]
    pub wifi_pass: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(rename = "otaPassword", default)]
    pub ota_password: Option<String>,
    #[serde(rename = "useStaticIp")]
    pub use_static_ip: bool,
    #[serde(rename = "staticIp")]
    pub static_ip: Option<[u8; 4]>,
    pub gateway: Option<[u8; 4]>,
    pub subnet: Option<[u8; 4]>,
    pub dns: Option<[u8; 4]>,
    #[serde(rename = "collectorHost", default)]
    pub collector_host: Option<String>,
    #[serde(rename = "collectorPort", default)]
    pub collector_port: Option<u16>,
}

#[derive(Debug, Serialize)]
pub struct NetworkUpdateResponse {
    #[serde(rename = "restartRequired")]
    pub restart_required: bool,
    pub network: NetworkConfigView,
}

pub fn build_network_config_view(runtime: &RuntimeConfig) -> NetworkConfigView {
    let network = &runtime.network;
    NetworkConfigView {
        wifi_ssid: network.wifi_ssid.clone(),
        wifi_pass_set: !network.wifi_pass.is_empty(),
        hostname: network.hostname.clone(),
        ota_password_set: !network.ota_password.is_empty(),
        use_static_ip: network.use_static_ip,
        static_ip: network.static_ip,
        gateway: network.gateway,
        subnet: network.subnet,
        dns: network.dns,
        collector_host: runtime.node.collector_host.clone(),
        collector_port: runtime.node.collector_port,
    }
}

pub fn validate_network_update(update: &NetworkConfigUpdate) -> Result<(), &'static str> {
    if update.wifi_ssid.trim().is_empty() {
        return Err("wifiSsid cannot be empty");
    }
    if update.collector_port == Some(0) {
        return Err("collectorPort must be between 1 and 65535");
    }
    if matches!(update.collector_host.as_deref(), Some(host) if host.trim().is_empty()) {
        return Err("collectorHost cannot be empty");
    }
    if update.use_static_ip
        && (update.static_ip.is_none() || update.gateway.is_none() || update.subnet.is_none())
    {
        return Err("staticIp, gateway, and subnet are required when useStaticIp is true");
    }

    Ok(())
}

/// Applies a validated update in place and returns the response body.
pub fn apply_network_update(
    runtime: &mut RuntimeConfig,
    update: NetworkConfigUpdate,
) -> NetworkUpdateResponse {
    let previous = runtime.clone();

    runtime.network.wifi_ssid = update.wifi_ssid;
    if let Some(pass) = update.wifi_pass {
        runtime.network.wifi_pass = pass;
    }
    if let Some(hostname) = update.hostname {
        runtime.network.hostname = hostname;
    }
    if let Some(pass) = update.ota_password {
        runtime.network.ota_password = pass;
    }
    runtime.network.use_static_ip = update.use_static_ip;
    runtime.network.static_ip = update.static_ip;
    runtime.network.gateway = update.gateway;
    runtime.network.subnet = update.subnet;
    runtime.network.dns = update.dns;
    if let Some(host) = update.collector_host {
        runtime.node.collector_host = host.trim().to_string();
    }
    if let Some(port) = update.collector_port {
        runtime.node.collector_port = port;
    }
    runtime.sanitize();

    NetworkUpdateResponse {
        restart_required: network_restart_required(&previous, runtime),
        network: build_network_config_view(runtime),
    }
}

pub fn network_restart_required(previous: &RuntimeConfig, current: &RuntimeConfig) -> bool {
    let (prev, cur) = (&previous.network, &current.network);
    prev.wifi_ssid != cur.wifi_ssid
        || prev.wifi_pass != cur.wifi_pass
        || prev.hostname != cur.hostname
        || prev.use_static_ip != cur.use_static_ip
        || prev.static_ip != cur.static_ip
        || prev.gateway != cur.gateway
        || prev.subnet != cur.subnet
        || prev.dns != cur.dns
        || previous.node.collector_host != current.node.collector_host
        || previous.node.collector_port != current.node.collector_port
}
