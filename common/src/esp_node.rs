//! ESP-IDF plumbing shared by the collector and sensor firmware: NVS, the
//! SPIFFS mount, WiFi bring-up and supervision, the WS2812 status pixel and
//! the HTTP routes every node serves.

use core::convert::TryInto;
use std::{
    collections::HashMap,
    net::Ipv4Addr,
    sync::{Arc, Mutex, OnceLock},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{Headers, Method},
    io::{Read, Write},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    gpio::OutputPin,
    peripheral::Peripheral,
    rmt::{
        config::TransmitConfig, PinState, Pulse, PulseTicks, RmtChannel, TxRmtDriver,
        VariableLengthSignal,
    },
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::modem::Modem,
    http::server::{Configuration as HttpConfiguration, EspHttpConnection, EspHttpServer, Request},
    ipv4::{
        ClientConfiguration as IpClientConfiguration, ClientSettings as IpClientSettings,
        Configuration as IpConfiguration, Mask, Subnet,
    },
    netif::{EspNetif, NetifConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    ota::{EspOta, EspOtaUpdate},
    sys,
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use serde::Serialize;

use crate::{
    config::{
        apply_network_update, build_network_config_view, validate_network_update,
        NetworkConfig, NetworkConfigUpdate, RuntimeConfig,
    },
    identity::PreferenceStore,
    led::{parse_color, Indicator, PixelDriver, Rgb, StatusLed},
    link::{
        DisconnectWatch, LinkAction, LinkHealth, ReconnectPolicy, BOOT_CONNECT_ATTEMPTS,
        BOOT_RETRY_DELAY_MS,
    },
    multipart::{boundary_from_content_type, MultipartUpload},
    ota::{
        apply_stored_firmware, check_ota_password, FirmwareImage, FirmwareSink, FirmwareWriter,
        OtaError, OtaTracker,
    },
    params::{parse_params, uri_query_params},
    storage::{content_type, FlashStore, StorageError},
    upload::{FileUploadSink, UploadError, UploadSink},
    web,
};

pub const NVS_NAMESPACE: &str = "sensornet";
const NVS_RUNTIME_KEY: &str = "runtime_json";
pub const SPIFFS_BASE_PATH: &str = "/spiffs";
const SPIFFS_MAX_FILES: usize = 5;
pub const MAX_HTTP_BODY: usize = 4096;
const UPLOAD_CHUNK_SIZE: usize = 1024;
const FILE_CHUNK_SIZE: usize = 1024;
const MAX_URI_HANDLERS: usize = 24;
const PROVISIONING_AP_SSID: &str = "SensorNet-Setup";
const PROVISIONING_AP_PASSWORD: &str = "SensorNetSetup";
pub const WATCHDOG_TIMEOUT_SEC: u32 = 30;
pub const RESTART_DELAY_MS: u64 = 1_000;

// WS2812 bit timings at a 25 ns tick (80 MHz APB / 2).
const WS2812_CLOCK_DIVIDER: u8 = 2;
const WS2812_T0H: u16 = 14;
const WS2812_T0L: u16 = 32;
const WS2812_T1H: u16 = 28;
const WS2812_T1L: u16 = 24;

pub type HttpRequest<'r, 'c> = Request<&'r mut EspHttpConnection<'c>>;
pub type SharedLed = Arc<Mutex<StatusLed<Ws2812Pixel>>>;

pub enum WifiStartup {
    Connected(EspWifi<'static>),
    Provisioning(EspWifi<'static>),
}

#[derive(Clone)]
pub struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

impl NvsStore {
    pub fn new(partition: EspDefaultNvsPartition) -> Self {
        Self {
            partition,
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn partition(&self) -> EspDefaultNvsPartition {
        self.partition.clone()
    }

    pub fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().map_err(|_| anyhow!("nvs lock poisoned"))?;
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 4096];

        let mut runtime = match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => serde_json::from_str::<RuntimeConfig>(value)?,
            None => RuntimeConfig::default(),
        };
        runtime.sanitize();
        Ok(runtime)
    }

    pub fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().map_err(|_| anyhow!("nvs lock poisoned"))?;
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let payload = serde_json::to_string(runtime)?;
        nvs.set_str(NVS_RUNTIME_KEY, &payload)?;
        Ok(())
    }
}

/// Preferences namespace backed by NVS.
pub struct NvsPreferences {
    nvs: EspNvs<NvsDefault>,
}

impl NvsPreferences {
    pub fn new(partition: EspDefaultNvsPartition, namespace: &str) -> anyhow::Result<Self> {
        let nvs = EspNvs::new(partition, namespace, true)
            .with_context(|| format!("failed to open NVS namespace `{namespace}`"))?;
        Ok(Self { nvs })
    }
}

impl PreferenceStore for NvsPreferences {
    fn get_i32(&mut self, key: &str) -> Result<Option<i32>, StorageError> {
        self.nvs
            .get_i32(key)
            .map_err(|err| StorageError::Backend(err.to_string()))
    }

    fn set_i32(&mut self, key: &str, value: i32) -> Result<(), StorageError> {
        self.nvs
            .set_i32(key, value)
            .map_err(|err| StorageError::Backend(err.to_string()))
    }
}

/// Registers the SPIFFS partition at [`SPIFFS_BASE_PATH`], formatting it when
/// the first mount fails.
pub fn mount_spiffs() -> anyhow::Result<FlashStore> {
    let conf = sys::esp_vfs_spiffs_conf_t {
        base_path: c"/spiffs".as_ptr(),
        partition_label: core::ptr::null(),
        max_files: SPIFFS_MAX_FILES,
        format_if_mount_failed: true,
    };
    let rc = unsafe { sys::esp_vfs_spiffs_register(&conf) };
    if rc != sys::ESP_OK {
        return Err(anyhow!("SPIFFS mount failed with code {rc}"));
    }

    let mut total = 0;
    let mut used = 0;
    if unsafe { sys::esp_spiffs_info(core::ptr::null(), &mut total, &mut used) } == sys::ESP_OK {
        info!("SPIFFS mounted successfully ({used}/{total} bytes used)");
    }
    Ok(FlashStore::new(SPIFFS_BASE_PATH))
}

/// Single WS2812 pixel clocked out over an RMT channel.
pub struct Ws2812Pixel {
    tx: Option<TxRmtDriver<'static>>,
}

impl Ws2812Pixel {
    pub fn new<C, P>(
        channel: impl Peripheral<P = C> + 'static,
        pin: impl Peripheral<P = P> + 'static,
    ) -> anyhow::Result<Self>
    where
        C: RmtChannel,
        P: OutputPin,
    {
        let config = TransmitConfig::new()
            .clock_divider(WS2812_CLOCK_DIVIDER)
            .idle(Some(PinState::Low));
        let tx =
            TxRmtDriver::new(channel, pin, &config).context("failed to init RMT pixel driver")?;
        Ok(Self { tx: Some(tx) })
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }
}

impl PixelDriver for Ws2812Pixel {
    type Error = anyhow::Error;

    fn show(&mut self, colour: Rgb) -> anyhow::Result<()> {
        let Some(tx) = self.tx.as_mut() else {
            return Ok(());
        };

        let mut pulses = Vec::with_capacity(48);
        for byte in colour.grb() {
            for bit in (0..8).rev() {
                let (high, low) = if byte & (1 << bit) != 0 {
                    (WS2812_T1H, WS2812_T1L)
                } else {
                    (WS2812_T0H, WS2812_T0L)
                };
                pulses.push(Pulse::new(PinState::High, PulseTicks::new(high)?));
                pulses.push(Pulse::new(PinState::Low, PulseTicks::new(low)?));
            }
        }

        let pulse_refs: Vec<&Pulse> = pulses.iter().collect();
        let mut signal = VariableLengthSignal::with_capacity(pulses.len());
        signal
            .push(pulse_refs)
            .context("failed to encode pixel colour")?;
        tx.start_blocking(&signal)
            .context("failed to transmit pixel colour")?;
        Ok(())
    }
}

pub fn init_status_led<C, P>(
    channel: impl Peripheral<P = C> + 'static,
    pin: impl Peripheral<P = P> + 'static,
    brightness: u8,
) -> SharedLed
where
    C: RmtChannel,
    P: OutputPin,
{
    let pixel = Ws2812Pixel::new(channel, pin).unwrap_or_else(|err| {
        warn!("status LED unavailable, running without it: {err:#}");
        Ws2812Pixel::disabled()
    });
    let mut led = StatusLed::with_brightness(pixel, brightness);
    if let Err(err) = led.set_colour(Rgb::OFF) {
        warn!("failed to clear status LED: {err:#}");
    }
    Arc::new(Mutex::new(led))
}

pub fn indicate(led: &SharedLed, indicator: Indicator) {
    let Ok(mut led) = led.lock() else {
        return;
    };
    if let Err(err) = led.indicate(indicator) {
        warn!("failed to drive status LED: {err:#}");
    }
}

/// State shared by the common node routes.
#[derive(Clone)]
pub struct EspNodeWeb {
    pub flash: FlashStore,
    pub ota: OtaTracker,
    pub nvs: NvsStore,
    pub led: SharedLed,
}

pub fn ensure_wifi_defaults(runtime: &mut RuntimeConfig) {
    if runtime.network.wifi_ssid.is_empty() {
        if let Some(ssid) = option_env!("WIFI_SSID") {
            runtime.network.wifi_ssid = ssid.to_string();
        }
    }

    if runtime.network.wifi_pass.is_empty() {
        if let Some(pass) = option_env!("WIFI_PASS") {
            runtime.network.wifi_pass = pass.to_string();
        }
    }
}

pub fn has_station_credentials(network: &NetworkConfig) -> bool {
    let ssid = network.wifi_ssid.trim();
    !ssid.is_empty() && ssid != "CHANGE_ME"
}

fn ipv4_from_octets(ip: [u8; 4]) -> Ipv4Addr {
    Ipv4Addr::from(ip)
}

fn build_sta_netif(network: &NetworkConfig) -> anyhow::Result<Option<EspNetif>> {
    if !network.use_static_ip {
        return Ok(None);
    }

    let (Some(static_ip), Some(gateway), Some(subnet)) =
        (network.static_ip, network.gateway, network.subnet)
    else {
        return Err(anyhow!(
            "staticIp, gateway and subnet are required when useStaticIp is true"
        ));
    };

    let mask_ip = ipv4_from_octets(subnet);
    let mask = Mask::try_from(mask_ip).map_err(|_| anyhow!("invalid subnet mask: {mask_ip}"))?;

    let conf = NetifConfiguration {
        ip_configuration: Some(IpConfiguration::Client(IpClientConfiguration::Fixed(
            IpClientSettings {
                ip: ipv4_from_octets(static_ip),
                subnet: Subnet {
                    gateway: ipv4_from_octets(gateway),
                    mask,
                },
                dns: network.dns.map(ipv4_from_octets),
                secondary_dns: None,
            },
        ))),
        ..NetifConfiguration::wifi_default_client()
    };

    Ok(Some(EspNetif::new_with_conf(&conf)?))
}

/// Joins the configured network, blinking the LED while attempts run. Falls
/// back to a provisioning access point when there are no credentials or every
/// attempt fails.
pub fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
    led: &SharedLed,
) -> anyhow::Result<WifiStartup> {
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;

    let static_ip_error = match build_sta_netif(network) {
        Ok(Some(sta_netif)) => {
            esp_wifi
                .swap_netif_sta(sta_netif)
                .context("failed to apply static IP netif configuration")?;
            None
        }
        Ok(None) => None,
        Err(err) => Some(err),
    };

    if let Err(err) = esp_wifi.sta_netif_mut().set_hostname(&network.hostname) {
        warn!("failed to set hostname `{}`: {err}", network.hostname);
    }

    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    if let Some(err) = static_ip_error {
        warn!("invalid static IP configuration ({err:#}); entering provisioning mode");
        start_provisioning_ap(&mut wifi)?;
        return Ok(WifiStartup::Provisioning(esp_wifi));
    }

    if !has_station_credentials(network) {
        warn!("wifi credentials missing; entering provisioning AP mode");
        start_provisioning_ap(&mut wifi)?;
        return Ok(WifiStartup::Provisioning(esp_wifi));
    }

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    let mut last_err = None;
    for attempt in 1..=BOOT_CONNECT_ATTEMPTS {
        indicate(led, Indicator::Connecting);
        match wifi.connect() {
            Ok(()) => match wifi.wait_netif_up() {
                Ok(()) => {
                    info!("wifi connected and netif up on attempt {attempt}");
                    last_err = None;
                    break;
                }
                Err(err) => {
                    warn!("wifi netif up failed on attempt {attempt}: {err:#}");
                    last_err = Some(err);
                }
            },
            Err(err) => {
                warn!("wifi connect failed on attempt {attempt}/{BOOT_CONNECT_ATTEMPTS}: {err:#}");
                last_err = Some(err);
            }
        }

        if attempt < BOOT_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(BOOT_RETRY_DELAY_MS));
        }
    }

    match last_err {
        None => {
            indicate(led, Indicator::Connected);
            if let Ok(ip_info) = wifi.wifi().sta_netif().get_ip_info() {
                info!("IP address: {}", ip_info.ip);
            }
            Ok(WifiStartup::Connected(esp_wifi))
        }
        Some(err) => {
            warn!("all {BOOT_CONNECT_ATTEMPTS} wifi connect attempts failed; last error: {err:#}");
            indicate(led, Indicator::Disconnected);
            let _ = wifi.disconnect();
            let _ = wifi.stop();
            start_provisioning_ap(&mut wifi)?;
            Ok(WifiStartup::Provisioning(esp_wifi))
        }
    }
}

fn start_provisioning_ap(wifi: &mut BlockingWifi<&mut EspWifi<'static>>) -> anyhow::Result<()> {
    wifi.set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
        ssid: PROVISIONING_AP_SSID
            .try_into()
            .map_err(|_| anyhow!("provisioning AP SSID too long"))?,
        password: PROVISIONING_AP_PASSWORD
            .try_into()
            .map_err(|_| anyhow!("provisioning AP password too long"))?,
        auth_method: AuthMethod::WPA2Personal,
        channel: 1,
        ..Default::default()
    }))?;
    wifi.start()?;
    wifi.wait_netif_up()?;
    info!(
        "provisioning AP started on `{}` (password: `{}`)",
        PROVISIONING_AP_SSID, PROVISIONING_AP_PASSWORD
    );
    Ok(())
}

/// Link supervision for the main loop: retries the station connection every
/// reconnect interval and restarts the device once the link has been down
/// past the grace period. Returns whether the station is connected.
pub fn maintain_link(
    wifi: &mut EspWifi<'static>,
    policy: &mut ReconnectPolicy,
    watch: &mut DisconnectWatch,
    led: &SharedLed,
    now_ms: u64,
) -> bool {
    let connected = is_wifi_station_connected();

    let health = watch.observe(connected, now_ms);
    if let Some(indicator) = health.indicator() {
        indicate(led, indicator);
    }
    match health {
        LinkHealth::RestartDue => {
            warn!("wifi disconnected for too long; restarting device");
            unsafe { sys::esp_restart() };
        }
        LinkHealth::Down { for_ms: 0 } => warn!("wifi connection lost"),
        LinkHealth::Down { .. } | LinkHealth::Up => {}
    }

    if policy.poll(connected, now_ms) == LinkAction::Reconnect {
        info!("attempting to reconnect to wifi");
        if let Err(err) = wifi.connect() {
            warn!("wifi reconnect request failed: {err}");
        }
    }

    connected
}

pub fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { sys::esp_task_wdt_init(&config) };
    if rc == sys::ESP_OK || rc == sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

pub fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == sys::ESP_OK || rc == sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

pub fn feed_watchdog() {
    let _ = unsafe { sys::esp_task_wdt_reset() };
}

pub fn disable_wifi_power_save() {
    let rc = unsafe { sys::esp_wifi_set_ps(0) };
    if rc == sys::ESP_OK {
        info!("wifi power save disabled");
    } else {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}

pub fn is_wifi_station_connected() -> bool {
    let mut ap_info = sys::wifi_ap_record_t::default();
    let rc = unsafe { sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    rc == sys::ESP_OK
}

pub fn mark_running_slot_valid() {
    if let Ok(mut ota) = EspOta::new() {
        if let Err(err) = ota.mark_running_slot_valid() {
            warn!("failed to mark running OTA slot valid: {err:?}");
        }
    }
}

pub fn schedule_restart(delay: Duration) {
    let spawned = thread::Builder::new()
        .name("restart-request".into())
        .spawn(move || {
            thread::sleep(delay);
            unsafe { sys::esp_restart() };
        });
    if let Err(err) = spawned {
        warn!("failed to spawn restart thread ({err}); restarting now");
        unsafe { sys::esp_restart() };
    }
}

pub fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

/// OTA partition writer.
pub struct EspFirmwareWriter<'a>(EspOtaUpdate<'a>);

impl FirmwareWriter for EspFirmwareWriter<'_> {
    fn write(&mut self, chunk: &[u8]) -> Result<(), String> {
        self.0
            .write_all(chunk)
            .map_err(|err| format!("failed writing OTA data: {err:?}"))
    }

    fn complete(self) -> Result<(), String> {
        self.0
            .complete()
            .map_err(|err| format!("failed finalizing OTA image: {err:?}"))
    }

    fn abort(self) {
        if let Err(err) = self.0.abort() {
            warn!("failed to abort OTA update: {err:?}");
        }
    }
}

fn ota_slot_label(running: bool) -> Option<String> {
    let ota = EspOta::new().ok()?;
    let slot = if running {
        ota.get_running_slot().ok()?
    } else {
        ota.get_update_slot().ok()?
    };
    Some(slot.label.as_str().to_string())
}

pub fn read_request_body(req: &mut HttpRequest<'_, '_>) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

pub fn query_params(req: &HttpRequest<'_, '_>) -> HashMap<String, String> {
    uri_query_params(req.uri())
}

/// Query parameters merged with a urlencoded body; body values win.
pub fn request_params(req: &mut HttpRequest<'_, '_>) -> anyhow::Result<HashMap<String, String>> {
    let mut params = query_params(req);
    let body = read_request_body(req)?;
    params.extend(parse_params(&String::from_utf8_lossy(&body)));
    Ok(params)
}

pub fn write_json<T: Serialize>(req: HttpRequest<'_, '_>, payload: &T) -> anyhow::Result<()> {
    write_json_status(req, 200, payload)
}

pub fn write_json_status<T: Serialize>(
    req: HttpRequest<'_, '_>,
    status_code: u16,
    payload: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(status_code, None, &[("Content-Type", web::CONTENT_TYPE_JSON)])?
        .write_all(&body)?;
    Ok(())
}

pub fn write_error(
    req: HttpRequest<'_, '_>,
    status_code: u16,
    message: &str,
) -> anyhow::Result<()> {
    let payload = serde_json::json!({ "error": message });
    write_json_status(req, status_code, &payload)
}

pub fn write_text(req: HttpRequest<'_, '_>, status_code: u16, body: &str) -> anyhow::Result<()> {
    req.into_response(status_code, None, &[("Content-Type", web::CONTENT_TYPE_TEXT)])?
        .write_all(body.as_bytes())?;
    Ok(())
}

pub fn write_html(req: HttpRequest<'_, '_>, body: &[u8]) -> anyhow::Result<()> {
    req.into_response(200, Some("OK"), &[("Content-Type", web::CONTENT_TYPE_HTML)])?
        .write_all(body)?;
    Ok(())
}

/// IPv4 address of the connected peer. IPv4-mapped IPv6 peers are unwrapped.
pub fn remote_ip(req: &mut HttpRequest<'_, '_>) -> Option<Ipv4Addr> {
    let raw = req.connection().raw_connection().ok()?;
    let fd = unsafe { sys::httpd_req_to_sockfd(raw.handle()) };
    if fd < 0 {
        return None;
    }

    let mut addr: sys::sockaddr_storage = unsafe { core::mem::zeroed() };
    let mut len = core::mem::size_of::<sys::sockaddr_storage>() as sys::socklen_t;
    let rc = unsafe {
        sys::lwip_getpeername(
            fd,
            (&mut addr as *mut sys::sockaddr_storage).cast::<sys::sockaddr>(),
            &mut len,
        )
    };
    if rc != 0 {
        return None;
    }

    match u32::from(addr.ss_family) {
        sys::AF_INET => {
            let v4 = unsafe { &*(&addr as *const sys::sockaddr_storage).cast::<sys::sockaddr_in>() };
            Some(Ipv4Addr::from(v4.sin_addr.s_addr.to_ne_bytes()))
        }
        sys::AF_INET6 => {
            let v6 =
                unsafe { &*(&addr as *const sys::sockaddr_storage).cast::<sys::sockaddr_in6>() };
            let octets = unsafe { v6.sin6_addr.un.u8_addr };
            Some(Ipv4Addr::new(octets[12], octets[13], octets[14], octets[15]))
        }
        _ => None,
    }
}

/// Streams the first file part of a multipart request body into `sink`.
fn stream_multipart<S: UploadSink>(
    req: &mut HttpRequest<'_, '_>,
    sink: S,
) -> Result<S::Output, UploadError> {
    let Some(boundary) = req
        .header("Content-Type")
        .and_then(boundary_from_content_type)
    else {
        return Err(UploadError::Multipart("missing multipart boundary"));
    };

    let mut upload = MultipartUpload::new(&boundary, sink);
    let mut chunk = [0_u8; UPLOAD_CHUNK_SIZE];
    loop {
        let read = match req.read(&mut chunk) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) => {
                warn!("upload body read failed: {err:?}");
                break;
            }
        };
        upload.feed(&chunk[..read])?;
    }
    upload.finish()
}

fn authorize_ota(nvs: &NvsStore, params: &HashMap<String, String>) -> Result<(), OtaError> {
    let runtime = nvs.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config for OTA check: {err:#}");
        RuntimeConfig::default()
    });
    check_ota_password(
        &runtime.network.ota_password,
        params.get("password").map(String::as_str),
    )
}

fn firmware_applied(req: HttpRequest<'_, '_>, image: &FirmwareImage, source: &str) -> anyhow::Result<()> {
    let message = format!(
        "Update complete from {source}: {} bytes, sha256 {}. Rebooting...",
        image.bytes, image.sha256
    );
    write_text(req, 200, &message)?;
    info!("firmware from {source} written; rebooting in {RESTART_DELAY_MS} ms");
    schedule_restart(Duration::from_millis(RESTART_DELAY_MS));
    Ok(())
}

fn serve_flash_file(req: HttpRequest<'_, '_>, flash: &FlashStore, path: &str) -> anyhow::Result<()> {
    let mut file = match flash.open(path) {
        Ok(file) => file,
        Err(StorageError::NotFound(_) | StorageError::InvalidName(_)) => {
            return write_text(req, 404, web::NOT_FOUND);
        }
        Err(err) => {
            warn!("failed to open {path}: {err}");
            return write_text(req, 500, "Failed to open file");
        }
    };

    let mut response = req.into_response(200, Some("OK"), &[("Content-Type", content_type(path))])?;
    let mut chunk = [0_u8; FILE_CHUNK_SIZE];
    loop {
        let read = std::io::Read::read(&mut file, &mut chunk)?;
        if read == 0 {
            break;
        }
        response.write_all(&chunk[..read])?;
    }
    Ok(())
}

/// Creates the HTTP server, lets the binary register its own routes, then
/// adds the shared node routes and the flash file fallback last so exact
/// routes take precedence over the wildcard.
pub fn start_http_server(
    node: &EspNodeWeb,
    http_port: u16,
    register: impl FnOnce(&mut EspHttpServer<'static>) -> anyhow::Result<()>,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        http_port,
        stack_size: 16 * 1024,
        max_uri_handlers: MAX_URI_HANDLERS,
        uri_match_wildcard: true,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;
    register(&mut server)?;
    register_node_routes(&mut server, node)?;
    info!("HTTP server started on port {http_port}");
    Ok(server)
}

fn register_node_routes(server: &mut EspHttpServer<'static>, node: &EspNodeWeb) -> anyhow::Result<()> {
    {
        let flash = node.flash.clone();
        server.fn_handler::<anyhow::Error, _>(web::ROUTE_ROOT, Method::Get, move |req| {
            match web::index_page(&flash) {
                Ok(body) => write_html(req, &body),
                Err(message) => write_text(req, 500, message),
            }
        })?;
    }

    {
        let flash = node.flash.clone();
        server.fn_handler::<anyhow::Error, _>(
            web::ROUTE_SENSOR_DATA_PAGE,
            Method::Get,
            move |req| write_html(req, &web::sensor_data_page(&flash)),
        )?;
    }

    {
        let led = node.led.clone();
        server.fn_handler::<anyhow::Error, _>(web::ROUTE_COLOR, Method::Get, move |req| {
            let colour = parse_color(&query_params(&req));
            indicate(&led, Indicator::Custom(colour));
            write_text(req, 200, "OK")
        })?;
    }

    {
        let flash = node.flash.clone();
        server.fn_handler::<anyhow::Error, _>(web::ROUTE_UPLOAD, Method::Get, move |req| {
            let files = flash.list().unwrap_or_else(|err| {
                warn!("failed to list flash storage: {err}");
                Vec::new()
            });
            write_html(req, web::render_file_manager(&files).as_bytes())
        })?;
    }

    {
        let flash = node.flash.clone();
        server.fn_handler::<anyhow::Error, _>(web::ROUTE_UPLOAD, Method::Post, move |mut req| {
            match stream_multipart(&mut req, FileUploadSink::new(flash.clone())) {
                Ok(stored) => {
                    info!("stored upload {} ({} bytes)", stored.path, stored.size);
                    write_text(req, 200, web::UPLOAD_COMPLETE)
                }
                Err(err) => {
                    warn!("upload failed: {err}");
                    write_text(req, web::upload_error_status(&err), &format!("ERROR: {err}"))
                }
            }
        })?;
    }

    {
        let flash = node.flash.clone();
        server.fn_handler::<anyhow::Error, _>(web::ROUTE_DELETE, Method::Post, move |mut req| {
            let params = request_params(&mut req)?;
            let (status, message) = web::delete_file(&flash, params.get("file").map(String::as_str));
            write_text(req, status, &message)
        })?;
    }

    {
        let flash = node.flash.clone();
        server.fn_handler::<anyhow::Error, _>(web::ROUTE_FILES, Method::Get, move |req| {
            match flash.list() {
                Ok(files) => write_json(req, &files),
                Err(err) => {
                    warn!("failed to list flash storage: {err}");
                    write_error(req, 500, "Failed to list files")
                }
            }
        })?;
    }

    {
        let flash = node.flash.clone();
        server.fn_handler::<anyhow::Error, _>(web::ROUTE_FIRMWARE, Method::Get, move |req| {
            let files = flash.list().unwrap_or_default();
            write_html(req, web::render_firmware_page(&files).as_bytes())
        })?;
    }

    {
        let node = node.clone();
        server.fn_handler::<anyhow::Error, _>(web::ROUTE_FIRMWARE, Method::Post, move |mut req| {
            let params = request_params(&mut req)?;
            if let Err(err) = authorize_ota(&node.nvs, &params) {
                return write_text(req, web::ota_error_status(&err), &err.to_string());
            }
            let Some(file) = params.get("file").filter(|name| !name.trim().is_empty()) else {
                return write_text(req, 400, "ERROR: No filename specified");
            };

            let mut ota = EspOta::new().map_err(|err| anyhow!("failed to acquire OTA: {err:?}"))?;
            let ota_ref = &mut ota;
            let sink = FirmwareSink::new(node.ota.clone(), None, move || {
                let ota = ota_ref;
                ota.initiate_update()
                    .map(EspFirmwareWriter)
                    .map_err(|err| format!("failed to initiate OTA update: {err:?}"))
            });

            match apply_stored_firmware(&node.flash, file, sink) {
                Ok(image) => firmware_applied(req, &image, file),
                Err(err) => {
                    warn!("stored firmware apply failed: {err}");
                    write_text(req, web::ota_error_status(&err), &format!("ERROR: {err}"))
                }
            }
        })?;
    }

    {
        let node = node.clone();
        server.fn_handler::<anyhow::Error, _>(web::ROUTE_UPDATE, Method::Post, move |mut req| {
            let params = query_params(&req);
            if let Err(err) = authorize_ota(&node.nvs, &params) {
                return write_text(req, web::ota_error_status(&err), &err.to_string());
            }

            let mut ota = EspOta::new().map_err(|err| anyhow!("failed to acquire OTA: {err:?}"))?;
            let ota_ref = &mut ota;
            let sink = FirmwareSink::new(node.ota.clone(), None, move || {
                let ota = ota_ref;
                ota.initiate_update()
                    .map(EspFirmwareWriter)
                    .map_err(|err| format!("failed to initiate OTA update: {err:?}"))
            });

            match stream_multipart(&mut req, sink) {
                Ok(image) => firmware_applied(req, &image, "upload"),
                Err(err) => {
                    warn!("firmware upload failed: {err}");
                    write_text(req, web::upload_error_status(&err), &format!("ERROR: {err}"))
                }
            }
        })?;
    }

    {
        let ota = node.ota.clone();
        server.fn_handler::<anyhow::Error, _>(web::ROUTE_OTA_STATUS, Method::Get, move |req| {
            let payload = ota.status_view(true, ota_slot_label(true), ota_slot_label(false));
            write_json(req, &payload)
        })?;
    }

    {
        let nvs = node.nvs.clone();
        server.fn_handler::<anyhow::Error, _>(web::ROUTE_NETWORK, Method::Get, move |req| {
            let runtime = nvs.load_runtime_config().unwrap_or_default();
            write_json(req, &build_network_config_view(&runtime))
        })?;
    }

    {
        let nvs = node.nvs.clone();
        server.fn_handler::<anyhow::Error, _>(web::ROUTE_NETWORK, Method::Put, move |mut req| {
            let body = read_request_body(&mut req)?;
            let update: NetworkConfigUpdate =
                serde_json::from_slice(&body).context("invalid network payload")?;

            if let Err(message) = validate_network_update(&update) {
                return write_error(req, 400, message);
            }

            let mut runtime = nvs.load_runtime_config().unwrap_or_else(|err| {
                warn!("failed to load existing runtime config for update: {err:#}");
                RuntimeConfig::default()
            });
            let payload = apply_network_update(&mut runtime, update);
            if let Err(err) = nvs.save_runtime_config(&runtime) {
                warn!("failed to persist network config update: {err:#}");
                return write_error(req, 500, "Failed to persist network settings");
            }
            write_json(req, &payload)
        })?;
    }

    server.fn_handler::<anyhow::Error, _>(web::ROUTE_RESTART, Method::Post, move |req| {
        schedule_restart(Duration::from_millis(RESTART_DELAY_MS));
        write_json(req, &serde_json::json!({ "restarting": true }))
    })?;

    {
        let flash = node.flash.clone();
        server.fn_handler::<anyhow::Error, _>("/*", Method::Get, move |req| {
            let uri = req.uri().to_string();
            match web::static_asset_path(&uri) {
                Some(path) => serve_flash_file(req, &flash, path),
                None => write_text(req, 404, web::NOT_FOUND),
            }
        })?;
    }

    Ok(())
}
