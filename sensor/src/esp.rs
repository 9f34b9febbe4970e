use std::{
    sync::{
        atomic::{AtomicI32, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{client::Client as HttpClient, Method, Status},
    io::Write,
};
use esp_idf_hal::gpio::{AnyIOPin, Input, PinDriver, Pull};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{gpio::AnyOutputPin, prelude::Peripherals},
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection},
    log::EspLogger,
    nvs::EspDefaultNvsPartition,
    sys,
};
use log::{debug, info, warn};

use sensornet_common::{
    esp_node::{
        self, add_current_task_to_watchdog, connect_wifi, disable_wifi_power_save,
        ensure_wifi_defaults, feed_watchdog, init_status_led, init_watchdog, maintain_link,
        mark_running_slot_valid, monotonic_ms, request_params, start_http_server, write_json,
        write_json_status, EspNodeWeb, NvsPreferences, NvsStore, WifiStartup,
        WATCHDOG_TIMEOUT_SEC,
    },
    identity::PREFS_NAMESPACE,
    link::{DisconnectWatch, ReconnectPolicy},
    ota::OtaTracker,
    web::{self, ApiResponse, LocalSensorData},
    ClientIdentity, FlashStore, Indicator, ReportForm, ReportScheduler, RuntimeConfig,
    SignalKind,
};

const DEFAULT_ASSETS: &[(&str, &str)] = &[("/index.html", include_str!("../data/index.html"))];
const REPORT_TIMEOUT: Duration = Duration::from_secs(5);

type SharedIdentity = Arc<Mutex<ClientIdentity<NvsPreferences>>>;

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();
    info!("SensorNet sensor starting");

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore::new(nvs_partition.clone());

    let mut runtime = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    ensure_wifi_defaults(&mut runtime);
    avoid_collector_address(&mut runtime);

    let mut identity = ClientIdentity::new(NvsPreferences::new(
        nvs_partition.clone(),
        PREFS_NAMESPACE,
    )?);
    let client_id = identity.begin().context("failed to load client identity")?;
    info!("client ID: {client_id}");
    let identity: SharedIdentity = Arc::new(Mutex::new(identity));

    let Peripherals { modem, rmt, .. } = Peripherals::take()?;
    let led = init_status_led(
        rmt.channel0,
        unsafe { AnyOutputPin::new(runtime.led.pin) },
        runtime.led.brightness,
    );

    let mut signal = SignalReader::new(runtime.node.signal, runtime.node.signal_pin)
        .with_context(|| format!("failed to set up signal on GPIO{}", runtime.node.signal_pin))?;
    info!(
        "{} signal on GPIO{}",
        runtime.node.signal.as_str(),
        runtime.node.signal_pin
    );

    let flash = match esp_node::mount_spiffs() {
        Ok(flash) => flash,
        Err(err) => {
            warn!("{err:#}; serving without flash storage");
            FlashStore::new(esp_node::SPIFFS_BASE_PATH)
        }
    };
    if let Err(err) = flash.seed_missing(DEFAULT_ASSETS) {
        warn!("failed to seed default web assets: {err}");
    }
    flash.log_inventory();

    let (mut wifi, provisioning) = match connect_wifi(
        modem,
        sys_loop,
        nvs_partition,
        &runtime.network,
        &led,
    )
    .context("wifi startup failed")?
    {
        WifiStartup::Connected(wifi) => (wifi, false),
        WifiStartup::Provisioning(wifi) => {
            warn!("wifi station connection unavailable; serving setup over the provisioning AP");
            (wifi, true)
        }
    };
    disable_wifi_power_save();
    mark_running_slot_valid();

    let node = EspNodeWeb {
        flash,
        ota: OtaTracker::new(),
        nvs: nvs_store,
        led: led.clone(),
    };
    let latest = Arc::new(AtomicI32::new(0));
    let collector_url = runtime.node.collector_url();
    let collector = format!(
        "{}:{}",
        runtime.node.collector_host, runtime.node.collector_port
    );

    let server = start_http_server(&node, runtime.network.http_port, |server| {
        {
            let identity = identity.clone();
            let latest = latest.clone();
            server.fn_handler::<anyhow::Error, _>(
                web::ROUTE_LOCAL_SENSOR_DATA,
                Method::Get,
                move |req| {
                    let client_id = identity
                        .lock()
                        .map_err(|_| anyhow!("client identity lock poisoned"))?
                        .get();
                    write_json(
                        req,
                        &LocalSensorData {
                            client_id,
                            value: latest.load(Ordering::Relaxed),
                            collector: collector.clone(),
                        },
                    )
                },
            )?;
        }

        {
            let identity = identity.clone();
            server.fn_handler::<anyhow::Error, _>(
                web::ROUTE_SET_CLIENT_ID,
                Method::Post,
                move |mut req| {
                    let params = request_params(&mut req)?;
                    let id = match web::parse_client_id_param(&params) {
                        Ok(id) => id,
                        Err(message) => {
                            return write_json_status(req, 400, &ApiResponse::error(message));
                        }
                    };

                    let stored = identity
                        .lock()
                        .map_err(|_| anyhow!("client identity lock poisoned"))?
                        .set(id);
                    match stored {
                        Ok(stored) => {
                            info!("client ID set to {stored}");
                            write_json(
                                req,
                                &ApiResponse::ok(
                                    format!("Client ID set to {stored}"),
                                    Some(serde_json::json!({ "clientId": stored.get() })),
                                ),
                            )
                        }
                        Err(err) => {
                            warn!("failed to persist client ID: {err}");
                            write_json_status(
                                req,
                                500,
                                &ApiResponse::error("Failed to save client ID"),
                            )
                        }
                    }
                },
            )?;
        }
        Ok(())
    })?;

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    add_current_task_to_watchdog()?;

    let mut reconnect = ReconnectPolicy::default();
    let mut disconnect_watch = DisconnectWatch::default();
    let mut scheduler = ReportScheduler::new(runtime.node.heartbeat_interval_ms);
    let sensor_url = format!("{collector_url}{}", web::ROUTE_SENSOR);
    let sample_interval = Duration::from_millis(runtime.node.sample_interval_ms);

    info!("reporting to {sensor_url}");

    // Keep services alive for the program lifetime.
    let _server = server;
    let mut was_online = false;
    loop {
        feed_watchdog();
        let now_ms = monotonic_ms();
        let online = !provisioning
            && maintain_link(
                &mut wifi,
                &mut reconnect,
                &mut disconnect_watch,
                &led,
                now_ms,
            );

        let value = runtime.node.signal.normalize(signal.sample());
        // Restore the reading colour once the link stops blinking.
        let recovered = online && !was_online;
        was_online = online;
        if latest.swap(value, Ordering::Relaxed) != value || recovered {
            esp_node::indicate(&led, Indicator::Sensor(value));
        }

        if online && scheduler.should_report(value, now_ms) {
            let client_id = identity.lock().map(|identity| identity.get()).unwrap_or_default();
            let form = ReportForm { client_id, value };
            if let Err(err) = post_report(&sensor_url, &form) {
                warn!("failed to send report to {sensor_url}: {err:#}");
            }
            scheduler.mark_reported(value, now_ms);
        }

        thread::sleep(sample_interval);
    }
}

/// The collector owns the default static address, so a sensor left on the
/// factory network settings falls back to DHCP.
fn avoid_collector_address(runtime: &mut RuntimeConfig) {
    let collector = runtime.node.collector_host.parse::<std::net::Ipv4Addr>().ok();
    let own = runtime.network.static_ip.map(std::net::Ipv4Addr::from);
    if runtime.network.use_static_ip && own.is_some() && own == collector {
        warn!("static IP matches the collector address; using DHCP");
        runtime.network.use_static_ip = false;
    }
}

fn post_report(url: &str, form: &ReportForm) -> anyhow::Result<()> {
    let http_conf = HttpClientConfiguration {
        timeout: Some(REPORT_TIMEOUT),
        ..Default::default()
    };
    let mut client = HttpClient::wrap(EspHttpConnection::new(&http_conf)?);

    let body = form.encode();
    let content_length = body.len().to_string();
    let headers = [
        ("Content-Type", "application/x-www-form-urlencoded"),
        ("Content-Length", content_length.as_str()),
    ];

    let mut request = client.post(url, &headers)?;
    request.write_all(body.as_bytes())?;
    request.flush()?;
    let response = request.submit().map_err(|e| anyhow!("{e:?}"))?;

    let status = response.status();
    if !(200..300).contains(&status) {
        return Err(anyhow!("collector answered HTTP {status}"));
    }
    debug!("reported value {} as client {}", form.value, form.client_id);
    Ok(())
}

/// Raw sampling for the configured signal kind.
enum SignalReader {
    Touch(sys::touch_pad_t),
    Digital(PinDriver<'static, AnyIOPin, Input>),
    Analog {
        unit: sys::adc_oneshot_unit_handle_t,
        channel: sys::adc_channel_t,
    },
}

impl SignalReader {
    fn new(kind: SignalKind, pin: i32) -> anyhow::Result<Self> {
        match kind {
            SignalKind::Touch { .. } => init_touch(pin),
            SignalKind::Digital { active_low } => {
                let mut driver = PinDriver::input(unsafe { AnyIOPin::new(pin) })?;
                driver.set_pull(if active_low { Pull::Up } else { Pull::Down })?;
                Ok(Self::Digital(driver))
            }
            SignalKind::Analog => init_adc(pin),
        }
    }

    fn sample(&mut self) -> u32 {
        match self {
            Self::Touch(pad) => {
                let mut raw: u32 = 0;
                let rc = unsafe { sys::touch_pad_read_raw_data(*pad, &mut raw) };
                if rc != sys::ESP_OK {
                    debug!("touch read failed: esp_err_t={rc}");
                }
                raw
            }
            Self::Digital(driver) => u32::from(driver.is_high()),
            Self::Analog { unit, channel } => {
                let mut raw: i32 = 0;
                let rc = unsafe { sys::adc_oneshot_read(*unit, *channel, &mut raw) };
                if rc != sys::ESP_OK {
                    debug!("adc read failed: esp_err_t={rc}");
                    return 0;
                }
                raw.max(0) as u32
            }
        }
    }
}

// ESP32-S3 routes GPIO1..=14 to touch channels of the same number.
fn init_touch(pin: i32) -> anyhow::Result<SignalReader> {
    if !(1..=14).contains(&pin) {
        return Err(anyhow!("GPIO{pin} has no touch channel"));
    }
    let pad = pin as sys::touch_pad_t;

    let rc = unsafe { sys::touch_pad_init() };
    if rc != sys::ESP_OK {
        return Err(anyhow!("touch_pad_init failed with code {rc}"));
    }
    let rc = unsafe { sys::touch_pad_config(pad) };
    if rc != sys::ESP_OK {
        return Err(anyhow!("touch_pad_config failed with code {rc}"));
    }
    let rc = unsafe { sys::touch_pad_set_fsm_mode(sys::touch_fsm_mode_t_TOUCH_FSM_MODE_TIMER) };
    if rc != sys::ESP_OK {
        return Err(anyhow!("touch_pad_set_fsm_mode failed with code {rc}"));
    }
    let rc = unsafe { sys::touch_pad_fsm_start() };
    if rc != sys::ESP_OK {
        return Err(anyhow!("touch_pad_fsm_start failed with code {rc}"));
    }
    Ok(SignalReader::Touch(pad))
}

// ESP32-S3 ADC1 covers GPIO1..=10 as channels 0..=9.
fn init_adc(pin: i32) -> anyhow::Result<SignalReader> {
    if !(1..=10).contains(&pin) {
        return Err(anyhow!("GPIO{pin} is not an ADC1 input"));
    }
    let channel = (pin - 1) as sys::adc_channel_t;

    let init_cfg = sys::adc_oneshot_unit_init_cfg_t {
        unit_id: sys::adc_unit_t_ADC_UNIT_1,
        ulp_mode: sys::adc_ulp_mode_t_ADC_ULP_MODE_DISABLE,
        ..Default::default()
    };
    let mut unit: sys::adc_oneshot_unit_handle_t = core::ptr::null_mut();
    let rc = unsafe { sys::adc_oneshot_new_unit(&init_cfg, &mut unit) };
    if rc != sys::ESP_OK {
        return Err(anyhow!("adc_oneshot_new_unit failed with code {rc}"));
    }

    let chan_cfg = sys::adc_oneshot_chan_cfg_t {
        atten: sys::adc_atten_t_ADC_ATTEN_DB_12,
        bitwidth: sys::adc_bitwidth_t_ADC_BITWIDTH_12,
    };
    let rc = unsafe { sys::adc_oneshot_config_channel(unit, channel, &chan_cfg) };
    if rc != sys::ESP_OK {
        return Err(anyhow!("adc_oneshot_config_channel failed with code {rc}"));
    }
    Ok(SignalReader::Analog { unit, channel })
}
