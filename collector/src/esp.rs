use std::{
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use anyhow::Context;
use embedded_svc::{http::Method, io::Write};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{gpio::AnyOutputPin, prelude::Peripherals},
    log::EspLogger,
    nvs::EspDefaultNvsPartition,
};
use log::{debug, info, warn};

use sensornet_common::{
    esp_node::{
        self, add_current_task_to_watchdog, connect_wifi, disable_wifi_power_save,
        ensure_wifi_defaults, feed_watchdog, init_status_led, init_watchdog, maintain_link,
        mark_running_slot_valid, monotonic_ms, remote_ip, request_params, start_http_server,
        write_text, EspNodeWeb, NvsStore, WifiStartup, WATCHDOG_TIMEOUT_SEC,
    },
    link::{DisconnectWatch, ReconnectPolicy},
    ota::OtaTracker,
    readings::parse_report,
    web, FlashStore, Indicator, RuntimeConfig, SensorRegistry,
};

const LOOP_INTERVAL_MS: u64 = 100;
const DEFAULT_ASSETS: &[(&str, &str)] = &[("/index.html", include_str!("../data/index.html"))];

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();
    info!("SensorNet collector starting");

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore::new(nvs_partition.clone());

    let mut runtime = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    ensure_wifi_defaults(&mut runtime);

    info!(
        "NVS config loaded: ssid=`{}`, static_ip={}, hostname=`{}`",
        runtime.network.wifi_ssid, runtime.network.use_static_ip, runtime.network.hostname,
    );

    let Peripherals { modem, rmt, .. } = Peripherals::take()?;
    let led = init_status_led(
        rmt.channel0,
        unsafe { AnyOutputPin::new(runtime.led.pin) },
        runtime.led.brightness,
    );
    info!("NeoPixel initialized on GPIO{}", runtime.led.pin);

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
    let registry = Arc::new(Mutex::new(SensorRegistry::new()));

    let server = start_http_server(&node, runtime.network.http_port, |server| {
        {
            let registry = registry.clone();
            let led = led.clone();
            server.fn_handler::<anyhow::Error, _>(web::ROUTE_SENSOR, Method::Post, move |mut req| {
                let sender = remote_ip(&mut req)
                    .map(|ip| ip.to_string())
                    .unwrap_or_default();
                let params = request_params(&mut req)?;
                let report = parse_report(&params);

                debug!(
                    "sensor update from {sender}: clientId={}, value={}",
                    report.client_id, report.value
                );
                if let Ok(mut registry) = registry.lock() {
                    registry.update(&sender, &report.client_id, report.value);
                }
                esp_node::indicate(&led, Indicator::Sensor(report.value));
                write_text(req, 200, "OK")
            })?;
        }

        {
            let registry = registry.clone();
            server.fn_handler::<anyhow::Error, _>(
                web::ROUTE_SENSOR_DATA,
                Method::Get,
                move |req| {
                    let json = registry
                        .lock()
                        .map(|registry| registry.to_json())
                        .unwrap_or_else(|_| "{}".to_string());
                    req.into_response(200, Some("OK"), &[("Content-Type", web::CONTENT_TYPE_JSON)])?
                        .write_all(json.as_bytes())?;
                    Ok(())
                },
            )?;
        }
        Ok(())
    })?;

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    add_current_task_to_watchdog()?;

    let mut reconnect = ReconnectPolicy::default();
    let mut disconnect_watch = DisconnectWatch::default();

    // Keep services alive for the program lifetime.
    let _server = server;
    loop {
        feed_watchdog();
        if !provisioning {
            maintain_link(
                &mut wifi,
                &mut reconnect,
                &mut disconnect_watch,
                &led,
                monotonic_ms(),
            );
        }
        thread::sleep(Duration::from_millis(LOOP_INTERVAL_MS));
    }
}
