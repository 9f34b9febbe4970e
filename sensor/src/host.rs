use std::{
    collections::HashMap,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicI32, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::{FromRef, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tokio::{net::TcpListener, sync::Mutex};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use sensornet_common::{
    host_http::{handle_static_file, node_routes, request_params, NodeWeb, RuntimeStore},
    identity::{FilePreferences, PREFS_NAMESPACE},
    web::{self, ApiResponse, LocalSensorData},
    ClientIdentity, FlashStore, Indicator, ReportForm, ReportScheduler, RuntimeConfig, SignalKind,
};

const DEFAULT_ASSETS: &[(&str, &str)] = &[("/index.html", include_str!("../data/index.html"))];
const SIMULATED_PHASE_TICKS: u64 = 50;
const REPORT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
struct AppState {
    node: NodeWeb,
    identity: Arc<Mutex<ClientIdentity<FilePreferences>>>,
    latest: Arc<AtomicI32>,
    collector: Arc<String>,
}

impl FromRef<AppState> for NodeWeb {
    fn from_ref(state: &AppState) -> Self {
        state.node.clone()
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let data_dir = std::env::var("SENSORNET_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("sensor-data"));
    let runtime = RuntimeStore::new(data_dir.join("runtime.json"))
        .load()
        .await
        .unwrap_or_else(|err| {
            warn!("failed to load runtime config from store: {err}");
            RuntimeConfig::default()
        });
    let collector_url =
        std::env::var("COLLECTOR_URL").unwrap_or_else(|_| runtime.node.collector_url());

    let state = build_state(&data_dir, &collector_url).await?;

    if let Some(id) = std::env::var("CLIENT_ID")
        .ok()
        .and_then(|value| value.trim().parse::<i32>().ok())
    {
        let stored = state.identity.lock().await.set(id)?;
        info!("client ID overridden from environment: {stored}");
    }

    let client = report_client(REPORT_TIMEOUT).context("failed to build report client")?;
    tokio::spawn(report_loop(
        state.clone(),
        client,
        format!("{}{}", collector_url.trim_end_matches('/'), web::ROUTE_SENSOR),
        runtime.node.signal,
        runtime.node.sample_interval_ms,
        runtime.node.heartbeat_interval_ms,
    ));

    let port = std::env::var("SENSOR_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8081);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind sensor server at {addr}"))?;

    info!("sensor listening on http://{addr}, reporting to {collector_url}");
    axum::serve(listener, build_router(state)).await?;
    Ok(())
}

async fn build_state(data_dir: &Path, collector_url: &str) -> anyhow::Result<AppState> {
    let flash = FlashStore::new(data_dir.join("spiffs"));
    flash.mount().context("failed to mount flash storage")?;
    if let Err(err) = flash.seed_missing(DEFAULT_ASSETS) {
        warn!("failed to seed default web assets: {err}");
    }
    flash.log_inventory();

    let runtime_store = RuntimeStore::new(data_dir.join("runtime.json"));
    let runtime = runtime_store.load().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err}");
        RuntimeConfig::default()
    });

    let mut identity = ClientIdentity::new(FilePreferences::new(
        &data_dir.join("nvs"),
        PREFS_NAMESPACE,
    ));
    let client_id = identity
        .begin()
        .context("failed to load client identity")?;
    info!("client ID: {client_id}");

    let node = NodeWeb::new(flash, runtime_store, data_dir, runtime.led.brightness);
    node.set_led(Indicator::Connected);

    Ok(AppState {
        node,
        identity: Arc::new(Mutex::new(identity)),
        latest: Arc::new(AtomicI32::new(0)),
        collector: Arc::new(collector_authority(collector_url)),
    })
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route(web::ROUTE_LOCAL_SENSOR_DATA, get(handle_get_local_sensor_data))
        .route(web::ROUTE_SET_CLIENT_ID, post(handle_set_client_id))
        .merge(node_routes::<AppState>())
        .fallback(handle_static_file)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// `host:port` part of the collector base URL.
fn collector_authority(url: &str) -> String {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    rest.split('/').next().unwrap_or_default().to_string()
}

/// Stand-in for the signal pin on the host: alternates between the active
/// and idle level every few seconds.
fn simulated_raw(signal: SignalKind, tick: u64) -> u32 {
    let active = (tick / SIMULATED_PHASE_TICKS) % 2 == 1;
    match signal {
        SignalKind::Touch {
            threshold,
            rises_on_touch,
        } => {
            let high = threshold.saturating_add(threshold / 2);
            let low = threshold / 2;
            if active == rises_on_touch {
                high
            } else {
                low
            }
        }
        SignalKind::Digital { active_low } => u32::from(active != active_low),
        SignalKind::Analog => ((tick * 41) % 4096) as u32,
    }
}

async fn report_loop(
    state: AppState,
    client: reqwest::Client,
    sensor_url: String,
    signal: SignalKind,
    sample_interval_ms: u64,
    heartbeat_interval_ms: u64,
) {
    let started = Instant::now();
    let mut scheduler = ReportScheduler::new(heartbeat_interval_ms);
    let mut interval = tokio::time::interval(Duration::from_millis(sample_interval_ms));
    let mut tick: u64 = 0;

    info!(
        "sampling {} signal every {sample_interval_ms} ms",
        signal.as_str()
    );

    loop {
        interval.tick().await;
        tick = tick.saturating_add(1);

        let value = signal.normalize(simulated_raw(signal, tick));
        if state.latest.swap(value, Ordering::Relaxed) != value {
            state.node.set_led(Indicator::Sensor(value));
        }

        let now_ms = started.elapsed().as_millis() as u64;
        if !scheduler.should_report(value, now_ms) {
            continue;
        }

        let form = ReportForm {
            client_id: state.identity.lock().await.get(),
            value,
        };
        send_report(&client, &sensor_url, &form).await;
        scheduler.mark_reported(value, now_ms);
    }
}

/// HTTP client for reports. The timeout bounds a collector that accepts the
/// connection but never answers.
fn report_client(timeout: Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(timeout)
        .timeout(timeout)
        .build()
}

/// Posts one reading to the collector. Failures are logged; the next
/// scheduled report is the retry.
async fn send_report(client: &reqwest::Client, url: &str, form: &ReportForm) -> bool {
    let result = client
        .post(url)
        .header(
            reqwest::header::CONTENT_TYPE,
            "application/x-www-form-urlencoded",
        )
        .body(form.encode())
        .send()
        .await;

    match result {
        Ok(response) if response.status().is_success() => {
            debug!("reported value {} as client {}", form.value, form.client_id);
            true
        }
        Ok(response) => {
            warn!("collector rejected report: HTTP {}", response.status());
            false
        }
        Err(err) => {
            warn!("failed to send report to {url}: {err}");
            false
        }
    }
}

async fn handle_get_local_sensor_data(State(state): State<AppState>) -> impl IntoResponse {
    Json(LocalSensorData {
        client_id: state.identity.lock().await.get(),
        value: state.latest.load(Ordering::Relaxed),
        collector: state.collector.as_ref().clone(),
    })
}

async fn handle_set_client_id(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    body: String,
) -> Response {
    let params = request_params(query, &body);
    let id = match web::parse_client_id_param(&params) {
        Ok(id) => id,
        Err(message) => {
            return (StatusCode::BAD_REQUEST, Json(ApiResponse::error(message))).into_response();
        }
    };

    match state.identity.lock().await.set(id) {
        Ok(stored) => {
            info!("client ID set to {stored}");
            Json(ApiResponse::ok(
                format!("Client ID set to {stored}"),
                Some(serde_json::json!({ "clientId": stored.get() })),
            ))
            .into_response()
        }
        Err(err) => {
            warn!("failed to persist client ID: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::error("Failed to save client ID")),
            )
                .into_response()
        }
    }
}
