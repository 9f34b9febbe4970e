//! axum handlers for the routes every node serves in host builds. Binaries
//! merge [`node_routes`] into their own router and expose [`NodeWeb`] through
//! `FromRef`.

use std::{
    collections::HashMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Arc, Mutex as StdMutex},
};

use axum::{
    body::{Body, Bytes},
    extract::{FromRef, Multipart, Query, State},
    http::{header, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};

use crate::{
    config::{
        apply_network_update, build_network_config_view, validate_network_update,
        NetworkConfigUpdate, RuntimeConfig,
    },
    led::{parse_color, Indicator, PixelDriver, Rgb, StatusLed},
    ota::{
        apply_stored_firmware, check_ota_password, FirmwareImage, FirmwareSink, OtaError,
        OtaTracker, StagedFirmwareWriter,
    },
    params::{parse_params, url_decode},
    storage::{content_type, FlashStore, StorageError},
    upload::{FileUploadSink, UploadError, UploadSession, UploadSink},
    web,
};

pub const STAGED_FIRMWARE_FILE: &str = "firmware.staged.bin";

/// Host stand-in for the NeoPixel: logs every colour change.
#[derive(Debug, Default)]
pub struct LogPixel;

impl PixelDriver for LogPixel {
    type Error = std::convert::Infallible;

    fn show(&mut self, colour: Rgb) -> Result<(), Self::Error> {
        log::info!(
            "status led -> #{:02x}{:02x}{:02x}",
            colour.r,
            colour.g,
            colour.b
        );
        Ok(())
    }
}

pub type SharedLed = Arc<StdMutex<StatusLed<LogPixel>>>;

/// JSON runtime config file guarded by an async lock.
#[derive(Debug, Clone)]
pub struct RuntimeStore {
    path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

impl RuntimeStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path: Arc::new(path),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub async fn load(&self) -> Result<RuntimeConfig, StorageError> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.path.as_ref()).await {
            Ok(raw) => {
                let mut runtime = serde_json::from_slice::<RuntimeConfig>(&raw)?;
                runtime.sanitize();
                Ok(runtime)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn save(&self, runtime: &RuntimeConfig) -> Result<(), StorageError> {
        let _guard = self.lock.lock().await;
        let path = self.path.as_ref().clone();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(runtime)?;
        tokio::fs::write(path, payload).await?;
        Ok(())
    }
}

/// State shared by the common node routes.
#[derive(Clone)]
pub struct NodeWeb {
    pub flash: FlashStore,
    pub ota: OtaTracker,
    pub runtime: RuntimeStore,
    pub led: SharedLed,
    pub staged_firmware: Arc<PathBuf>,
}

impl NodeWeb {
    pub fn new(flash: FlashStore, runtime: RuntimeStore, data_dir: &Path, brightness: u8) -> Self {
        Self {
            flash,
            ota: OtaTracker::new(),
            runtime,
            led: Arc::new(StdMutex::new(StatusLed::with_brightness(LogPixel, brightness))),
            staged_firmware: Arc::new(data_dir.join(STAGED_FIRMWARE_FILE)),
        }
    }

    pub fn set_led(&self, indicator: Indicator) {
        if let Ok(mut led) = self.led.lock() {
            let _ = led.indicate(indicator);
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

pub fn text_response(status: u16, body: impl Into<String>) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body: String = body.into();
    (status, [(header::CONTENT_TYPE, web::CONTENT_TYPE_TEXT)], body).into_response()
}

pub fn html_response(body: impl Into<Body>) -> Response {
    let body: Body = body.into();
    ([(header::CONTENT_TYPE, web::CONTENT_TYPE_HTML)], body).into_response()
}

/// Query parameters merged with a urlencoded body; body values win.
pub fn request_params(query: HashMap<String, String>, body: &str) -> HashMap<String, String> {
    let mut params = query;
    params.extend(parse_params(body));
    params
}

pub fn node_routes<S>() -> Router<S>
where
    S: Clone + Send + Sync + 'static,
    NodeWeb: FromRef<S>,
{
    Router::new()
        .route(web::ROUTE_ROOT, get(handle_root))
        .route(web::ROUTE_SENSOR_DATA_PAGE, get(handle_sensor_data_page))
        .route(web::ROUTE_COLOR, get(handle_color))
        .route(
            web::ROUTE_UPLOAD,
            get(handle_file_manager).post(handle_upload),
        )
        .route(web::ROUTE_DELETE, post(handle_delete))
        .route(web::ROUTE_FILES, get(handle_list_files))
        .route(
            web::ROUTE_FIRMWARE,
            get(handle_firmware_page).post(handle_apply_stored_firmware),
        )
        .route(web::ROUTE_UPDATE, post(handle_firmware_upload))
        .route(web::ROUTE_OTA_STATUS, get(handle_get_ota_status))
        .route(
            web::ROUTE_NETWORK,
            get(handle_get_network).put(handle_put_network),
        )
}

async fn handle_root(State(node): State<NodeWeb>) -> Response {
    match web::index_page(&node.flash) {
        Ok(body) => html_response(body),
        Err(message) => text_response(500, message),
    }
}

async fn handle_sensor_data_page(State(node): State<NodeWeb>) -> Response {
    html_response(web::sensor_data_page(&node.flash))
}

/// Router fallback: serves a flash file with its extension's content type.
pub async fn handle_static_file(
    State(node): State<NodeWeb>,
    method: Method,
    uri: Uri,
) -> Response {
    if method != Method::GET && method != Method::HEAD {
        return text_response(404, web::NOT_FOUND);
    }
    let Some(path) = web::static_asset_path(uri.path()).map(url_decode) else {
        return text_response(404, web::NOT_FOUND);
    };

    let flash = node.flash.clone();
    let name = path.clone();
    match tokio::task::spawn_blocking(move || flash.read(&name)).await {
        Ok(Ok(body)) => ([(header::CONTENT_TYPE, content_type(&path))], body).into_response(),
        Ok(Err(StorageError::NotFound(_) | StorageError::InvalidName(_))) => {
            text_response(404, web::NOT_FOUND)
        }
        Ok(Err(err)) => {
            log::warn!("failed to read {path}: {err}");
            text_response(500, "Failed to open file")
        }
        Err(err) => {
            log::warn!("static file task failed: {err}");
            text_response(500, "Failed to open file")
        }
    }
}

async fn handle_color(
    State(node): State<NodeWeb>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let colour = parse_color(&params);
    node.set_led(Indicator::Custom(colour));
    text_response(200, "OK")
}

async fn handle_file_manager(State(node): State<NodeWeb>) -> Response {
    let files = node.flash.list().unwrap_or_else(|err| {
        log::warn!("failed to list flash storage: {err}");
        Vec::new()
    });
    html_response(web::render_file_manager(&files))
}

async fn handle_upload(State(node): State<NodeWeb>, multipart: Multipart) -> Response {
    match stream_multipart(multipart, FileUploadSink::new(node.flash.clone())).await {
        Ok(stored) => {
            log::info!("stored upload {} ({} bytes)", stored.path, stored.size);
            text_response(200, web::UPLOAD_COMPLETE)
        }
        Err(err) => text_response(web::upload_error_status(&err), format!("ERROR: {err}")),
    }
}

async fn handle_delete(
    State(node): State<NodeWeb>,
    Query(query): Query<HashMap<String, String>>,
    body: String,
) -> Response {
    let params = request_params(query, &body);
    let (status, message) = web::delete_file(&node.flash, params.get("file").map(String::as_str));
    text_response(status, message)
}

async fn handle_list_files(State(node): State<NodeWeb>) -> Response {
    match node.flash.list() {
        Ok(files) => Json(files).into_response(),
        Err(err) => {
            log::warn!("failed to list flash storage: {err}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to list files")
        }
    }
}

async fn handle_firmware_page(State(node): State<NodeWeb>) -> Response {
    let files = node.flash.list().unwrap_or_default();
    html_response(web::render_firmware_page(&files))
}

async fn authorize_ota(node: &NodeWeb, params: &HashMap<String, String>) -> Result<(), OtaError> {
    let runtime = node.runtime.load().await.unwrap_or_else(|err| {
        log::warn!("failed to load runtime config for OTA check: {err}");
        RuntimeConfig::default()
    });
    check_ota_password(
        &runtime.network.ota_password,
        params.get("password").map(String::as_str),
    )
}

fn staged_sink(
    node: &NodeWeb,
    total_bytes: Option<u64>,
) -> FirmwareSink<StagedFirmwareWriter, impl FnOnce() -> Result<StagedFirmwareWriter, String>> {
    let path = node.staged_firmware.as_ref().clone();
    FirmwareSink::new(node.ota.clone(), total_bytes, move || {
        StagedFirmwareWriter::create(path)
    })
}

fn firmware_applied(image: &FirmwareImage, source: &str) -> Response {
    log::info!("restart required to boot firmware staged from {source}");
    text_response(
        200,
        format!(
            "Update complete from {source}: {} bytes, sha256 {}. Restart to boot the new firmware.",
            image.bytes, image.sha256
        ),
    )
}

async fn handle_apply_stored_firmware(
    State(node): State<NodeWeb>,
    Query(query): Query<HashMap<String, String>>,
    body: String,
) -> Response {
    let params = request_params(query, &body);
    if let Err(err) = authorize_ota(&node, &params).await {
        return text_response(web::ota_error_status(&err), err.to_string());
    }
    let Some(file) = params.get("file").filter(|name| !name.trim().is_empty()).cloned() else {
        return text_response(400, "ERROR: No filename specified");
    };

    let sink = staged_sink(&node, None);
    let flash = node.flash.clone();
    let source = file.clone();
    let result =
        tokio::task::spawn_blocking(move || apply_stored_firmware(&flash, &source, sink)).await;

    match result {
        Ok(Ok(image)) => firmware_applied(&image, &file),
        Ok(Err(err)) => {
            log::warn!("stored firmware apply failed: {err}");
            text_response(web::ota_error_status(&err), format!("ERROR: {err}"))
        }
        Err(err) => {
            log::warn!("firmware apply task failed: {err}");
            text_response(500, "ERROR: firmware apply task failed")
        }
    }
}

async fn handle_firmware_upload(
    State(node): State<NodeWeb>,
    Query(query): Query<HashMap<String, String>>,
    multipart: Multipart,
) -> Response {
    if let Err(err) = authorize_ota(&node, &query).await {
        return text_response(web::ota_error_status(&err), err.to_string());
    }

    match stream_multipart(multipart, staged_sink(&node, None)).await {
        Ok(image) => firmware_applied(&image, "upload"),
        Err(err) => {
            log::warn!("firmware upload failed: {err}");
            text_response(web::upload_error_status(&err), format!("ERROR: {err}"))
        }
    }
}

async fn handle_get_ota_status(State(node): State<NodeWeb>) -> impl IntoResponse {
    Json(node.ota.status_view(true, None, Some(node.staged_firmware.display().to_string())))
}

async fn handle_get_network(State(node): State<NodeWeb>) -> impl IntoResponse {
    let runtime = node.runtime.load().await.unwrap_or_else(|err| {
        log::warn!("failed to load network config from store: {err}");
        RuntimeConfig::default()
    });
    Json(build_network_config_view(&runtime))
}

async fn handle_put_network(
    State(node): State<NodeWeb>,
    Json(update): Json<NetworkConfigUpdate>,
) -> Response {
    if let Err(message) = validate_network_update(&update) {
        return error_response(StatusCode::BAD_REQUEST, message);
    }

    let mut runtime = node.runtime.load().await.unwrap_or_else(|err| {
        log::warn!("failed to load existing runtime config for update: {err}");
        RuntimeConfig::default()
    });
    let payload = apply_network_update(&mut runtime, update);

    if let Err(err) = node.runtime.save(&runtime).await {
        log::warn!("failed to persist network config update: {err}");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to persist network settings",
        );
    }
    Json(payload).into_response()
}

/// Upload events handed from the async request body to the blocking writer.
enum UploadCommand {
    Start(String),
    Data(Bytes),
    End,
    Abort,
}

const UPLOAD_QUEUE_DEPTH: usize = 8;

/// Streams the first file part of a multipart body into `sink`. The sink runs
/// on a blocking worker so flash writes stay off the async executor.
pub async fn stream_multipart<S>(multipart: Multipart, sink: S) -> Result<S::Output, UploadError>
where
    S: UploadSink + Send + 'static,
    S::Output: Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<UploadCommand>(UPLOAD_QUEUE_DEPTH);
    let worker = tokio::task::spawn_blocking(move || {
        let mut session = UploadSession::new(sink);
        while let Some(command) = rx.blocking_recv() {
            match command {
                UploadCommand::Start(filename) => session.start(&filename)?,
                UploadCommand::Data(chunk) => session.write(&chunk)?,
                UploadCommand::End => return session.end().map(Some),
                UploadCommand::Abort => {
                    session.abort();
                    return Err(UploadError::Aborted);
                }
            }
        }
        session.abort();
        Ok(None)
    });

    let fed = feed_upload(multipart, &tx).await;
    drop(tx);

    let output = match worker.await {
        Ok(result) => result?,
        Err(err) => {
            log::warn!("upload worker failed: {err}");
            return Err(UploadError::Sink("upload worker failed".to_string()));
        }
    };
    fed?;
    output.ok_or_else(|| UploadError::Rejected("no file in upload".to_string()))
}

/// Forwards the first file part to the upload worker. A closed channel means
/// the worker already gave up; its error is the one reported.
async fn feed_upload(
    mut multipart: Multipart,
    tx: &mpsc::Sender<UploadCommand>,
) -> Result<(), UploadError> {
    let mut sent_file = false;

    loop {
        let mut field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => return Ok(()),
            Err(err) if sent_file => {
                log::warn!("ignoring multipart error after the first file: {err}");
                return Ok(());
            }
            Err(err) => {
                log::warn!("multipart read failed: {err}");
                return Err(UploadError::Multipart("malformed multipart body"));
            }
        };
        let Some(filename) = field
            .file_name()
            .filter(|name| !name.is_empty())
            .map(str::to_string)
        else {
            continue;
        };
        if sent_file {
            log::warn!("ignoring extra upload part `{filename}`");
            continue;
        }

        if tx.send(UploadCommand::Start(filename.clone())).await.is_err() {
            return Ok(());
        }
        loop {
            match field.chunk().await {
                Ok(Some(chunk)) => {
                    if tx.send(UploadCommand::Data(chunk)).await.is_err() {
                        return Ok(());
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    log::warn!("upload of {filename} interrupted: {err}");
                    let _ = tx.send(UploadCommand::Abort).await;
                    return Err(UploadError::Aborted);
                }
            }
        }
        if tx.send(UploadCommand::End).await.is_err() {
            return Ok(());
        }
        sent_file = true;
    }
}
