//! Route table, page rendering and response texts shared by the host (axum)
//! and ESP32 (`EspHttpServer`) adapters.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;

use crate::{
    identity::ClientId,
    ota::OtaError,
    params::to_int,
    storage::{FileEntry, FlashStore, StorageError, INDEX_PATH},
    upload::UploadError,
};

pub const ROUTE_ROOT: &str = "/";
pub const ROUTE_SENSOR: &str = "/sensor";
pub const ROUTE_SENSOR_DATA: &str = "/sensorData";
pub const ROUTE_LOCAL_SENSOR_DATA: &str = "/localSensorData";
pub const ROUTE_SENSOR_DATA_PAGE: &str = "/sensorDataPage";
pub const ROUTE_SET_CLIENT_ID: &str = "/setClientId";
pub const ROUTE_COLOR: &str = "/color";
pub const ROUTE_UPLOAD: &str = "/upload";
pub const ROUTE_DELETE: &str = "/delete";
pub const ROUTE_FILES: &str = "/files";
pub const ROUTE_FIRMWARE: &str = "/firmware";
pub const ROUTE_UPDATE: &str = "/update";
pub const ROUTE_OTA_STATUS: &str = "/api/ota/status";
pub const ROUTE_NETWORK: &str = "/api/network";
pub const ROUTE_RESTART: &str = "/api/restart";

pub const SENSOR_DATA_PAGE_PATH: &str = "/sensor_data.html";

pub const UPLOAD_COMPLETE: &str = "Upload complete - <a href='/upload'>Back to File Manager</a>";
pub const INDEX_MISSING: &str = "File not found in SPIFFS";
pub const INDEX_EMPTY: &str = "File is empty";
pub const NOT_FOUND: &str = "Not found";

pub const CONTENT_TYPE_TEXT: &str = "text/plain";
pub const CONTENT_TYPE_HTML: &str = "text/html; charset=utf-8";
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Envelope for JSON replies from the sensor node API.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ApiResponse {
    pub fn ok(message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LocalSensorData {
    #[serde(rename = "clientId")]
    pub client_id: ClientId,
    pub value: i32,
    pub collector: String,
}

pub fn html_escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

/// Status and body for a `/delete` request.
pub fn delete_file(store: &FlashStore, raw_name: Option<&str>) -> (u16, String) {
    let name = raw_name.map(str::trim).unwrap_or_default();
    if name.is_empty() {
        log::warn!("delete request failed: no filename specified");
        return (400, "ERROR: No filename specified".to_string());
    }

    let shown = if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{name}")
    };
    log::info!("attempting to delete file: {shown}");

    if !store.exists(&shown) {
        let message = format!("ERROR: File '{shown}' not found in SPIFFS");
        log::warn!("{message}");
        return (404, message);
    }

    match store.remove(&shown) {
        Ok(()) => {
            let message = format!("SUCCESS: File '{shown}' deleted successfully");
            log::info!("{message}");
            (200, message)
        }
        Err(err) => {
            log::warn!("delete of {shown} failed: {err}");
            (500, format!("ERROR: Failed to delete file '{shown}'"))
        }
    }
}

/// Body of `/`, or the 500 text when the index page is unusable.
pub fn index_page(store: &FlashStore) -> Result<Vec<u8>, &'static str> {
    match store.read(INDEX_PATH) {
        Ok(body) if body.is_empty() => {
            log::warn!("index.html is empty");
            Err(INDEX_EMPTY)
        }
        Ok(body) => Ok(body),
        Err(StorageError::NotFound(_)) => {
            log::warn!("index.html not found in flash storage");
            Err(INDEX_MISSING)
        }
        Err(err) => {
            log::warn!("failed to read index.html: {err}");
            Err("Failed to open file")
        }
    }
}

/// `/sensor_data.html` from flash, or the built-in page when it is absent.
pub fn sensor_data_page(store: &FlashStore) -> Vec<u8> {
    match store.read(SENSOR_DATA_PAGE_PATH) {
        Ok(body) if !body.is_empty() => body,
        _ => DEFAULT_SENSOR_DATA_PAGE.as_bytes().to_vec(),
    }
}

/// Reads the `id` parameter of `/setClientId`.
pub fn parse_client_id_param(params: &HashMap<String, String>) -> Result<i32, &'static str> {
    let raw = params
        .get("id")
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .ok_or("missing id parameter")?;

    let digits = raw.strip_prefix(['-', '+']).unwrap_or(raw);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err("id must be a number");
    }
    Ok(to_int(raw))
}

pub fn upload_error_status(err: &UploadError) -> u16 {
    match err {
        UploadError::Storage(StorageError::Io(_) | StorageError::Backend(_)) => 500,
        UploadError::Storage(StorageError::NotFound(_)) => 404,
        UploadError::Sink(_) => 500,
        UploadError::Busy(_) => 409,
        _ => 400,
    }
}

pub fn ota_error_status(err: &OtaError) -> u16 {
    match err {
        OtaError::InProgress => 409,
        OtaError::Unauthorized => 403,
        OtaError::NotFirmware => 400,
        OtaError::Upload(err) => upload_error_status(err),
        OtaError::Storage(StorageError::NotFound(_)) => 404,
        OtaError::Storage(StorageError::InvalidName(_) | StorageError::InvalidExtension(_)) => 400,
        OtaError::Storage(_) => 500,
    }
}

/// Path of a static asset request, when it maps onto a flash file.
pub fn static_asset_path(uri_path: &str) -> Option<&str> {
    let path = uri_path.split('?').next().unwrap_or_default();
    (path.len() > 1 && path.starts_with('/')).then_some(path)
}

pub fn render_file_manager(files: &[FileEntry]) -> String {
    let mut rows = String::new();
    for file in files {
        let name = html_escape(&file.name);
        rows.push_str(&format!(
            "<div class='row'><div><b>{name}</b><br><small>{} bytes</small></div>\
             <button class='del' data-file=\"{name}\">Delete</button></div>",
            file.size
        ));
    }
    if files.is_empty() {
        rows.push_str("<div class='row'>No files found in SPIFFS</div>");
    }

    FILE_MANAGER_TEMPLATE.replace("{{rows}}", &rows)
}

pub fn render_firmware_page(files: &[FileEntry]) -> String {
    let mut options = String::new();
    for file in files.iter().filter(|f| f.name.to_ascii_lowercase().ends_with(".bin")) {
        let name = html_escape(&file.name);
        options.push_str(&format!(
            "<option value=\"{name}\">{name} ({} bytes)</option>",
            file.size
        ));
    }
    let stored = if options.is_empty() {
        "<p>No .bin files stored. Upload one in the <a href='/upload'>File Manager</a>.</p>"
            .to_string()
    } else {
        format!(
            "<form method='POST' action='/firmware'><select name='file'>{options}</select>\
             <input type='password' name='password' placeholder='OTA password'>\
             <button>Apply stored image</button></form>"
        )
    };

    FIRMWARE_TEMPLATE.replace("{{stored}}", &stored)
}

const FILE_MANAGER_TEMPLATE: &str = r#"<!doctype html>
<html>
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>File Manager</title>
  <style>
    body{font-family:Arial,sans-serif;margin:20px;background:#f5f5f5}
    .card{max-width:800px;margin:0 auto;background:#fff;padding:20px;border-radius:10px}
    .row{padding:10px;border-bottom:1px solid #eee;display:flex;justify-content:space-between;align-items:center}
    .del{background:#e74c3c;color:#fff;border:none;padding:5px 10px;border-radius:3px}
    form{background:#ecf0f1;padding:15px;border-radius:5px;margin-bottom:20px}
  </style>
</head>
<body>
  <div class="card">
    <h2>ESP32 File Manager</h2>
    <form method="POST" action="/upload" enctype="multipart/form-data">
      <h3>Upload New File</h3>
      <input type="file" name="upload" required>
      <input type="submit" value="Upload File">
    </form>
    <button onclick="location.reload()">Refresh File List</button>
    <h3>Current Files in SPIFFS:</h3>
    <div>{{rows}}</div>
    <p><a href="/">Back to Main Page</a> | <a href="/firmware">Firmware Update</a></p>
  </div>
  <script>
    document.querySelectorAll('.del').forEach((btn)=>btn.addEventListener('click', async ()=>{
      const name=btn.dataset.file;
      if(!confirm('Are you sure you want to delete '+name+'?'))return;
      try{
        const r=await fetch('/delete?file='+encodeURIComponent(name),{method:'POST'});
        alert(await r.text());
        location.reload();
      }catch(err){alert('Error: '+err);}
    }));
  </script>
</body>
</html>
"#;

const FIRMWARE_TEMPLATE: &str = r#"<!doctype html>
<html>
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>Firmware Update</title>
  <style>
    body{font-family:Arial,sans-serif;margin:20px;background:#f5f5f5}
    .card{max-width:800px;margin:0 auto;background:#fff;padding:20px;border-radius:10px}
    form{background:#ecf0f1;padding:15px;border-radius:5px;margin-bottom:20px}
  </style>
</head>
<body>
  <div class="card">
    <h2>Firmware Update</h2>
    <h3>Upload firmware image</h3>
    <form id="upload">
      <input type="file" id="image" accept=".bin" required>
      <input type="password" id="password" placeholder="OTA password">
      <input type="submit" value="Upload and Flash">
    </form>
    <h3>Flash a stored image</h3>
    {{stored}}
    <p>Status: <span id="status">--</span></p>
    <p><a href="/upload">File Manager</a> | <a href="/">Main Page</a></p>
  </div>
  <script>
    const q=(id)=>document.getElementById(id);
    async function poll(){
      try{
        const s=await (await fetch('/api/ota/status')).json();
        q('status').textContent=s.inProgress?('writing '+(s.progressPct??'?')+'%'):(s.lastError||(s.lastSha256?'done '+s.lastSha256:'idle'));
      }catch(err){q('status').textContent=err.message;}
    }
    q('upload').addEventListener('submit', async (ev)=>{
      ev.preventDefault();
      const body=new FormData();
      body.append('firmware', q('image').files[0]);
      const pass=encodeURIComponent(q('password').value);
      const r=await fetch('/update?password='+pass,{method:'POST',body});
      q('status').textContent=await r.text();
    });
    setInterval(poll, 2000);
    poll();
  </script>
</body>
</html>
"#;

pub const DEFAULT_SENSOR_DATA_PAGE: &str = r#"<!doctype html>
<html>
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>Sensor Data</title>
  <style>
    body{font-family:Arial,sans-serif;margin:20px;background:#f5f5f5}
    table{border-collapse:collapse;background:#fff}
    td,th{border:1px solid #ddd;padding:6px 12px}
    .on{color:#2980b9}.off{color:#c0392b}
  </style>
</head>
<body>
  <h2>Sensor Data</h2>
  <table><thead><tr><th>Sender</th><th>Client</th><th>Value</th></tr></thead><tbody id="rows"></tbody></table>
  <p id="local"></p>
  <script>
    async function refresh(){
      const rows=document.getElementById('rows');
      try{
        const data=await (await fetch('/sensorData')).json();
        rows.innerHTML='';
        for(const [ip,entry] of Object.entries(data)){
          const tr=document.createElement('tr');
          for(const v of [ip,entry.clientId,entry.value]){const td=document.createElement('td');td.textContent=v;tr.appendChild(td);}
          tr.className=entry.value===1?'on':'off';
          rows.appendChild(tr);
        }
      }catch(_){}
      try{
        const local=await (await fetch('/localSensorData')).json();
        document.getElementById('local').textContent='This node: client '+local.clientId+', value '+local.value+' -> '+local.collector;
      }catch(_){}
    }
    setInterval(refresh, 1000);
    refresh();
  </script>
</body>
</html>
"#;

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{params::parse_params, storage::tests::temp_store};

    #[test]
    fn delete_outcomes() {
        let store = temp_store("web-delete");
        store.write("/old.txt", b"x").unwrap();

        assert_eq!(
            delete_file(&store, None),
            (400, "ERROR: No filename specified".to_string())
        );
        assert_eq!(
            delete_file(&store, Some("missing.txt")),
            (404, "ERROR: File '/missing.txt' not found in SPIFFS".to_string())
        );
        assert_eq!(
            delete_file(&store, Some("old.txt")),
            (200, "SUCCESS: File '/old.txt' deleted successfully".to_string())
        );
        assert!(!store.exists("/old.txt"));
    }

    #[test]
    fn index_errors_match_wire_texts() {
        let store = temp_store("web-index");
        assert_eq!(index_page(&store), Err(INDEX_MISSING));
        store.write(INDEX_PATH, b"").unwrap();
        assert_eq!(index_page(&store), Err(INDEX_EMPTY));
        store.write(INDEX_PATH, b"<h1>ok</h1>").unwrap();
        assert_eq!(index_page(&store).unwrap(), b"<h1>ok</h1>");
    }

    #[test]
    fn sensor_data_page_falls_back() {
        let store = temp_store("web-sdp");
        assert_eq!(
            sensor_data_page(&store),
            DEFAULT_SENSOR_DATA_PAGE.as_bytes()
        );
        store.write(SENSOR_DATA_PAGE_PATH, b"custom").unwrap();
        assert_eq!(sensor_data_page(&store), b"custom");
    }

    #[test]
    fn client_id_param_validation() {
        assert_eq!(parse_client_id_param(&parse_params("id=7")), Ok(7));
        assert_eq!(parse_client_id_param(&parse_params("id=99")), Ok(99));
        assert!(parse_client_id_param(&parse_params("")).is_err());
        assert!(parse_client_id_param(&parse_params("id=")).is_err());
        assert!(parse_client_id_param(&parse_params("id=seven")).is_err());
    }

    #[test]
    fn file_manager_escapes_names() {
        let page = render_file_manager(&[FileEntry {
            name: "/<x>.txt".to_string(),
            size: 3,
        }]);
        assert!(page.contains("&lt;x&gt;.txt"));
        assert!(!page.contains("<x>.txt"));
        assert!(render_file_manager(&[]).contains("No files found in SPIFFS"));
    }

    #[test]
    fn firmware_page_lists_only_images() {
        let page = render_firmware_page(&[
            FileEntry {
                name: "/fw.bin".to_string(),
                size: 10,
            },
            FileEntry {
                name: "/index.html".to_string(),
                size: 5,
            },
        ]);
        assert!(page.contains("<option value=\"/fw.bin\">"));
        assert!(!page.contains("/index.html ("));
    }

    #[test]
    fn api_response_shape() {
        let body = serde_json::to_string(&ApiResponse::ok(
            "Client ID updated",
            Some(serde_json::json!({ "clientId": 4 })),
        ))
        .unwrap();
        assert_eq!(
            body,
            r#"{"success":true,"message":"Client ID updated","data":{"clientId":4}}"#
        );
        assert_eq!(
            serde_json::to_string(&ApiResponse::error("bad")).unwrap(),
            r#"{"success":false,"message":"bad"}"#
        );
    }

    #[test]
    fn error_statuses() {
        assert_eq!(
            upload_error_status(&UploadError::Storage(StorageError::InvalidExtension(
                "/a.sh".to_string()
            ))),
            400
        );
        assert_eq!(upload_error_status(&UploadError::Sink("flash".to_string())), 500);
        assert_eq!(ota_error_status(&OtaError::Unauthorized), 403);
        assert_eq!(ota_error_status(&OtaError::InProgress), 409);
        assert_eq!(
            ota_error_status(&OtaError::Upload(UploadError::Busy("busy".to_string()))),
            409
        );
        assert_eq!(
            ota_error_status(&OtaError::Storage(StorageError::NotFound("/x.bin".to_string()))),
            404
        );
    }

    #[test]
    fn static_paths() {
        assert_eq!(static_asset_path("/app.js?v=2"), Some("/app.js"));
        assert_eq!(static_asset_path("/"), None);
    }
}
