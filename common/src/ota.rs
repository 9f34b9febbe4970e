use std::{
    fmt::Write as _,
    fs::File,
    io::{Read, Write},
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard},
};

use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::{
    storage::{is_firmware_image, normalize_path, FlashStore, StorageError},
    upload::{UploadError, UploadSession, UploadSink},
};

pub const OTA_CHUNK_SIZE: usize = 4096;

#[derive(Debug, Error)]
pub enum OtaError {
    #[error("OTA update already in progress")]
    InProgress,
    #[error("invalid OTA password")]
    Unauthorized,
    #[error("firmware image must be a .bin file")]
    NotFirmware,
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Default, Clone)]
pub struct OtaRuntimeState {
    pub in_progress: bool,
    pub bytes_written: u64,
    pub total_bytes: Option<u64>,
    pub progress_pct: Option<u8>,
    pub last_error: Option<String>,
    pub last_sha256: Option<String>,
    pub last_source: Option<String>,
    pub last_completed_epoch: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct OtaStatusView {
    pub supported: bool,
    #[serde(rename = "inProgress")]
    pub in_progress: bool,
    #[serde(rename = "bytesWritten")]
    pub bytes_written: u64,
    #[serde(rename = "totalBytes")]
    pub total_bytes: Option<u64>,
    #[serde(rename = "progressPct")]
    pub progress_pct: Option<u8>,
    #[serde(rename = "lastError")]
    pub last_error: Option<String>,
    #[serde(rename = "lastSha256")]
    pub last_sha256: Option<String>,
    #[serde(rename = "lastSource")]
    pub last_source: Option<String>,
    #[serde(rename = "lastCompletedEpoch")]
    pub last_completed_epoch: Option<i64>,
    #[serde(rename = "runningSlot")]
    pub running_slot: Option<String>,
    #[serde(rename = "updateSlot")]
    pub update_slot: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct OtaTracker {
    state: Arc<Mutex<OtaRuntimeState>>,
}

impl OtaTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, OtaRuntimeState> {
        // A panic while holding the lock leaves plain data behind; keep serving it.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn begin(&self, source: &str, total_bytes: Option<u64>) -> Result<(), OtaError> {
        let mut state = self.lock();
        if state.in_progress {
            return Err(OtaError::InProgress);
        }
        state.in_progress = true;
        state.bytes_written = 0;
        state.total_bytes = total_bytes;
        state.progress_pct = None;
        state.last_error = None;
        state.last_sha256 = None;
        state.last_source = Some(source.to_string());
        Ok(())
    }

    pub fn progress(&self, bytes_written: u64) {
        let mut state = self.lock();
        state.bytes_written = bytes_written;
        if let Some(total) = state.total_bytes.filter(|total| *total > 0) {
            let pct = (bytes_written.saturating_mul(100) / total).min(100);
            state.progress_pct = Some(pct as u8);
        }
    }

    pub fn complete(&self, bytes_written: u64, sha256: String) {
        let mut state = self.lock();
        state.in_progress = false;
        state.bytes_written = bytes_written;
        state.progress_pct = Some(100);
        state.last_error = None;
        state.last_sha256 = Some(sha256);
        state.last_completed_epoch = Some(chrono::Utc::now().timestamp());
    }

    pub fn fail(&self, error: &str) {
        let mut state = self.lock();
        state.in_progress = false;
        state.last_error = Some(error.to_string());
        state.last_completed_epoch = Some(chrono::Utc::now().timestamp());
    }

    pub fn snapshot(&self) -> OtaRuntimeState {
        self.lock().clone()
    }

    pub fn status_view(
        &self,
        supported: bool,
        running_slot: Option<String>,
        update_slot: Option<String>,
    ) -> OtaStatusView {
        let state = self.snapshot();
        OtaStatusView {
            supported,
            in_progress: state.in_progress,
            bytes_written: state.bytes_written,
            total_bytes: state.total_bytes,
            progress_pct: state.progress_pct,
            last_error: state.last_error,
            last_sha256: state.last_sha256,
            last_source: state.last_source,
            last_completed_epoch: state.last_completed_epoch,
            running_slot,
            update_slot,
        }
    }
}

pub fn check_ota_password(configured: &str, supplied: Option<&str>) -> Result<(), OtaError> {
    if configured.is_empty() || supplied == Some(configured) {
        Ok(())
    } else {
        Err(OtaError::Unauthorized)
    }
}

/// Platform flash writer for a new firmware image.
pub trait FirmwareWriter {
    fn write(&mut self, chunk: &[u8]) -> Result<(), String>;
    fn complete(self) -> Result<(), String>;
    fn abort(self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    pub bytes: u64,
    pub sha256: String,
}

/// Upload sink that streams a firmware image into the OTA partition while
/// hashing it and reporting progress. The writer is opened lazily once the
/// tracker has accepted the update.
pub struct FirmwareSink<W, F> {
    tracker: OtaTracker,
    open_writer: Option<F>,
    total_bytes: Option<u64>,
    writer: Option<W>,
    hasher: Sha256,
    written: u64,
}

impl<W, F> FirmwareSink<W, F>
where
    W: FirmwareWriter,
    F: FnOnce() -> Result<W, String>,
{
    pub fn new(tracker: OtaTracker, total_bytes: Option<u64>, open_writer: F) -> Self {
        Self {
            tracker,
            open_writer: Some(open_writer),
            total_bytes,
            writer: None,
            hasher: Sha256::new(),
            written: 0,
        }
    }
}

impl<W, F> UploadSink for FirmwareSink<W, F>
where
    W: FirmwareWriter,
    F: FnOnce() -> Result<W, String>,
{
    type Output = FirmwareImage;

    fn begin(&mut self, filename: &str) -> Result<(), UploadError> {
        if !is_firmware_image(filename) {
            return Err(UploadError::Rejected(OtaError::NotFirmware.to_string()));
        }
        let Some(open_writer) = self.open_writer.take() else {
            return Err(UploadError::Sink("OTA writer already used".to_string()));
        };
        self.tracker
            .begin(filename, self.total_bytes)
            .map_err(|err| match err {
                OtaError::InProgress => UploadError::Busy(err.to_string()),
                other => UploadError::Rejected(other.to_string()),
            })?;

        match open_writer() {
            Ok(writer) => {
                self.writer = Some(writer);
                self.hasher = Sha256::new();
                self.written = 0;
                log::info!("OTA update started from {filename}");
                Ok(())
            }
            Err(err) => {
                self.tracker.fail(&err);
                Err(UploadError::Sink(err))
            }
        }
    }

    fn write(&mut self, chunk: &[u8]) -> Result<(), UploadError> {
        let Some(writer) = self.writer.as_mut() else {
            return Err(UploadError::Sink("OTA writer not open".to_string()));
        };
        writer.write(chunk).map_err(UploadError::Sink)?;
        self.hasher.update(chunk);
        self.written = self.written.saturating_add(chunk.len() as u64);
        self.tracker.progress(self.written);
        Ok(())
    }

    fn finish(&mut self, _total_bytes: u64) -> Result<FirmwareImage, UploadError> {
        let Some(writer) = self.writer.take() else {
            return Err(UploadError::Sink("OTA writer not open".to_string()));
        };

        if self.written == 0 {
            writer.abort();
            let message = "firmware image is empty".to_string();
            self.tracker.fail(&message);
            return Err(UploadError::Rejected(message));
        }

        if let Err(err) = writer.complete() {
            self.tracker.fail(&err);
            return Err(UploadError::Sink(err));
        }

        let digest = std::mem::take(&mut self.hasher).finalize();
        let mut sha256 = String::with_capacity(64);
        for byte in digest {
            let _ = write!(&mut sha256, "{byte:02x}");
        }

        self.tracker.complete(self.written, sha256.clone());
        log::info!("OTA update complete: {} bytes, sha256 {sha256}", self.written);
        Ok(FirmwareImage {
            bytes: self.written,
            sha256,
        })
    }

    fn abort(&mut self) {
        if let Some(writer) = self.writer.take() {
            writer.abort();
            self.tracker.fail("upload aborted");
        }
    }
}

/// Streams a `.bin` stored in the flash filesystem into the OTA writer.
pub fn apply_stored_firmware<W, F>(
    store: &FlashStore,
    name: &str,
    mut sink: FirmwareSink<W, F>,
) -> Result<FirmwareImage, OtaError>
where
    W: FirmwareWriter,
    F: FnOnce() -> Result<W, String>,
{
    let path = normalize_path(name)?;
    if !is_firmware_image(&path) {
        return Err(OtaError::NotFirmware);
    }
    let size = store.size(&path)?;
    let mut file = store.open(&path)?;
    sink.total_bytes = Some(size);

    let mut session = UploadSession::new(sink);
    session.start(&path)?;

    let mut chunk = vec![0_u8; OTA_CHUNK_SIZE];
    loop {
        let read = match file.read(&mut chunk) {
            Ok(read) => read,
            Err(err) => {
                session.abort();
                return Err(StorageError::from(err).into());
            }
        };
        if read == 0 {
            break;
        }
        session.write(&chunk[..read])?;
    }

    Ok(session.end()?)
}

/// Host stand-in for the OTA partition: stages the image on disk.
pub struct StagedFirmwareWriter {
    path: PathBuf,
    file: File,
}

impl StagedFirmwareWriter {
    pub fn create(path: PathBuf) -> Result<Self, String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| err.to_string())?;
        }
        let file = File::create(&path).map_err(|err| err.to_string())?;
        Ok(Self { path, file })
    }
}

impl FirmwareWriter for StagedFirmwareWriter {
    fn write(&mut self, chunk: &[u8]) -> Result<(), String> {
        self.file.write_all(chunk).map_err(|err| err.to_string())
    }

    fn complete(mut self) -> Result<(), String> {
        self.file.flush().map_err(|err| err.to_string())?;
        log::info!("firmware staged at {}", self.path.display());
        Ok(())
    }

    fn abort(self) {
        let Self { path, file } = self;
        drop(file);
        let _ = std::fs::remove_file(path);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::storage::tests::temp_store;

    #[derive(Default)]
    struct Recorded {
        data: Vec<u8>,
        completed: bool,
        aborted: bool,
    }

    struct MemoryWriter(Arc<Mutex<Recorded>>);

    impl FirmwareWriter for MemoryWriter {
        fn write(&mut self, chunk: &[u8]) -> Result<(), String> {
            self.0.lock().unwrap().data.extend_from_slice(chunk);
            Ok(())
        }

        fn complete(self) -> Result<(), String> {
            self.0.lock().unwrap().completed = true;
            Ok(())
        }

        fn abort(self) {
            self.0.lock().unwrap().aborted = true;
        }
    }

    type MemorySink = FirmwareSink<MemoryWriter, Box<dyn FnOnce() -> Result<MemoryWriter, String>>>;

    fn memory_sink(tracker: &OtaTracker, total: Option<u64>) -> (MemorySink, Arc<Mutex<Recorded>>) {
        let recorded = Arc::new(Mutex::new(Recorded::default()));
        let handle = recorded.clone();
        let open: Box<dyn FnOnce() -> Result<MemoryWriter, String>> =
            Box::new(move || Ok(MemoryWriter(handle)));
        (FirmwareSink::new(tracker.clone(), total, open), recorded)
    }

    #[test]
    fn hashes_and_completes_image() {
        let tracker = OtaTracker::new();
        let (sink, recorded) = memory_sink(&tracker, Some(6));
        let mut session = UploadSession::new(sink);

        session.start("firmware.bin").unwrap();
        session.write(b"abc").unwrap();
        assert_eq!(tracker.snapshot().progress_pct, Some(50));
        session.write(b"def").unwrap();
        let image = session.end().unwrap();

        assert_eq!(image.bytes, 6);
        assert_eq!(
            image.sha256,
            "bef57ec7f53a6d40beb640a780a639c83bc29ac8a9816f1fc6c5c6dcd93c4721"
        );
        assert_eq!(recorded.lock().unwrap().data, b"abcdef");
        assert!(recorded.lock().unwrap().completed);

        let state = tracker.snapshot();
        assert!(!state.in_progress);
        assert_eq!(state.progress_pct, Some(100));
        assert_eq!(state.last_sha256.as_deref(), Some(image.sha256.as_str()));
    }

    #[test]
    fn rejects_non_bin_and_concurrent_updates() {
        let tracker = OtaTracker::new();
        let (sink, _) = memory_sink(&tracker, None);
        let mut session = UploadSession::new(sink);
        assert!(session.start("index.html").is_err());

        tracker.begin("other.bin", None).unwrap();
        let (sink, _) = memory_sink(&tracker, None);
        let mut session = UploadSession::new(sink);
        assert!(matches!(
            session.start("fw.bin"),
            Err(UploadError::Busy(message)) if message.contains("already in progress")
        ));
    }

    #[test]
    fn empty_image_is_rejected() {
        let tracker = OtaTracker::new();
        let (sink, recorded) = memory_sink(&tracker, None);
        let mut session = UploadSession::new(sink);

        session.start("fw.bin").unwrap();
        assert!(session.end().is_err());
        assert!(recorded.lock().unwrap().aborted);
        assert_eq!(
            tracker.snapshot().last_error.as_deref(),
            Some("firmware image is empty")
        );
    }

    #[test]
    fn abort_releases_writer() {
        let tracker = OtaTracker::new();
        let (sink, recorded) = memory_sink(&tracker, None);
        let mut session = UploadSession::new(sink);

        session.start("fw.bin").unwrap();
        session.write(b"partial").unwrap();
        session.abort();

        assert!(recorded.lock().unwrap().aborted);
        assert!(!tracker.snapshot().in_progress);
    }

    #[test]
    fn applies_stored_image() {
        let store = temp_store("ota-stored");
        let image = vec![0xA5_u8; OTA_CHUNK_SIZE * 2 + 17];
        store.write("/update.bin", &image).unwrap();

        let tracker = OtaTracker::new();
        let (sink, recorded) = memory_sink(&tracker, None);
        let applied = apply_stored_firmware(&store, "update.bin", sink).unwrap();

        assert_eq!(applied.bytes, image.len() as u64);
        assert_eq!(recorded.lock().unwrap().data.len(), image.len());
        assert_eq!(tracker.snapshot().total_bytes, Some(image.len() as u64));
    }

    #[test]
    fn stored_apply_requires_bin() {
        let store = temp_store("ota-notbin");
        store.write("/index.html", b"<html>").unwrap();
        let tracker = OtaTracker::new();
        let (sink, _) = memory_sink(&tracker, None);

        assert!(matches!(
            apply_stored_firmware(&store, "/index.html", sink),
            Err(OtaError::NotFirmware)
        ));
    }

    #[test]
    fn password_check() {
        assert!(check_ota_password("", None).is_ok());
        assert!(check_ota_password("admin", Some("admin")).is_ok());
        assert!(matches!(
            check_ota_password("admin", Some("nope")),
            Err(OtaError::Unauthorized)
        ));
        assert!(check_ota_password("admin", None).is_err());
    }

    #[test]
    fn staged_writer_removes_file_on_abort() {
        let dir = std::env::temp_dir().join(format!("sensornet-staged-{}", std::process::id()));
        let path = dir.join("firmware.staged.bin");

        let mut writer = StagedFirmwareWriter::create(path.clone()).unwrap();
        writer.write(b"xyz").unwrap();
        assert!(path.exists());
        writer.abort();

        assert!(!path.exists());
        let _ = std::fs::remove_dir_all(dir);
    }
}
