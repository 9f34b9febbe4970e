use std::{fs::File, io::Write};

use thiserror::Error;

use crate::storage::{is_valid_upload_extension, normalize_path, FlashStore, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStatus {
    Start,
    Write,
    End,
    Aborted,
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("upload event {event:?} not valid while {state}")]
    OutOfOrder {
        event: UploadStatus,
        state: &'static str,
    },
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("upload rejected: {0}")]
    Rejected(String),
    #[error("upload refused: {0}")]
    Busy(String),
    #[error("upload sink failed: {0}")]
    Sink(String),
    #[error("upload aborted by client")]
    Aborted,
    #[error("malformed multipart body: {0}")]
    Multipart(&'static str),
}

/// Destination of a chunked upload.
pub trait UploadSink {
    type Output;

    fn begin(&mut self, filename: &str) -> Result<(), UploadError>;
    fn write(&mut self, chunk: &[u8]) -> Result<(), UploadError>;
    fn finish(&mut self, total_bytes: u64) -> Result<Self::Output, UploadError>;
    fn abort(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Receiving,
    Done,
}

impl Phase {
    fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Receiving => "receiving",
            Self::Done => "done",
        }
    }
}

/// Drives a sink through START, WRITE*, END. ABORTED at any point discards
/// the partial upload and returns the session to idle.
#[derive(Debug)]
pub struct UploadSession<S> {
    sink: S,
    phase: Phase,
    filename: Option<String>,
    total_bytes: u64,
}

impl<S: UploadSink> UploadSession<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            phase: Phase::Idle,
            filename: None,
            total_bytes: 0,
        }
    }

    pub fn start(&mut self, filename: &str) -> Result<(), UploadError> {
        if self.phase != Phase::Idle {
            return Err(self.out_of_order(UploadStatus::Start));
        }
        log::info!("upload start: {filename}");
        self.sink.begin(filename)?;
        self.phase = Phase::Receiving;
        self.filename = Some(filename.to_string());
        self.total_bytes = 0;
        Ok(())
    }

    pub fn write(&mut self, chunk: &[u8]) -> Result<(), UploadError> {
        if self.phase != Phase::Receiving {
            return Err(self.out_of_order(UploadStatus::Write));
        }
        if let Err(err) = self.sink.write(chunk) {
            self.abort();
            return Err(err);
        }
        self.total_bytes = self.total_bytes.saturating_add(chunk.len() as u64);
        Ok(())
    }

    pub fn end(&mut self) -> Result<S::Output, UploadError> {
        if self.phase != Phase::Receiving {
            return Err(self.out_of_order(UploadStatus::End));
        }
        match self.sink.finish(self.total_bytes) {
            Ok(output) => {
                self.phase = Phase::Done;
                log::info!(
                    "upload success: {} ({} bytes)",
                    self.filename.as_deref().unwrap_or_default(),
                    self.total_bytes
                );
                Ok(output)
            }
            Err(err) => {
                self.abort();
                Err(err)
            }
        }
    }

    pub fn abort(&mut self) {
        if self.phase == Phase::Receiving {
            log::warn!(
                "upload aborted: {} after {} bytes",
                self.filename.as_deref().unwrap_or_default(),
                self.total_bytes
            );
            self.sink.abort();
        }
        self.phase = Phase::Idle;
        self.filename = None;
        self.total_bytes = 0;
    }

    /// Dispatches one framework-level upload callback.
    pub fn handle(
        &mut self,
        status: UploadStatus,
        filename: &str,
        chunk: &[u8],
    ) -> Result<Option<S::Output>, UploadError> {
        match status {
            UploadStatus::Start => self.start(filename).map(|_| None),
            UploadStatus::Write => self.write(chunk).map(|_| None),
            UploadStatus::End => self.end().map(Some),
            UploadStatus::Aborted => {
                self.abort();
                Err(UploadError::Aborted)
            }
        }
    }

    pub fn is_receiving(&self) -> bool {
        self.phase == Phase::Receiving
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    fn out_of_order(&self, event: UploadStatus) -> UploadError {
        UploadError::OutOfOrder {
            event,
            state: self.phase.as_str(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub path: String,
    pub size: u64,
}

/// Writes uploads into the flash filesystem.
#[derive(Debug)]
pub struct FileUploadSink {
    store: FlashStore,
    current: Option<(String, File)>,
}

impl FileUploadSink {
    pub fn new(store: FlashStore) -> Self {
        Self {
            store,
            current: None,
        }
    }
}

impl UploadSink for FileUploadSink {
    type Output = StoredFile;

    fn begin(&mut self, filename: &str) -> Result<(), UploadError> {
        let path = normalize_path(filename)?;
        if !is_valid_upload_extension(&path) {
            return Err(StorageError::InvalidExtension(path).into());
        }
        self.current = Some(self.store.create(&path)?);
        Ok(())
    }

    fn write(&mut self, chunk: &[u8]) -> Result<(), UploadError> {
        let Some((_, file)) = self.current.as_mut() else {
            return Err(UploadError::Sink("no open upload file".to_string()));
        };
        file.write_all(chunk).map_err(StorageError::from)?;
        Ok(())
    }

    fn finish(&mut self, total_bytes: u64) -> Result<StoredFile, UploadError> {
        let Some((path, mut file)) = self.current.take() else {
            return Err(UploadError::Sink("no open upload file".to_string()));
        };
        file.flush().map_err(StorageError::from)?;
        Ok(StoredFile {
            path,
            size: total_bytes,
        })
    }

    fn abort(&mut self) {
        if let Some((path, file)) = self.current.take() {
            drop(file);
            if let Err(err) = self.store.remove(&path) {
                log::warn!("failed to remove partial upload {path}: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::storage::tests::temp_store;

    #[test]
    fn stores_chunks_in_order() {
        let store = temp_store("upload-ok");
        let mut session = UploadSession::new(FileUploadSink::new(store.clone()));

        session.start("index.html").unwrap();
        session.write(b"<h1>").unwrap();
        session.write(b"hi</h1>").unwrap();
        let stored = session.end().unwrap();

        assert_eq!(
            stored,
            StoredFile {
                path: "/index.html".to_string(),
                size: 11,
            }
        );
        assert_eq!(store.read("/index.html").unwrap(), b"<h1>hi</h1>");
    }

    #[test]
    fn abort_removes_partial_file() {
        let store = temp_store("upload-abort");
        let mut session = UploadSession::new(FileUploadSink::new(store.clone()));

        session
            .handle(UploadStatus::Start, "/data.json", &[])
            .unwrap();
        session.handle(UploadStatus::Write, "", b"{\"a\":").unwrap();
        assert!(matches!(
            session.handle(UploadStatus::Aborted, "", &[]),
            Err(UploadError::Aborted)
        ));

        assert!(!store.exists("/data.json"));
        assert!(!session.is_receiving());
    }

    #[test]
    fn rejects_events_out_of_order() {
        let store = temp_store("upload-order");
        let mut session = UploadSession::new(FileUploadSink::new(store));

        assert!(matches!(
            session.write(b"x"),
            Err(UploadError::OutOfOrder {
                event: UploadStatus::Write,
                ..
            })
        ));
        session.start("a.txt").unwrap();
        assert!(session.start("b.txt").is_err());
        session.end().unwrap();
        assert!(matches!(
            session.end(),
            Err(UploadError::OutOfOrder { state: "done", .. })
        ));
    }

    #[test]
    fn rejects_disallowed_extension_at_start() {
        let store = temp_store("upload-ext");
        let mut session = UploadSession::new(FileUploadSink::new(store.clone()));

        assert!(matches!(
            session.start("run.sh"),
            Err(UploadError::Storage(StorageError::InvalidExtension(_)))
        ));
        assert!(!session.is_receiving());
        assert!(store.list().unwrap().is_empty());
    }
}
