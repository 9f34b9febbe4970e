use std::{
    fs::File,
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};

use serde::Serialize;
use thiserror::Error;

/// SPIFFS object names are limited to 32 bytes including the terminator.
pub const MAX_PATH_LEN: usize = 31;
pub const INDEX_PATH: &str = "/index.html";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid file name `{0}`")]
    InvalidName(String),
    #[error("file type not allowed: `{0}`")]
    InvalidExtension(String),
    #[error("file `{0}` not found")]
    NotFound(String),
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("stored value is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("storage backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
}

/// Flat flash filesystem rooted at a directory. File paths are `/<name>`.
#[derive(Debug, Clone)]
pub struct FlashStore {
    root: PathBuf,
}

impl FlashStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates the root directory if it is missing.
    pub fn mount(&self) -> Result<(), StorageError> {
        std::fs::create_dir_all(&self.root)?;
        Ok(())
    }

    fn resolve(&self, name: &str) -> Result<(String, PathBuf), StorageError> {
        let path = normalize_path(name)?;
        let local = self.root.join(&path[1..]);
        Ok((path, local))
    }

    pub fn list(&self) -> Result<Vec<FileEntry>, StorageError> {
        let mut entries = Vec::new();
        let dir = match std::fs::read_dir(&self.root) {
            Ok(dir) => dir,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(entries),
            Err(err) => return Err(err.into()),
        };

        for entry in dir {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            entries.push(FileEntry {
                name: format!("/{name}"),
                size: metadata.len(),
            });
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.resolve(name)
            .map(|(_, local)| local.is_file())
            .unwrap_or(false)
    }

    pub fn size(&self, name: &str) -> Result<u64, StorageError> {
        let (path, local) = self.resolve(name)?;
        match std::fs::metadata(local) {
            Ok(metadata) if metadata.is_file() => Ok(metadata.len()),
            Ok(_) => Err(StorageError::NotFound(path)),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(StorageError::NotFound(path)),
            Err(err) => Err(err.into()),
        }
    }

    pub fn read(&self, name: &str) -> Result<Vec<u8>, StorageError> {
        let (path, local) = self.resolve(name)?;
        match std::fs::read(local) {
            Ok(data) => Ok(data),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(StorageError::NotFound(path)),
            Err(err) => Err(err.into()),
        }
    }

    pub fn open(&self, name: &str) -> Result<File, StorageError> {
        let (path, local) = self.resolve(name)?;
        match File::open(local) {
            Ok(file) => Ok(file),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(StorageError::NotFound(path)),
            Err(err) => Err(err.into()),
        }
    }

    pub fn create(&self, name: &str) -> Result<(String, File), StorageError> {
        let (path, local) = self.resolve(name)?;
        self.mount()?;
        Ok((path, File::create(local)?))
    }

    pub fn write(&self, name: &str, data: &[u8]) -> Result<(), StorageError> {
        let (_, mut file) = self.create(name)?;
        file.write_all(data)?;
        file.flush()?;
        Ok(())
    }

    pub fn remove(&self, name: &str) -> Result<(), StorageError> {
        let (path, local) = self.resolve(name)?;
        match std::fs::remove_file(local) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(StorageError::NotFound(path)),
            Err(err) => Err(err.into()),
        }
    }

    /// Writes bundled default assets that are not already present.
    pub fn seed_missing(&self, assets: &[(&str, &str)]) -> Result<usize, StorageError> {
        let mut written = 0;
        for (name, contents) in assets {
            if !self.exists(name) {
                self.write(name, contents.as_bytes())?;
                log::info!("seeded default asset {name} ({} bytes)", contents.len());
                written += 1;
            }
        }
        Ok(written)
    }

    /// Logs the file inventory and whether the index page is servable.
    pub fn log_inventory(&self) -> bool {
        match self.list() {
            Ok(files) => {
                log::info!("files in flash storage:");
                for file in &files {
                    log::info!("- File: {}, Size: {} bytes", file.name, file.size);
                }
            }
            Err(err) => log::warn!("failed to list flash storage: {err}"),
        }

        match self.size(INDEX_PATH) {
            Ok(0) => {
                log::warn!("index.html exists but is empty");
                false
            }
            Ok(size) => {
                log::info!("index.html found, size: {size} bytes");
                true
            }
            Err(_) => {
                log::warn!("index.html not found in flash storage");
                false
            }
        }
    }
}

pub fn normalize_path(name: &str) -> Result<String, StorageError> {
    let trimmed = name.trim();
    let bare = trimmed.strip_prefix('/').unwrap_or(trimmed);

    if bare.is_empty()
        || bare == "."
        || bare.contains("..")
        || bare.contains('/')
        || bare.contains('\\')
        || bare.chars().any(char::is_control)
    {
        return Err(StorageError::InvalidName(name.to_string()));
    }

    let path = format!("/{bare}");
    if path.len() > MAX_PATH_LEN {
        return Err(StorageError::InvalidName(name.to_string()));
    }
    Ok(path)
}

fn extension(path: &str) -> Option<String> {
    let (_, ext) = path.rsplit_once('.')?;
    Some(ext.to_ascii_lowercase())
}

pub fn content_type(path: &str) -> &'static str {
    match extension(path).as_deref() {
        Some("html" | "htm") => "text/html",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("ico") => "image/x-icon",
        Some("svg") => "image/svg+xml",
        Some("bin") => "application/octet-stream",
        Some("gz") => "application/x-gzip",
        _ => "text/plain",
    }
}

pub fn is_valid_upload_extension(path: &str) -> bool {
    matches!(
        extension(path).as_deref(),
        Some(
            "html" | "htm" | "css" | "js" | "json" | "txt" | "png" | "jpg" | "jpeg" | "gif"
                | "ico" | "svg" | "bin" | "gz"
        )
    )
}

pub fn is_firmware_image(path: &str) -> bool {
    extension(path).as_deref() == Some("bin")
}
