//! # Piece Storage
//!
//! This module persists downloaded piece bytes. The engine talks to storage
//! through the [`Storage`] trait so tests can capture writes in memory; the
//! production implementation writes positioned ranges into files on disk,
//! creating intermediate directories as needed.

use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use thiserror::Error;

/// Errors produced while persisting piece bytes.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("could not create directory `{path}`")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("could not write `{path}`")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Byte-range writer used by the engine to persist subpieces.
pub trait Storage: Send + Sync {
    /// Write `bytes` into the file at `path`, starting at `offset`.
    ///
    /// Intermediate directories are created; the file grows as needed.
    fn write_bytes(&self, path: &Path, bytes: &[u8], offset: u64) -> Result<(), StorageError>;
}

/// Storage backed by the local filesystem.
pub struct DiskStorage;

impl Storage for DiskStorage {
    fn write_bytes(&self, path: &Path, bytes: &[u8], offset: u64) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|source| StorageError::CreateDir {
                    path: parent.display().to_string(),
                    source,
                })?;
            }
        }

        let write = |source| StorageError::Write {
            path: path.display().to_string(),
            source,
        };

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(write)?;
        file.seek(SeekFrom::Start(offset)).map_err(write)?;
        file.write_all(bytes).map_err(write)?;

        Ok(())
    }
}
