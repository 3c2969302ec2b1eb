//! Artifact persistence
//!
//! Per-chunk results are written by the worker that produced them, as
//! `<prefix>chunk<index>.json`. Composite models go to a single path.

use crate::error::{PipelineError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::ffi::OsString;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Receives each chunk result as soon as it is produced
pub trait ResultSink<R>: Send + Sync {
    /// Persist `result` of chunk `index`, returning where it went
    fn persist(&self, index: usize, result: &R) -> Result<PathBuf>;
}

/// Writes each chunk result as JSON next to a path prefix
///
/// A prefix of `data/chunks/flowchron_split8_` yields
/// `data/chunks/flowchron_split8_chunk0.json`, `..._chunk1.json`, ...
#[derive(Debug, Clone)]
pub struct JsonChunkSink {
    prefix: PathBuf,
}

impl JsonChunkSink {
    pub fn new(prefix: impl Into<PathBuf>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn artifact_path(&self, index: usize) -> PathBuf {
        let mut name: OsString = self.prefix.clone().into_os_string();
        name.push(format!("chunk{}.json", index));
        PathBuf::from(name)
    }
}

impl<R: Serialize> ResultSink<R> for JsonChunkSink {
    fn persist(&self, index: usize, result: &R) -> Result<PathBuf> {
        let path = self.artifact_path(index);
        save_json(result, &path).map_err(|e| PipelineError::Persistence {
            index,
            path: path.clone(),
            message: e.to_string(),
        })?;
        Ok(path)
    }
}

/// Serialize `value` as JSON to `path`, creating parent directories
pub fn save_json<T: Serialize + ?Sized>(value: &T, path: &Path) -> flowchron_common::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer(&mut writer, value)?;
    writer.flush()?;
    Ok(())
}

/// Read a JSON artifact written by [`save_json`]
pub fn load_json<T: DeserializeOwned>(path: &Path) -> flowchron_common::Result<T> {
    let reader = BufReader::new(File::open(path).map_err(|e| {
        flowchron_common::Error::NotFound(format!("{}: {}", path.display(), e))
    })?);
    Ok(serde_json::from_reader(reader)?)
}
