//! Append-only JSONL output for samples and events.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write as _};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::error::{AppError, Result};
use crate::types::{Event, MetricSample};

/// A record accepted by a [`LogSink`].
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(untagged)]
pub enum LogRecord<'a> {
    Sample(&'a MetricSample),
    Event(&'a Event),
}

/// Accepts one record at a time, in the order produced.
pub trait LogSink: Send + Sync {
    fn append(&self, record: &LogRecord<'_>) -> Result<()>;
}

/// Opens a fresh sink each time a monitor starts.
pub type SinkFactory = Arc<dyn Fn() -> Result<Arc<dyn LogSink>> + Send + Sync>;

/// One JSON object per line, flushed after every record.
pub struct JsonlSink {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JsonlSink {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| AppError::io(format!("Failed to create {}: {}", parent.display(), e)))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| AppError::io(format!("Failed to open {}: {}", path.display(), e)))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(BufWriter::new(file)),
        })
    }
}

impl LogSink for JsonlSink {
    fn append(&self, record: &LogRecord<'_>) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        writer
            .write_all(&line)
            .and_then(|()| writer.flush())
            .map_err(|e| AppError::sink_write_failed(format!("{}: {}", self.path.display(), e)))
    }
}

/// Factory that reopens the same file in append mode.
pub fn jsonl_file(path: PathBuf) -> SinkFactory {
    Arc::new(move || {
        let sink: Arc<dyn LogSink> = Arc::new(JsonlSink::open(&path)?);
        Ok(sink)
    })
}

/// Factory that creates `<prefix>_<YYYYMMDD_HHMMSS>.jsonl` inside `dir` on every call.
pub fn jsonl_in_dir(dir: PathBuf, prefix: impl Into<String>) -> SinkFactory {
    let prefix = prefix.into();
    Arc::new(move || {
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let path = dir.join(format!("{}_{}.jsonl", prefix, stamp));
        let sink: Arc<dyn LogSink> = Arc::new(JsonlSink::open(&path)?);
        Ok(sink)
    })
}

/// Best-effort write: failures are logged and swallowed.
pub(crate) fn append_or_warn(sink: Option<&Arc<dyn LogSink>>, record: &LogRecord<'_>) {
    if let Some(sink) = sink {
        if let Err(e) = sink.append(record) {
            log::warn!("Log sink write failed: {}", e);
        }
    }
}
