// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-task execution log.
//!
//! Every task gets an `execution.log` in its task directory. The engine
//! writes its own lines for the task there, and the child unit's stdout and
//! stderr are pointed at the same file. At finalization the file is read
//! back, zlib-compressed and base64-encoded into the `logs` status field.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use base64::{Engine as _, engine::general_purpose};
use chrono::Utc;
use flate2::Compression;
use flate2::write::ZlibEncoder;

/// Shared handle to a task's log file.
///
/// Clones write to the same file. Lines are written whole under a lock so
/// engine lines and in-process unit lines do not interleave mid-line.
#[derive(Clone)]
pub struct TaskLog {
    path: PathBuf,
    file: Arc<Mutex<File>>,
}

impl TaskLog {
    /// Open (appending) the log file at `path`.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Arc::new(Mutex::new(file)),
        })
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one timestamped line.
    pub fn line(&self, level: &str, message: impl AsRef<str>) {
        let stamp = Utc::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let text = format!("{} [{}] {}\n", stamp, level, message.as_ref());
        // A poisoned lock only means another writer panicked mid-line
        let mut file = match self.file.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let _ = file.write_all(text.as_bytes());
    }

    /// A `Stdio` that appends to this log, for a child's stdout or stderr.
    pub fn stdio(&self) -> io::Result<Stdio> {
        let file = match self.file.lock() {
            Ok(guard) => guard.try_clone()?,
            Err(poisoned) => poisoned.into_inner().try_clone()?,
        };
        Ok(Stdio::from(file))
    }

    /// Flush and sync the file.
    pub fn flush(&self) -> io::Result<()> {
        let mut file = match self.file.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        file.flush()?;
        file.sync_data()
    }

    /// Flush, then read the whole log back as a compressed, encoded blob.
    pub async fn encoded(&self) -> io::Result<String> {
        self.flush()?;
        let raw = tokio::fs::read(&self.path).await?;
        encode_log(&raw)
    }
}

/// zlib-compress and base64-encode raw log bytes.
pub fn encode_log(raw: &[u8]) -> io::Result<String> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(raw)?;
    let compressed = encoder.finish()?;
    Ok(general_purpose::STANDARD.encode(compressed))
}

/// Reverse of [`encode_log`].
pub fn decode_log(encoded: &str) -> io::Result<Vec<u8>> {
    use flate2::read::ZlibDecoder;
    use std::io::Read;

    let compressed = general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let mut raw = Vec::new();
    ZlibDecoder::new(&compressed[..]).read_to_end(&mut raw)?;
    Ok(raw)
}
