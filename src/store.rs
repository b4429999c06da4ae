//! Durable result stores.
//!
//! All whole-file writes go through a temp file in the same directory that
//! is fsynced and then renamed over the target, so a crash leaves either the
//! old or the new content. The trial log is append-only JSONL, flushed per
//! record.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{EvalError, Result};
use crate::types::TrialResult;

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.tmp", name))
}

pub fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .map_err(|e| EvalError::io(format!("creating {}", parent.display()), e))?;
        }
    }
    Ok(())
}

/// Replace `path` with `bytes` atomically
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    ensure_parent(path)?;
    let tmp = temp_path(path);
    let ctx = |what: &str| format!("{} {}", what, tmp.display());

    let mut file = File::create(&tmp).map_err(|e| EvalError::io(ctx("creating"), e))?;
    file.write_all(bytes)
        .map_err(|e| EvalError::io(ctx("writing"), e))?;
    file.sync_all().map_err(|e| EvalError::io(ctx("syncing"), e))?;
    drop(file);

    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        EvalError::io(format!("renaming into {}", path.display()), e)
    })
}

pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let mut bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| EvalError::json(path.display().to_string(), e))?;
    bytes.push(b'\n');
    write_atomic(path, &bytes)
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path)
        .map_err(|e| EvalError::io(format!("reading {}", path.display()), e))?;
    serde_json::from_str(&content).map_err(|e| EvalError::json(path.display().to_string(), e))
}

pub async fn read_json_async<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| EvalError::io(format!("reading {}", path.display()), e))?;
    serde_json::from_str(&content).map_err(|e| EvalError::json(path.display().to_string(), e))
}

/// Append-only log of trial outcomes, one JSON object per line
pub struct TrialLog {
    path: PathBuf,
    file: File,
}

impl TrialLog {
    pub fn open(path: &Path) -> Result<Self> {
        ensure_parent(path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| EvalError::io(format!("opening {}", path.display()), e))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn append(&mut self, result: &TrialResult) -> Result<()> {
        let mut line = serde_json::to_vec(result)
            .map_err(|e| EvalError::json(self.path.display().to_string(), e))?;
        line.push(b'\n');
        self.file
            .write_all(&line)
            .and_then(|_| self.file.flush())
            .and_then(|_| self.file.sync_data())
            .map_err(|e| EvalError::io(format!("appending to {}", self.path.display()), e))
    }

    pub fn read_all(path: &Path) -> Result<Vec<TrialResult>> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(EvalError::io(format!("reading {}", path.display()), e)),
        };
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(|e| EvalError::json(path.display().to_string(), e)))
            .collect()
    }
}
