//! Reversible source patching.
//!
//! A patch swaps the text of a function's line span for a candidate body.
//! Before the source file is touched, a [`ReplaceLogEntry`] is written to
//! the log directory; reversal works from that entry alone. Entries move
//! from `applied` to `reversed` exactly when the restored file has been
//! written, so anything still `applied` after a crash is an interrupted
//! trial that [`PatchEngine::recover`] puts back.

use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{EvalError, Result};
use crate::store;
use crate::types::{Candidate, PatchState, ReplaceItem, ReplaceLogEntry};

/// Result of a reversal request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReverseOutcome {
    /// File restored; `verified` is false when the restored bytes do not
    /// hash to the pre-patch content
    Restored { verified: bool },
    AlreadyReversed,
}

/// Entries put back by [`PatchEngine::recover`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Recovery {
    pub reversed: Vec<String>,
    pub mismatched: Vec<String>,
}

pub struct PatchEngine {
    log_dir: PathBuf,
}

fn content_hash(content: &str) -> String {
    blake3::hash(content.as_bytes()).to_hex().to_string()
}

/// Text of the 1-indexed inclusive span, joined the way it appears in the file
fn slice_lines(content: &str, start: u32, end: u32) -> Option<String> {
    let mut lines: Vec<&str> = content.split('\n').collect();
    if content.ends_with('\n') {
        lines.pop();
    }
    let (start, end) = (start as usize, end as usize);
    if start == 0 || end > lines.len() {
        return None;
    }
    Some(lines[start - 1..end].join("\n"))
}

impl PatchEngine {
    pub fn new(log_dir: impl Into<PathBuf>) -> Result<Self> {
        let log_dir = log_dir.into();
        fs::create_dir_all(&log_dir)
            .map_err(|e| EvalError::io(format!("creating {}", log_dir.display()), e))?;
        Ok(Self { log_dir })
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    fn log_path(&self, id: &str) -> PathBuf {
        self.log_dir.join(format!("{}.json", id))
    }

    /// Install `candidate.prediction` over its line span in `file`
    pub fn apply(&self, candidate: &Candidate, file: &Path) -> Result<ReplaceLogEntry> {
        let id = &candidate.uuid;
        let invalid = |reason: &str| EvalError::InvalidCandidate {
            id: id.clone(),
            reason: reason.to_string(),
        };

        if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
            return Err(invalid("id is not usable as a log name"));
        }
        if candidate.prediction.is_empty() {
            return Err(invalid("empty prediction"));
        }
        if self.log_path(id).exists() && self.state(id)? == Some(PatchState::Applied) {
            return Err(invalid("a patch for this id is already applied"));
        }

        let content = fs::read_to_string(file)
            .map_err(|e| EvalError::io(format!("reading {}", file.display()), e))?;

        let range = candidate.line_range;
        let target = slice_lines(&content, range.start, range.end).ok_or_else(|| {
            EvalError::InvalidLineRange(format!("{} outside {}", range, file.display()))
        })?;
        if target.is_empty() {
            return Err(invalid("target span is empty"));
        }

        let occurrences = content.matches(target.as_str()).count();
        if occurrences > 1 {
            return Err(EvalError::AmbiguousReplacement {
                path: file.to_path_buf(),
                occurrences,
            });
        }
        // reversal substitutes the prediction back, so it must be new text
        if candidate.prediction != target && content.contains(candidate.prediction.as_str()) {
            return Err(invalid("prediction already occurs in the original file"));
        }

        let patched = content.replacen(target.as_str(), &candidate.prediction, 1);
        let entry = ReplaceLogEntry {
            candidate: id.clone(),
            state: PatchState::Applied,
            file_path: file.to_path_buf(),
            replace_list: vec![ReplaceItem {
                target,
                replacement: candidate.prediction.clone(),
                lines: range,
            }],
            original_hash: content_hash(&content),
            applied_at: Utc::now(),
            reversed_at: None,
        };

        store::write_json_atomic(&self.log_path(id), &entry)?;
        if let Err(e) = store::write_atomic(file, patched.as_bytes()) {
            // source untouched, so the log must not claim otherwise
            let _ = fs::remove_file(self.log_path(id));
            return Err(e);
        }

        log::info!("Patched {} lines {} for {}", file.display(), range, id);
        Ok(entry)
    }

    fn load(&self, id: &str) -> Result<ReplaceLogEntry> {
        let path = self.log_path(id);
        if !path.exists() {
            return Err(EvalError::NoSuchLog { id: id.to_string() });
        }
        store::read_json(&path)
    }

    pub fn state(&self, id: &str) -> Result<Option<PatchState>> {
        match self.load(id) {
            Ok(entry) => Ok(Some(entry.state)),
            Err(EvalError::NoSuchLog { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Restore the file recorded for `id`. Repeated calls are no-ops.
    pub fn reverse(&self, id: &str) -> Result<ReverseOutcome> {
        let mut entry = self.load(id)?;
        if entry.state == PatchState::Reversed {
            let conflict = EvalError::ReversalConflict { id: id.to_string() };
            log::warn!("{}; nothing to do", conflict);
            return Ok(ReverseOutcome::AlreadyReversed);
        }

        let path = &entry.file_path;
        let mut content = fs::read_to_string(path)
            .map_err(|e| EvalError::io(format!("reading {}", path.display()), e))?;
        for item in entry.replace_list.iter().rev() {
            if item.replacement != item.target {
                content = content.replace(item.replacement.as_str(), &item.target);
            }
        }
        store::write_atomic(path, content.as_bytes())?;

        let verified = content_hash(&content) == entry.original_hash;
        if !verified {
            log::warn!(
                "Restored {} for {} but content differs from the pre-patch hash",
                path.display(),
                id
            );
        }

        entry.state = PatchState::Reversed;
        entry.reversed_at = Some(Utc::now());
        store::write_json_atomic(&self.log_path(id), &entry)?;

        log::info!("Reversed patch {} in {}", id, path.display());
        Ok(ReverseOutcome::Restored { verified })
    }

    /// Entries whose patch is still in the source tree, oldest first
    pub fn pending(&self) -> Result<Vec<ReplaceLogEntry>> {
        let dir = fs::read_dir(&self.log_dir)
            .map_err(|e| EvalError::io(format!("listing {}", self.log_dir.display()), e))?;

        let mut pending = Vec::new();
        for item in dir {
            let item = item.map_err(|e| EvalError::io(format!("listing {}", self.log_dir.display()), e))?;
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let entry: ReplaceLogEntry = store::read_json(&path)?;
            if entry.state == PatchState::Applied {
                pending.push(entry);
            }
        }
        pending.sort_by(|a, b| a.applied_at.cmp(&b.applied_at));
        Ok(pending)
    }

    /// Reverse every interrupted patch
    pub fn recover(&self) -> Result<Recovery> {
        let mut recovery = Recovery::default();
        for entry in self.pending()? {
            log::warn!("Recovering interrupted patch {}", entry.candidate);
            if let ReverseOutcome::Restored { verified } = self.reverse(&entry.candidate)? {
                if !verified {
                    recovery.mismatched.push(entry.candidate.clone());
                }
                recovery.reversed.push(entry.candidate);
            }
        }
        Ok(recovery)
    }
}
