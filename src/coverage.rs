//! JaCoCo line coverage and its attribution to catalog functions.
//!
//! A report is `package > sourcefile > line` with `nr` (line number) and
//! `ci` (covered instructions). Covered lines whose source text starts with
//! the logging prefix become [`CoverageRecord`]s, which are then matched to
//! catalog functions by path suffix and line containment.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::catalog::Catalog;
use crate::config::{CoverageConfig, PathMapping};
use crate::error::{EvalError, Result};
use crate::store;
use crate::types::{CoverageRecord, CoveredFunction};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFileCoverage {
    pub package: String,
    pub name: String,
    /// `(nr, ci)` pairs in report order
    pub lines: Vec<(u32, u32)>,
}

impl SourceFileCoverage {
    /// Path of the source relative to the main source root
    pub fn relative_path(&self) -> PathBuf {
        Path::new(&self.package).join(&self.name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoverageReport {
    pub files: Vec<SourceFileCoverage>,
}

fn attr(path: &Path, element: &BytesStart<'_>, name: &str) -> Result<Option<String>> {
    let malformed = |reason: String| EvalError::CoverageReport {
        path: path.to_path_buf(),
        reason,
    };
    match element.try_get_attribute(name) {
        Ok(Some(value)) => value
            .unescape_value()
            .map(|v| Some(v.into_owned()))
            .map_err(|e| malformed(e.to_string())),
        Ok(None) => Ok(None),
        Err(e) => Err(malformed(e.to_string())),
    }
}

fn numeric_attr(path: &Path, element: &BytesStart<'_>, name: &str) -> Result<u32> {
    let raw = attr(path, element, name)?.ok_or_else(|| EvalError::CoverageReport {
        path: path.to_path_buf(),
        reason: format!("line without `{}`", name),
    })?;
    raw.trim().parse().map_err(|_| EvalError::CoverageReport {
        path: path.to_path_buf(),
        reason: format!("non-numeric `{}`: {}", name, raw),
    })
}

impl CoverageReport {
    pub fn load(path: &Path) -> Result<Self> {
        let xml = std::fs::read_to_string(path)
            .map_err(|e| EvalError::io(format!("reading {}", path.display()), e))?;
        Self::parse(path, &xml)
    }

    /// `path` is only used in error messages
    pub fn parse(path: &Path, xml: &str) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        let mut report = CoverageReport::default();
        let mut package: Option<String> = None;
        let mut current: Option<SourceFileCoverage> = None;

        loop {
            let event = reader.read_event().map_err(|e| EvalError::CoverageReport {
                path: path.to_path_buf(),
                reason: format!("at byte {}: {}", reader.buffer_position(), e),
            })?;
            match event {
                Event::Start(ref e) | Event::Empty(ref e) => match e.name().as_ref() {
                    b"package" => {
                        package = Some(attr(path, e, "name")?.unwrap_or_default());
                    }
                    b"sourcefile" => {
                        let file = SourceFileCoverage {
                            package: package.clone().unwrap_or_default(),
                            name: attr(path, e, "name")?.unwrap_or_default(),
                            lines: Vec::new(),
                        };
                        if matches!(event, Event::Empty(_)) {
                            report.files.push(file);
                        } else {
                            current = Some(file);
                        }
                    }
                    b"line" => {
                        if let Some(file) = current.as_mut() {
                            let nr = numeric_attr(path, e, "nr")?;
                            let ci = numeric_attr(path, e, "ci")?;
                            file.lines.push((nr, ci));
                        }
                    }
                    _ => {}
                },
                Event::End(ref e) => match e.name().as_ref() {
                    b"sourcefile" => {
                        if let Some(file) = current.take() {
                            report.files.push(file);
                        }
                    }
                    b"package" => package = None,
                    _ => {}
                },
                Event::Eof => break,
                _ => {}
            }
        }

        if current.is_some() {
            return Err(EvalError::CoverageReport {
                path: path.to_path_buf(),
                reason: "unterminated sourcefile".to_string(),
            });
        }
        Ok(report)
    }
}

pub struct CoverageMapper {
    log_prefix: String,
}

impl CoverageMapper {
    pub fn new(config: &CoverageConfig) -> Self {
        Self {
            log_prefix: config.log_prefix.to_lowercase(),
        }
    }

    pub fn is_log_line(&self, line: &str) -> bool {
        line.trim().to_lowercase().starts_with(&self.log_prefix)
    }

    /// Covered logging lines, one record per (file, line)
    pub fn covered_log_lines(&self, report: &CoverageReport, base_dir: &Path) -> Vec<CoverageRecord> {
        let mut sources: HashMap<PathBuf, Option<Vec<String>>> = HashMap::new();
        let mut seen = HashSet::new();
        let mut records = Vec::new();

        for file in &report.files {
            let position = base_dir.join(file.relative_path());
            for &(nr, ci) in &file.lines {
                if ci == 0 || nr == 0 || !seen.insert((position.clone(), nr)) {
                    continue;
                }
                let lines = sources.entry(position.clone()).or_insert_with(|| {
                    match std::fs::read_to_string(&position) {
                        Ok(content) => Some(content.lines().map(str::to_string).collect()),
                        Err(e) => {
                            log::debug!("Cannot read {}: {}", position.display(), e);
                            None
                        }
                    }
                });
                let Some(text) = lines.as_ref().and_then(|l| l.get(nr as usize - 1)) else {
                    continue;
                };
                if self.is_log_line(text) {
                    records.push(CoverageRecord {
                        line_number: nr,
                        log_line: text.trim().to_string(),
                        position: position.clone(),
                    });
                }
            }
        }
        records
    }

    /// Group records under every catalog function that contains them.
    /// Entries keep first-seen order and each log line appears once per entry.
    pub fn attribute(
        &self,
        records: &[CoverageRecord],
        catalog: &Catalog,
        mapping: &PathMapping,
    ) -> Vec<CoveredFunction> {
        let mut index: HashMap<(String, String), usize> = HashMap::new();
        let mut covered: Vec<CoveredFunction> = Vec::new();

        for record in records {
            let position = record.position.to_string_lossy();
            for desc in catalog.matching_suffix(mapping, &position, record.line_number) {
                let slot = *index.entry(desc.key()).or_insert_with(|| {
                    covered.push(CoveredFunction {
                        descriptor: desc.clone(),
                        covered_log: Vec::new(),
                    });
                    covered.len() - 1
                });
                let entry = &mut covered[slot];
                if !entry.covered_log.contains(&record.log_line) {
                    entry.covered_log.push(record.log_line.clone());
                }
            }
        }
        covered
    }

    /// Parse `report_path` and attribute its covered logging lines
    pub fn map(
        &self,
        report_path: &Path,
        base_dir: &Path,
        catalog: &Catalog,
        mapping: &PathMapping,
    ) -> Result<Vec<CoveredFunction>> {
        let report = CoverageReport::load(report_path)?;
        let records = self.covered_log_lines(&report, base_dir);
        let covered = self.attribute(&records, catalog, mapping);
        log::info!(
            "Covered log lines: {}, covered functions: {}",
            records.len(),
            covered.len()
        );
        Ok(covered)
    }

    /// Write entries to `path`; nothing is written for an empty list.
    /// Returns whether the file was written.
    pub fn write_covered(path: &Path, entries: &[CoveredFunction]) -> Result<bool> {
        if entries.is_empty() {
            return Ok(false);
        }
        store::write_json_atomic(path, entries)?;
        Ok(true)
    }
}
