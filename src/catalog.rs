//! Descriptor catalog of known logging-related functions.
//!
//! Loaded once per run. Descriptors are read-only apart from the compile
//! error counter, which only grows.

use std::path::Path;

use crate::config::PathMapping;
use crate::error::{EvalError, Result};
use crate::types::FunctionDescriptor;

#[derive(Debug, Clone, Default)]
pub struct Catalog {
    descriptors: Vec<FunctionDescriptor>,
}

impl Catalog {
    pub fn new(descriptors: Vec<FunctionDescriptor>) -> Self {
        Self { descriptors }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| EvalError::io(format!("reading catalog {}", path.display()), e))?;
        let descriptors: Vec<FunctionDescriptor> = serde_json::from_str(&content)
            .map_err(|e| EvalError::json(path.display().to_string(), e))?;
        log::info!("Loaded {} function descriptors from {}", descriptors.len(), path.display());
        Ok(Self { descriptors })
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn descriptors(&self) -> &[FunctionDescriptor] {
        &self.descriptors
    }

    /// Descriptor whose file is `local_file` (after mapping) and whose
    /// post-patch span contains `line`
    pub fn find_for_error_mut(
        &mut self,
        mapping: &PathMapping,
        local_file: &str,
        line: u32,
    ) -> Option<&mut FunctionDescriptor> {
        let catalog_file = mapping.to_catalog(local_file);
        self.descriptors.iter_mut().find(|d| {
            (d.function_position == catalog_file
                || mapping.to_local(&d.function_position) == Path::new(local_file))
                && d.attribution_range().contains(line)
        })
    }

    /// Descriptors whose span contains `line` and whose root-relative
    /// position is a suffix of `file`
    pub fn matching_suffix<'a>(
        &'a self,
        mapping: &'a PathMapping,
        file: &'a str,
        line: u32,
    ) -> impl Iterator<Item = &'a FunctionDescriptor> + 'a {
        self.descriptors.iter().filter(move |d| {
            let relative = mapping.relative(&d.function_position);
            !relative.is_empty() && file.ends_with(relative) && d.function_lines.contains(line)
        })
    }

    /// Descriptors that have been implicated by at least one compile error,
    /// most errors first
    pub fn ranked_errors(&self) -> Vec<&FunctionDescriptor> {
        let mut ranked: Vec<&FunctionDescriptor> =
            self.descriptors.iter().filter(|d| d.error_count() > 0).collect();
        ranked.sort_by(|a, b| b.error_count().cmp(&a.error_count()));
        ranked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PathRule;
    use crate::types::LineRange;

    fn catalog() -> Catalog {
        Catalog::new(vec![
            FunctionDescriptor::new(
                "start",
                "/cat/common/src/main/java/org/a/Server.java",
                LineRange::new(10, 40).unwrap(),
            ),
            FunctionDescriptor::new(
                "stop",
                "/cat/common/src/main/java/org/a/Server.java",
                LineRange::new(41, 60).unwrap(),
            ),
        ])
    }

    fn mapping() -> PathMapping {
        PathMapping::new(vec![PathRule {
            catalog: "/cat/".into(),
            local: "/work/hadoop/".into(),
        }])
    }

    #[test]
    fn test_find_for_error_uses_mapping() {
        let mut catalog = catalog();
        let mapping = mapping();
        let found = catalog
            .find_for_error_mut(&mapping, "/work/hadoop/common/src/main/java/org/a/Server.java", 45)
            .map(|d| d.function_name.clone());
        assert_eq!(found.as_deref(), Some("stop"));

        assert!(catalog
            .find_for_error_mut(&mapping, "/work/hadoop/common/src/main/java/org/a/Other.java", 45)
            .is_none());
        assert!(catalog
            .find_for_error_mut(&mapping, "/work/hadoop/common/src/main/java/org/a/Server.java", 99)
            .is_none());
    }

    #[test]
    fn test_matching_suffix() {
        let catalog = catalog();
        let mapping = mapping();
        let names: Vec<_> = catalog
            .matching_suffix(&mapping, "/tmp/x/common/src/main/java/org/a/Server.java", 12)
            .map(|d| d.function_name.as_str())
            .collect();
        assert_eq!(names, vec!["start"]);
    }

    #[test]
    fn test_ranked_errors() {
        let mut catalog = catalog();
        catalog.descriptors[1].record_compile_error();
        catalog.descriptors[1].record_compile_error();
        catalog.descriptors[0].record_compile_error();

        let ranked: Vec<_> = catalog.ranked_errors().iter().map(|d| d.function_name.clone()).collect();
        assert_eq!(ranked, vec!["stop", "start"]);
    }

    #[test]
    fn test_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        crate::store::write_json_atomic(&path, catalog().descriptors()).unwrap();

        let loaded = Catalog::load(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.descriptors()[0].function_name, "start");
    }
}
