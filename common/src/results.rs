// SPDX-FileCopyrightText: © 2024 Hugues Bruant <hugues.bruant@gmail.com>

use dashmap::DashMap;
use log::warn;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use ustr::Ustr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonKind {
    Entry,
    PlainImport,
    FromImport,
    RelativeImport,
    DynamicImport,
    NamespaceMarker,
}

/// Why a file is in the result. Created on first discovery; later
/// discoveries only accumulate parents (and the package-initializer flag).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reason {
    pub kind: ReasonKind,
    pub parents: BTreeSet<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module_name: Option<String>,
    pub ignored: bool,
    pub package_init: bool,
}

#[derive(Debug, Default, PartialEq, Eq, Serialize)]
pub struct TraceResult {
    /// closed set of required files (ignored files excluded)
    pub files: BTreeSet<PathBuf>,
    /// reason per discovered file, ignored ones included and flagged
    pub reasons: BTreeMap<PathBuf, Reason>,
    pub warnings: Vec<String>,
    pub unresolved: BTreeMap<String, BTreeSet<PathBuf>>,
}

/// Concurrent collector behind the orchestrator. First writer creates a
/// file's reason, later writers union parents; the result is frozen by
/// `finalize`.
#[derive(Default)]
pub(crate) struct ResultCollector {
    reasons: DashMap<PathBuf, Reason>,
    warnings: Mutex<Vec<String>>,
    unresolved: DashMap<Ustr, BTreeSet<PathBuf>>,
}

impl ResultCollector {
    pub(crate) fn record(
        &self,
        path: &Path,
        kind: ReasonKind,
        parent: Option<&Path>,
        module_name: Option<&str>,
        package_init: bool,
    ) {
        match self.reasons.entry(path.to_path_buf()) {
            dashmap::Entry::Occupied(mut e) => {
                let reason = e.get_mut();
                if let Some(parent) = parent {
                    reason.parents.insert(parent.to_path_buf());
                }
                reason.package_init |= package_init;
                if reason.module_name.is_none() {
                    reason.module_name = module_name.map(str::to_string);
                }
            }
            dashmap::Entry::Vacant(e) => {
                let mut parents = BTreeSet::new();
                if let Some(parent) = parent {
                    parents.insert(parent.to_path_buf());
                }
                e.insert(Reason {
                    kind,
                    parents,
                    module_name: module_name.map(str::to_string),
                    ignored: false,
                    package_init,
                });
            }
        }
    }

    pub(crate) fn set_ignored(&self, path: &Path) {
        if let Some(mut reason) = self.reasons.get_mut(path) {
            reason.ignored = true;
        }
    }

    pub(crate) fn warn(&self, message: String) {
        warn!("{}", message);
        self.warnings.lock().unwrap().push(message);
    }

    pub(crate) fn add_unresolved(&self, module: Ustr, importer: &Path) {
        self.unresolved
            .entry(module)
            .or_default()
            .insert(importer.to_path_buf());
    }

    pub(crate) fn finalize(&self) -> TraceResult {
        let mut result = TraceResult {
            warnings: std::mem::take(&mut *self.warnings.lock().unwrap()),
            ..TraceResult::default()
        };
        for entry in self.reasons.iter() {
            if !entry.value().ignored {
                result.files.insert(entry.key().clone());
            }
            result.reasons.insert(entry.key().clone(), entry.value().clone());
        }
        for entry in self.unresolved.iter() {
            result
                .unresolved
                .insert(entry.key().to_string(), entry.value().clone());
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ustr::ustr;

    #[test]
    fn first_writer_creates_later_writers_union() {
        let collector = ResultCollector::default();
        let target = Path::new("/p/utils.py");
        collector.record(
            target,
            ReasonKind::PlainImport,
            Some(Path::new("/p/a.py")),
            Some("utils"),
            false,
        );
        collector.record(
            target,
            ReasonKind::FromImport,
            Some(Path::new("/p/b.py")),
            Some("utils"),
            false,
        );
        let result = collector.finalize();
        let reason = &result.reasons[target];
        // kind is fixed at first discovery
        assert_eq!(reason.kind, ReasonKind::PlainImport);
        assert_eq!(reason.parents.len(), 2);
        assert_eq!(reason.module_name.as_deref(), Some("utils"));
    }

    #[test]
    fn entry_kind_survives_rediscovery() {
        let collector = ResultCollector::default();
        let entry = Path::new("/p/main.py");
        collector.record(entry, ReasonKind::Entry, None, None, false);
        // an entry reached by import keeps its kind, parents accumulate
        collector.record(
            entry,
            ReasonKind::PlainImport,
            Some(Path::new("/p/other.py")),
            Some("main"),
            false,
        );
        let result = collector.finalize();
        let reason = &result.reasons[entry];
        assert_eq!(reason.kind, ReasonKind::Entry);
        assert_eq!(reason.parents.len(), 1);
    }

    #[test]
    fn ignored_files_leave_the_file_set() {
        let collector = ResultCollector::default();
        let path = Path::new("/p/helpers.py");
        collector.record(
            path,
            ReasonKind::FromImport,
            Some(Path::new("/p/main.py")),
            Some("helpers"),
            false,
        );
        collector.set_ignored(path);
        let result = collector.finalize();
        assert!(!result.files.contains(path));
        assert!(result.reasons[path].ignored);
    }

    #[test]
    fn package_init_flag_accumulates() {
        let collector = ResultCollector::default();
        let init = Path::new("/p/pkg/__init__.py");
        collector.record(
            init,
            ReasonKind::FromImport,
            Some(Path::new("/p/main.py")),
            Some("pkg"),
            false,
        );
        collector.record(
            init,
            ReasonKind::PlainImport,
            Some(Path::new("/p/tool.py")),
            Some("pkg"),
            true,
        );
        let result = collector.finalize();
        assert!(result.reasons[init].package_init);
    }

    #[test]
    fn unresolved_importers_accumulate() {
        let collector = ResultCollector::default();
        collector.add_unresolved(ustr("missing"), Path::new("/p/a.py"));
        collector.add_unresolved(ustr("missing"), Path::new("/p/b.py"));
        collector.add_unresolved(ustr("missing"), Path::new("/p/a.py"));
        let result = collector.finalize();
        assert_eq!(result.unresolved["missing"].len(), 2);
    }
}
