// SPDX-FileCopyrightText: © 2024 Hugues Bruant <hugues.bruant@gmail.com>

use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use crate::parser::ImportRecord;
use crate::pyenv::PyEnv;
use crate::resolver::{DirListing, ResolveKey, Resolution};

/// Caches created at trace start, or supplied by the caller to outlive a
/// single trace. The orchestrator and resolver write through whichever
/// container they are handed; a reused container skips re-reading,
/// re-parsing, re-resolving and re-probing across traces.
#[derive(Default)]
pub struct TraceCache {
    /// file content by absolute path
    pub(crate) contents: DashMap<PathBuf, Arc<String>>,
    /// parsed import records by absolute path
    pub(crate) parsed: DashMap<PathBuf, Arc<Vec<ImportRecord>>>,
    /// resolution memo keyed on (module, level, importing directory) —
    /// directory rather than file, so co-located sources share entries
    pub(crate) resolved: DashMap<ResolveKey, Resolution>,
    /// one readdir per directory per container lifetime; None caches a
    /// missing or unreadable directory
    pub(crate) dir_listings: DashMap<PathBuf, Option<Arc<DirListing>>>,
    /// runtime snapshot (search roots, stdlib names, interpreter)
    pub(crate) env: OnceLock<Arc<PyEnv>>,
}

impl TraceCache {
    pub fn new() -> TraceCache {
        TraceCache::default()
    }

    /// Probed runtime snapshot, if one has been taken through this cache.
    pub fn env_snapshot(&self) -> Option<Arc<PyEnv>> {
        self.env.get().cloned()
    }
}
