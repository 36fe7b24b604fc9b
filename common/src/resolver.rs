// SPDX-FileCopyrightText: © 2024 Hugues Bruant <hugues.bruant@gmail.com>

use log::debug;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use ustr::{ustr, Ustr};

use crate::cache::TraceCache;
use crate::fileio::{FileIo, FileKind};

pub(crate) type DirListing = HashMap<String, FileKind>;

/// Memo key: module name, relative level, importing directory. Keying on
/// the directory rather than the file lets co-located sources share hits.
pub(crate) type ResolveKey = (Ustr, u32, Ustr);

const INIT_FILE: &str = "__init__.py";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// plain module file
    File { path: PathBuf },
    /// directory with an initializer; `init_path` is the file to include
    RegularPackage { init_path: PathBuf, dir: PathBuf },
    /// initializer-less package directory; recorded, never recursed into
    NamespacePackage { dir: PathBuf },
    Unresolved,
}

impl Resolution {
    /// Directory to probe from-import names against, when the base is a
    /// package of either flavor.
    pub fn package_dir(&self) -> Option<&Path> {
        match self {
            Resolution::RegularPackage { dir, .. } => Some(dir),
            Resolution::NamespacePackage { dir } => Some(dir),
            _ => None,
        }
    }
}

/// Maps module names to on-disk artifacts following the runtime's
/// search-path and package-discovery rules. All filesystem knowledge flows
/// through a shared directory-listing cache: one readdir per directory per
/// trace, and member lookups are case-sensitive even on case-preserving
/// filesystems.
pub struct Resolver {
    /// absolute-import roots, in order: base, extra roots, site roots,
    /// stdlib root when stdlib inclusion is on
    roots: Vec<PathBuf>,
    include_stdlib: bool,
    stdlib_names: HashSet<String>,
    io: Arc<dyn FileIo>,
    cache: Arc<TraceCache>,
}

fn top_level(module: &str) -> &str {
    match module.find('.') {
        Some(idx) => &module[..idx],
        None => module,
    }
}

/// Directory a relative import starts from: the importing file's directory
/// climbed `level - 1` times. None when the climb walks off the filesystem
/// root.
pub fn relative_start_dir(importing_dir: &Path, level: u32) -> Option<PathBuf> {
    let mut start = importing_dir.to_path_buf();
    for _ in 1..level {
        if !start.pop() {
            return None;
        }
    }
    Some(start)
}

impl Resolver {
    pub fn new(
        roots: Vec<PathBuf>,
        include_stdlib: bool,
        stdlib_names: HashSet<String>,
        io: Arc<dyn FileIo>,
        cache: Arc<TraceCache>,
    ) -> Resolver {
        Resolver {
            roots,
            include_stdlib,
            stdlib_names,
            io,
            cache,
        }
    }

    /// A suppressed module resolves to nothing and is not reported as
    /// unresolved. Structurally disabled when the probe found no stdlib set.
    pub fn is_suppressed_stdlib(&self, module: &str, level: u32) -> bool {
        level == 0 && !self.include_stdlib && self.stdlib_names.contains(top_level(module))
    }

    pub fn resolve(&self, module: &str, level: u32, importing_file: Option<&Path>) -> Resolution {
        let importing_dir = importing_file.and_then(Path::parent);
        let dir_key = importing_dir
            .and_then(Path::to_str)
            .map(ustr)
            .unwrap_or_default();
        let key: ResolveKey = (ustr(module), level, dir_key);
        if let Some(hit) = self.cache.resolved.get(&key) {
            return hit.clone();
        }
        let resolution = self.resolve_uncached(module, level, importing_dir);
        debug!("resolve {}[{}] -> {:?}", module, level, resolution);
        self.cache.resolved.insert(key, resolution.clone());
        resolution
    }

    fn resolve_uncached(
        &self,
        module: &str,
        level: u32,
        importing_dir: Option<&Path>,
    ) -> Resolution {
        if level > 0 {
            let Some(dir) = importing_dir else {
                return Resolution::Unresolved;
            };
            let Some(start) = relative_start_dir(dir, level) else {
                return Resolution::Unresolved;
            };
            if module.is_empty() {
                return self.dir_resolution(&start);
            }
            let parts: Vec<&str> = module.split('.').collect();
            if parts.iter().any(|p| p.is_empty()) {
                return Resolution::Unresolved;
            }
            return self.walk_from(&start, &parts).unwrap_or(Resolution::Unresolved);
        }

        if module.is_empty() || self.is_suppressed_stdlib(module, level) {
            return Resolution::Unresolved;
        }
        let parts: Vec<&str> = module.split('.').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Resolution::Unresolved;
        }
        if let Some(dir) = importing_dir {
            if let Some(resolution) = self.walk_from(dir, &parts) {
                return resolution;
            }
        }
        for root in &self.roots {
            if let Some(resolution) = self.walk_from(root, &parts) {
                return resolution;
            }
        }
        Resolution::Unresolved
    }

    /// Probe a from-import name as a child module of an already-resolved
    /// package base. Misses are ordinary attributes, not errors.
    pub fn probe_submodule(&self, base: &Resolution, name: &str) -> Resolution {
        let Some(dir) = base.package_dir() else {
            return Resolution::Unresolved;
        };
        if name.is_empty() || name == "*" {
            return Resolution::Unresolved;
        }
        self.walk_from(dir, &[name]).unwrap_or(Resolution::Unresolved)
    }

    /// Whether `dir` is itself a regular package. Used to flag relative
    /// imports rooted outside any package.
    pub fn dir_is_package(&self, dir: &Path) -> bool {
        self.child_kind(dir, INIT_FILE) == Some(FileKind::File)
    }

    fn walk_from(&self, root: &Path, parts: &[&str]) -> Option<Resolution> {
        let mut dir = root.to_path_buf();
        let (last, intermediate) = parts.split_last()?;
        for part in intermediate {
            if self.child_kind(&dir, part) != Some(FileKind::Dir) {
                return None;
            }
            dir.push(part);
        }

        let as_file = format!("{}.py", last);
        if self.child_kind(&dir, &as_file) == Some(FileKind::File) {
            return Some(Resolution::File {
                path: dir.join(as_file),
            });
        }
        if self.child_kind(&dir, last) == Some(FileKind::Dir) {
            let sub = dir.join(last);
            match self.dir_resolution(&sub) {
                Resolution::Unresolved => return None,
                resolution => return Some(resolution),
            }
        }
        None
    }

    /// Resolve a directory by itself: initializer file wins, otherwise a
    /// non-empty directory counts as a namespace package.
    fn dir_resolution(&self, dir: &Path) -> Resolution {
        let Some(listing) = self.listing(dir) else {
            return Resolution::Unresolved;
        };
        if listing.get(INIT_FILE) == Some(&FileKind::File) {
            return Resolution::RegularPackage {
                init_path: dir.join(INIT_FILE),
                dir: dir.to_path_buf(),
            };
        }
        let has_member = listing
            .iter()
            .any(|(name, kind)| *kind == FileKind::Dir || name.ends_with(".py"));
        if has_member {
            Resolution::NamespacePackage {
                dir: dir.to_path_buf(),
            }
        } else {
            Resolution::Unresolved
        }
    }

    fn child_kind(&self, dir: &Path, name: &str) -> Option<FileKind> {
        self.listing(dir)?.get(name).copied()
    }

    fn listing(&self, dir: &Path) -> Option<Arc<DirListing>> {
        match self.cache.dir_listings.entry(dir.to_path_buf()) {
            dashmap::Entry::Occupied(e) => e.get().clone(),
            dashmap::Entry::Vacant(e) => {
                let listing = self
                    .io
                    .list_dir(dir)
                    .ok()
                    .map(|entries| Arc::new(entries.into_iter().collect::<DirListing>()));
                e.insert(listing.clone());
                listing
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fileio::OsFileIo;
    use std::fs;

    fn resolver_at(root: &Path) -> Resolver {
        Resolver::new(
            vec![root.to_path_buf()],
            false,
            HashSet::new(),
            Arc::new(OsFileIo::new(true)),
            Arc::new(TraceCache::new()),
        )
    }

    fn touch(path: PathBuf) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, "").unwrap();
    }

    #[test]
    fn plain_module_file() {
        let tmp = tempfile::tempdir().unwrap();
        touch(tmp.path().join("utils.py"));
        let resolver = resolver_at(tmp.path());
        assert_eq!(
            resolver.resolve("utils", 0, None),
            Resolution::File {
                path: tmp.path().join("utils.py")
            }
        );
        assert_eq!(resolver.resolve("missing", 0, None), Resolution::Unresolved);
    }

    #[test]
    fn dotted_walk_through_directories() {
        let tmp = tempfile::tempdir().unwrap();
        touch(tmp.path().join("a/b/c.py"));
        let resolver = resolver_at(tmp.path());
        assert_eq!(
            resolver.resolve("a.b.c", 0, None),
            Resolution::File {
                path: tmp.path().join("a/b/c.py")
            }
        );
        // intermediate component must be a directory
        assert_eq!(resolver.resolve("a.b.c.d", 0, None), Resolution::Unresolved);
    }

    #[test]
    fn module_file_beats_package_directory() {
        let tmp = tempfile::tempdir().unwrap();
        touch(tmp.path().join("thing.py"));
        touch(tmp.path().join("thing/__init__.py"));
        let resolver = resolver_at(tmp.path());
        assert_eq!(
            resolver.resolve("thing", 0, None),
            Resolution::File {
                path: tmp.path().join("thing.py")
            }
        );
    }

    #[test]
    fn regular_and_namespace_packages() {
        let tmp = tempfile::tempdir().unwrap();
        touch(tmp.path().join("regular/__init__.py"));
        touch(tmp.path().join("nspkg/member.py"));
        fs::create_dir_all(tmp.path().join("empty")).unwrap();
        let resolver = resolver_at(tmp.path());
        assert_eq!(
            resolver.resolve("regular", 0, None),
            Resolution::RegularPackage {
                init_path: tmp.path().join("regular/__init__.py"),
                dir: tmp.path().join("regular"),
            }
        );
        assert_eq!(
            resolver.resolve("nspkg", 0, None),
            Resolution::NamespacePackage {
                dir: tmp.path().join("nspkg")
            }
        );
        // a directory with no members is not a namespace package
        assert_eq!(resolver.resolve("empty", 0, None), Resolution::Unresolved);
    }

    #[test]
    fn importing_directory_searched_first() {
        let tmp = tempfile::tempdir().unwrap();
        touch(tmp.path().join("proj/helper.py"));
        touch(tmp.path().join("proj/deep/main.py"));
        touch(tmp.path().join("proj/deep/helper.py"));
        let resolver = resolver_at(&tmp.path().join("proj"));
        let importer = tmp.path().join("proj/deep/main.py");
        assert_eq!(
            resolver.resolve("helper", 0, Some(&importer)),
            Resolution::File {
                path: tmp.path().join("proj/deep/helper.py")
            }
        );
    }

    #[test]
    fn relative_levels_climb_from_importing_file() {
        let tmp = tempfile::tempdir().unwrap();
        touch(tmp.path().join("pkg/__init__.py"));
        touch(tmp.path().join("pkg/sub/__init__.py"));
        touch(tmp.path().join("pkg/sub/mod.py"));
        touch(tmp.path().join("pkg/other.py"));
        let resolver = resolver_at(tmp.path());
        let importer = tmp.path().join("pkg/sub/mod.py");

        // from . import X
        assert_eq!(
            resolver.resolve("", 1, Some(&importer)),
            Resolution::RegularPackage {
                init_path: tmp.path().join("pkg/sub/__init__.py"),
                dir: tmp.path().join("pkg/sub"),
            }
        );
        // from .. import X
        assert_eq!(
            resolver.resolve("", 2, Some(&importer)),
            Resolution::RegularPackage {
                init_path: tmp.path().join("pkg/__init__.py"),
                dir: tmp.path().join("pkg"),
            }
        );
        // from ..other import X
        assert_eq!(
            resolver.resolve("other", 2, Some(&importer)),
            Resolution::File {
                path: tmp.path().join("pkg/other.py")
            }
        );
        // relative imports never consult the search roots
        touch(tmp.path().join("rootmod.py"));
        assert!(matches!(
            resolver.resolve("rootmod", 0, Some(&importer)),
            Resolution::File { .. }
        ));
        assert_eq!(
            resolver.resolve("rootmod", 1, Some(&importer)),
            Resolution::Unresolved
        );
    }

    #[test]
    fn submodule_promotion_probe() {
        let tmp = tempfile::tempdir().unwrap();
        touch(tmp.path().join("mypkg/__init__.py"));
        touch(tmp.path().join("mypkg/module_a.py"));
        let resolver = resolver_at(tmp.path());
        let base = resolver.resolve("mypkg", 0, None);
        assert_eq!(
            resolver.probe_submodule(&base, "module_a"),
            Resolution::File {
                path: tmp.path().join("mypkg/module_a.py")
            }
        );
        // ordinary attribute: no candidate, no error
        assert_eq!(
            resolver.probe_submodule(&base, "some_function"),
            Resolution::Unresolved
        );
        assert_eq!(resolver.probe_submodule(&base, "*"), Resolution::Unresolved);
    }

    #[test]
    fn stdlib_suppression_honors_toggle() {
        let tmp = tempfile::tempdir().unwrap();
        let stdlib = tmp.path().join("stdlib");
        touch(stdlib.join("os.py"));
        let io: Arc<dyn FileIo> = Arc::new(OsFileIo::new(true));

        let suppressing = Resolver::new(
            vec![tmp.path().to_path_buf()],
            false,
            HashSet::from(["os".to_string()]),
            io.clone(),
            Arc::new(TraceCache::new()),
        );
        assert!(suppressing.is_suppressed_stdlib("os", 0));
        assert!(suppressing.is_suppressed_stdlib("os.path", 0));
        assert!(!suppressing.is_suppressed_stdlib("os", 1));
        assert_eq!(suppressing.resolve("os", 0, None), Resolution::Unresolved);

        let including = Resolver::new(
            vec![tmp.path().to_path_buf(), stdlib.clone()],
            true,
            HashSet::from(["os".to_string()]),
            io,
            Arc::new(TraceCache::new()),
        );
        assert!(!including.is_suppressed_stdlib("os", 0));
        assert_eq!(
            including.resolve("os", 0, None),
            Resolution::File {
                path: stdlib.join("os.py")
            }
        );
    }

    #[test]
    fn memo_survives_filesystem_changes() {
        let tmp = tempfile::tempdir().unwrap();
        touch(tmp.path().join("gone.py"));
        let resolver = resolver_at(tmp.path());
        let first = resolver.resolve("gone", 0, None);
        assert!(matches!(first, Resolution::File { .. }));
        fs::remove_file(tmp.path().join("gone.py")).unwrap();
        // snapshot semantics: the memo answers, not the filesystem
        assert_eq!(resolver.resolve("gone", 0, None), first);
    }

    #[test]
    fn relative_start_climbs_level_minus_one() {
        assert_eq!(
            relative_start_dir(Path::new("/a/b/c"), 1),
            Some(PathBuf::from("/a/b/c"))
        );
        assert_eq!(
            relative_start_dir(Path::new("/a/b/c"), 3),
            Some(PathBuf::from("/a"))
        );
        // climbing off the filesystem root fails
        assert_eq!(relative_start_dir(Path::new("/a"), 4), None);
    }

    #[test]
    fn dir_is_package_checks_initializer() {
        let tmp = tempfile::tempdir().unwrap();
        touch(tmp.path().join("pkg/__init__.py"));
        fs::create_dir_all(tmp.path().join("plain")).unwrap();
        let resolver = resolver_at(tmp.path());
        assert!(resolver.dir_is_package(&tmp.path().join("pkg")));
        assert!(!resolver.dir_is_package(&tmp.path().join("plain")));
    }
}
