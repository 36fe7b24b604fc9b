// SPDX-FileCopyrightText: © 2024 Hugues Bruant <hugues.bruant@gmail.com>

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Dir,
    Other,
}

/// Filesystem seam used by the resolver and the orchestrator.
///
/// The default implementation hits the real filesystem; embedders and tests
/// can substitute a virtual tree. All tracer reads and stats go through this
/// trait, behind the I/O concurrency gate.
pub trait FileIo: Send + Sync {
    fn read_to_string(&self, path: &Path) -> io::Result<String>;
    fn stat(&self, path: &Path) -> io::Result<FileKind>;
    fn list_dir(&self, path: &Path) -> io::Result<Vec<(String, FileKind)>>;
}

/// Real-filesystem implementation, carrying the symlink policy.
pub struct OsFileIo {
    follow_symlinks: bool,
}

impl OsFileIo {
    pub fn new(follow_symlinks: bool) -> OsFileIo {
        OsFileIo { follow_symlinks }
    }
}

fn kind_of(ft: std::fs::FileType) -> FileKind {
    if ft.is_file() {
        FileKind::File
    } else if ft.is_dir() {
        FileKind::Dir
    } else {
        FileKind::Other
    }
}

impl FileIo for OsFileIo {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        std::fs::read_to_string(path)
    }

    fn stat(&self, path: &Path) -> io::Result<FileKind> {
        let meta = if self.follow_symlinks {
            std::fs::metadata(path)?
        } else {
            std::fs::symlink_metadata(path)?
        };
        Ok(kind_of(meta.file_type()))
    }

    fn list_dir(&self, path: &Path) -> io::Result<Vec<(String, FileKind)>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(_) => continue,
            };
            let kind = if self.follow_symlinks {
                match std::fs::metadata(entry.path()) {
                    Ok(meta) => kind_of(meta.file_type()),
                    Err(_) => FileKind::Other,
                }
            } else {
                kind_of(entry.file_type()?)
            };
            out.push((name, kind));
        }
        Ok(out)
    }
}

/// In-memory tree, mostly for tests and virtual-filesystem embedders.
/// Directories are implied by the file paths added.
#[derive(Default)]
pub struct MemFileIo {
    files: BTreeMap<PathBuf, String>,
}

impl MemFileIo {
    pub fn new() -> MemFileIo {
        MemFileIo::default()
    }

    pub fn add_file(&mut self, path: impl Into<PathBuf>, content: impl Into<String>) {
        self.files.insert(path.into(), content.into());
    }

    fn is_dir(&self, path: &Path) -> bool {
        self.files.keys().any(|k| k.starts_with(path) && k != path)
    }
}

impl FileIo for MemFileIo {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
    }

    fn stat(&self, path: &Path) -> io::Result<FileKind> {
        if self.files.contains_key(path) {
            Ok(FileKind::File)
        } else if self.is_dir(path) {
            Ok(FileKind::Dir)
        } else {
            Err(io::Error::from(io::ErrorKind::NotFound))
        }
    }

    fn list_dir(&self, path: &Path) -> io::Result<Vec<(String, FileKind)>> {
        if !self.is_dir(path) {
            return Err(io::Error::from(io::ErrorKind::NotFound));
        }
        let mut seen = BTreeMap::new();
        for key in self.files.keys() {
            if let Ok(rest) = key.strip_prefix(path) {
                let mut comps = rest.components();
                if let Some(first) = comps.next() {
                    let name = first.as_os_str().to_string_lossy().into_owned();
                    let kind = if comps.next().is_some() {
                        FileKind::Dir
                    } else {
                        FileKind::File
                    };
                    // a name can be both a file and a dir prefix; dir wins
                    let slot = seen.entry(name).or_insert(kind);
                    if kind == FileKind::Dir {
                        *slot = FileKind::Dir;
                    }
                }
            }
        }
        Ok(seen.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn mem_tree_stat_and_list() {
        let mut io = MemFileIo::new();
        io.add_file("/proj/main.py", "import utils");
        io.add_file("/proj/pkg/__init__.py", "");
        io.add_file("/proj/pkg/a.py", "");

        assert_eq!(io.stat(Path::new("/proj/main.py")).unwrap(), FileKind::File);
        assert_eq!(io.stat(Path::new("/proj/pkg")).unwrap(), FileKind::Dir);
        assert!(io.stat(Path::new("/proj/nope")).is_err());

        let listing = io.list_dir(Path::new("/proj")).unwrap();
        assert!(listing.contains(&("main.py".to_string(), FileKind::File)));
        assert!(listing.contains(&("pkg".to_string(), FileKind::Dir)));
    }
}
