// SPDX-FileCopyrightText: © 2024 Hugues Bruant <hugues.bruant@gmail.com>

use log::{debug, info, warn};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::parser::run_helper;

/// Snapshot of the target runtime taken once per trace. Filesystem or
/// interpreter changes mid-trace do not influence decisions already made.
#[derive(Debug, Clone, Default)]
pub struct PyEnv {
    /// resolved interpreter; None means the probe found nothing and the
    /// structural backend plus stdlib identification are disabled
    pub python: Option<PathBuf>,
    pub version: Option<String>,
    pub search_roots: Vec<PathBuf>,
    pub stdlib_root: Option<PathBuf>,
    pub site_roots: Vec<PathBuf>,
    pub stdlib_names: HashSet<String>,
    pub warnings: Vec<String>,
}

impl PyEnv {
    /// Structurally disabled stdlib identification: with no runtime, no
    /// module name is ever treated as standard library.
    pub fn knows_stdlib(&self) -> bool {
        !self.stdlib_names.is_empty()
    }
}

#[derive(Deserialize)]
struct WireEnv {
    version: Option<String>,
    search_roots: Vec<PathBuf>,
    stdlib_root: Option<PathBuf>,
    site_roots: Vec<PathBuf>,
}

/// Platform-default interpreter lookup.
pub fn default_locator() -> Option<PathBuf> {
    which::which("python3")
        .or_else(|_| which::which("python"))
        .ok()
}

/// Interrogate the runtime named by `locator` (or the platform default).
/// Best-effort: failure returns a degraded snapshot with empty roots and an
/// empty stdlib set, carrying a warning rather than an error.
pub async fn probe(locator: Option<&Path>, timeout: Duration) -> PyEnv {
    let python = match locator {
        Some(path) => Some(path.to_path_buf()),
        None => default_locator(),
    };
    let Some(python) = python else {
        return PyEnv {
            warnings: vec![
                "no python interpreter found on PATH; search roots empty, stdlib identification disabled"
                    .to_string(),
            ],
            ..PyEnv::default()
        };
    };

    let mut env = PyEnv::default();
    match run_helper(&python, "env", None, timeout).await {
        Ok(stdout) => match serde_json::from_slice::<WireEnv>(&stdout) {
            Ok(wire) => {
                info!(
                    "probed {} ({})",
                    python.display(),
                    wire.version.as_deref().unwrap_or("unknown version")
                );
                env.version = wire.version;
                env.search_roots = wire.search_roots;
                env.stdlib_root = wire.stdlib_root;
                env.site_roots = wire.site_roots;
            }
            Err(err) => {
                warn!("env probe returned undecodable output: {}", err);
                env.warnings.push(format!(
                    "environment probe of {} returned undecodable output ({}); search roots empty",
                    python.display(),
                    err
                ));
                return env;
            }
        },
        Err(err) => {
            warn!("env probe failed: {}", err);
            env.warnings.push(format!(
                "environment probe of {} failed ({}); search roots empty, stdlib identification disabled",
                python.display(),
                err
            ));
            return env;
        }
    }

    match run_helper(&python, "stdlib", None, timeout).await {
        Ok(stdout) => match serde_json::from_slice::<Vec<String>>(&stdout) {
            Ok(names) => {
                debug!("{} stdlib module names", names.len());
                env.stdlib_names = names.into_iter().collect();
            }
            Err(err) => {
                env.warnings.push(format!(
                    "stdlib probe of {} returned undecodable output ({}); stdlib identification disabled",
                    python.display(),
                    err
                ));
            }
        },
        Err(err) => {
            env.warnings.push(format!(
                "stdlib probe of {} failed ({}); stdlib identification disabled",
                python.display(),
                err
            ));
        }
    }

    env.python = Some(python);
    env
}
