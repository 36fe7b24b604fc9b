// SPDX-FileCopyrightText: © 2024 Hugues Bruant <hugues.bruant@gmail.com>

use log::{debug, warn};
use serde::Deserialize;
use std::fmt::Display;
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::fallback;

/// AST extractor, shipped to whatever interpreter the probe located.
/// One script, three subcommands: parse / env / stdlib.
pub(crate) const HELPER_SCRIPT: &str = include_str!("pyhelper.py");

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FromName {
    pub name: String,
    pub alias: Option<String>,
}

impl FromName {
    pub fn plain(name: &str) -> FromName {
        FromName {
            name: name.to_string(),
            alias: None,
        }
    }

    pub fn is_wildcard(&self) -> bool {
        self.name == "*"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DynamicKind {
    BuiltinImport,
    ImportlibImportModule,
    RunpyRunModule,
    RunpyRunPath,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportRecord {
    /// `import a.b.c` (one record per comma-separated module)
    Plain {
        module: String,
        alias: Option<String>,
        line: u32,
    },
    /// `from base import x, y as z` / `from .. import x`
    From {
        base: String,
        level: u32,
        names: Vec<FromName>,
        line: u32,
    },
    /// recognized runtime-import idiom; `module`/`path` when the first
    /// argument is a string literal, `expression` otherwise
    Dynamic {
        kind: DynamicKind,
        module: Option<String>,
        package: Option<String>,
        level: u32,
        path: Option<String>,
        expression: Option<String>,
        line: u32,
    },
}

impl ImportRecord {
    pub fn line(&self) -> u32 {
        match self {
            ImportRecord::Plain { line, .. } => *line,
            ImportRecord::From { line, .. } => *line,
            ImportRecord::Dynamic { line, .. } => *line,
        }
    }
}

// wire shape of the helper's `parse` output

#[derive(Deserialize)]
struct WirePlain {
    module: String,
    alias: Option<String>,
    line: u32,
}

#[derive(Deserialize)]
struct WireName {
    name: String,
    alias: Option<String>,
}

#[derive(Deserialize)]
struct WireFrom {
    base: String,
    level: u32,
    names: Vec<WireName>,
    line: u32,
}

#[derive(Deserialize)]
struct WireDynamic {
    kind: DynamicKind,
    module: Option<String>,
    package: Option<String>,
    #[serde(default)]
    level: u32,
    path: Option<String>,
    expression: Option<String>,
    line: u32,
}

#[derive(Deserialize)]
struct WireParse {
    imports: Vec<WirePlain>,
    from_imports: Vec<WireFrom>,
    dynamic_imports: Vec<WireDynamic>,
    errors: Vec<String>,
}

pub(crate) fn decode_parse_output(
    data: &[u8],
) -> Result<(Vec<ImportRecord>, Vec<String>), serde_json::Error> {
    let wire: WireParse = serde_json::from_slice(data)?;
    let mut records = Vec::new();
    for p in wire.imports {
        records.push(ImportRecord::Plain {
            module: p.module,
            alias: p.alias,
            line: p.line,
        });
    }
    for f in wire.from_imports {
        records.push(ImportRecord::From {
            base: f.base,
            level: f.level,
            names: f
                .names
                .into_iter()
                .map(|n| FromName {
                    name: n.name,
                    alias: n.alias,
                })
                .collect(),
            line: f.line,
        });
    }
    for d in wire.dynamic_imports {
        records.push(ImportRecord::Dynamic {
            kind: d.kind,
            module: d.module,
            package: d.package,
            level: d.level,
            path: d.path,
            expression: d.expression,
            line: d.line,
        });
    }
    records.sort_by_key(|r| r.line());
    Ok((records, wire.errors))
}

#[derive(Debug)]
pub(crate) enum HelperError {
    Spawn(io::Error),
    Timeout(Duration),
    Status(Option<i32>, String),
}

impl Display for HelperError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HelperError::Spawn(err) => write!(f, "failed to spawn interpreter: {}", err),
            HelperError::Timeout(d) => write!(f, "timed out after {:?}", d),
            HelperError::Status(code, stderr) => {
                write!(f, "exited with status {:?}: {}", code, stderr.trim())
            }
        }
    }
}

/// Run a helper subcommand under a wall-clock timeout, feeding `stdin` and
/// returning raw stdout. Non-zero exit status is unrecoverable for the call.
pub(crate) async fn run_helper(
    python: &Path,
    subcommand: &str,
    stdin: Option<&str>,
    timeout: Duration,
) -> Result<Vec<u8>, HelperError> {
    let mut child = Command::new(python)
        .arg("-c")
        .arg(HELPER_SCRIPT)
        .arg(subcommand)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(HelperError::Spawn)?;

    if let Some(input) = stdin {
        let mut pipe = child.stdin.take().expect("stdin was piped");
        // dropping the handle closes the pipe so the child sees EOF
        let _ = pipe.write_all(input.as_bytes()).await;
        drop(pipe);
    } else {
        drop(child.stdin.take());
    }

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(res) => res.map_err(HelperError::Spawn)?,
        Err(_) => return Err(HelperError::Timeout(timeout)),
    };
    if !output.status.success() {
        return Err(HelperError::Status(
            output.status.code(),
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ));
    }
    Ok(output.stdout)
}

/// Extract import records from one file's source text.
///
/// Prefers the structural backend (interpreter subprocess); any failure there
/// degrades to the regex backend for this file, with a warning. `python` is
/// `None` when the environment probe found no interpreter, in which case the
/// regex backend is used directly.
pub async fn extract_imports(
    python: Option<&Path>,
    source: &str,
    label: &str,
    timeout: Duration,
) -> (Vec<ImportRecord>, Vec<String>) {
    if let Some(python) = python {
        match run_helper(python, "parse", Some(source), timeout).await {
            Ok(stdout) => match decode_parse_output(&stdout) {
                Ok((records, errors)) => {
                    let warnings = errors
                        .into_iter()
                        .map(|e| format!("{}: parse error: {}", label, e))
                        .collect();
                    debug!("{}: {} imports (structural)", label, records.len());
                    return (records, warnings);
                }
                Err(err) => {
                    warn!("{}: undecodable parser output: {}", label, err);
                    return (
                        fallback::scan_source(source),
                        vec![format!(
                            "{}: structural parser returned undecodable output ({}), used regex fallback",
                            label, err
                        )],
                    );
                }
            },
            Err(err) => {
                warn!("{}: structural parser failed: {}", label, err);
                return (
                    fallback::scan_source(source),
                    vec![format!(
                        "{}: structural parser failed ({}), used regex fallback",
                        label, err
                    )],
                );
            }
        }
    }
    (fallback::scan_source(source), Vec::new())
}
