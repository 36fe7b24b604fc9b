// SPDX-FileCopyrightText: © 2024 Hugues Bruant <hugues.bruant@gmail.com>

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Terminating failures. Everything recoverable per-file surfaces as a
/// warning in the trace result instead.
#[derive(Debug, Error)]
pub enum TraceError {
    #[error("entry file not found: {}", .0.display())]
    MissingEntry(PathBuf),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("i/o error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}
