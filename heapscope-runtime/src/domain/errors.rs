//! Structured error types for the runtime's cold paths.
//!
//! Using thiserror for automatic Display implementation and error chaining.
//! The hot recording path never constructs errors: anything fallible there
//! degrades to "omit this piece of optional information" instead.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("failed to serialize report: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to write report to {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum SymbolizeError {
    #[error("failed to read object file {path}: {source}")]
    ReadObject {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse object file: {0}")]
    ParseObject(#[from] object::Error),

    #[error("failed to load DWARF debug information: {0}")]
    Dwarf(#[from] gimli::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_error_names_the_path() {
        let err = ReportError::Write {
            path: PathBuf::from("/tmp/out.json"),
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        };
        let msg = err.to_string();
        assert!(msg.contains("/tmp/out.json"));
    }
}
