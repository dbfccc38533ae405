//! JSON serialization of the output record.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use heapscope_common::OutputRecord;

use crate::domain::ReportError;

/// Serialize `record` to `path` as a single JSON document.
pub fn write_report(record: &OutputRecord, path: &Path) -> Result<(), ReportError> {
    let file = File::create(path)
        .map_err(|source| ReportError::Write { path: path.to_path_buf(), source })?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, record)?;
    writer
        .flush()
        .map_err(|source| ReportError::Write { path: path.to_path_buf(), source })?;
    Ok(())
}
