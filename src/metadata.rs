//! # Caption metadata
//!
//! Builds the `file_name,text` metadata file that pairs every spectrogram
//! image of a directory with a caption.
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_CAPTION: &str = "An Irish Traditional Tune";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub file_name: String,
    pub text: String,
}

/// Lists the files of `dir` with the given extension and gives each one the
/// same caption. The records are sorted by file name.
pub fn collect_records<P: AsRef<Path>>(
    dir: P,
    extension: &str,
    caption: &str,
) -> anyhow::Result<Vec<MetadataRecord>> {
    let dir = dir.as_ref();
    let entries = std::fs::read_dir(dir).map_err(|e| {
        anyhow::Error::new(e).context(format!("error listing {:?}", dir.to_string_lossy()))
    })?;
    let extension = extension.trim_start_matches('.');
    let mut records = vec![];
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let path = entry.path();
        let matches = path
            .extension()
            .and_then(|e| e.to_str())
            .map_or(false, |e| e.eq_ignore_ascii_case(extension));
        if !matches {
            continue;
        }
        let file_name = entry.file_name().to_string_lossy().into_owned();
        records.push(MetadataRecord { file_name, text: caption.to_string() })
    }
    records.sort_by(|a, b| a.file_name.cmp(&b.file_name));
    if records.is_empty() {
        tracing::warn!("no .{extension} file found in {:?}", dir.to_string_lossy());
    }
    Ok(records)
}

/// Writes the records as a csv file with a `file_name,text` header.
pub fn write_records<P: AsRef<Path>>(path: P, records: &[MetadataRecord]) -> anyhow::Result<()> {
    crate::utils::create_parent_dir(&path)?;
    let mut writer = csv::Writer::from_path(path.as_ref())?;
    if records.is_empty() {
        writer.write_record(["file_name", "text"])?;
    }
    for record in records.iter() {
        writer.serialize(record)?;
    }
    writer.flush()?;
    tracing::info!("wrote {} records to {:?}", records.len(), path.as_ref().to_string_lossy());
    Ok(())
}
