use anyhow::Result;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use web_scout::ExtractionResult;

/// File name derived from the record's title, e.g. `solo_leveling.json`.
pub fn default_file_name(result: &ExtractionResult) -> Option<PathBuf> {
    let title = result.title()?;
    let slug: String = title
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect();
    let slug = slug.trim_matches('_');
    if slug.is_empty() {
        return None;
    }
    Some(PathBuf::from(format!("{slug}.json")))
}

pub fn save_result(path: &Path, result: &ExtractionResult) -> Result<()> {
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;

    serde_json::to_writer_pretty(file, result)?;
    Ok(())
}
