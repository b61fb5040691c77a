//! ZIP archive extraction into run-scoped scratch directories.

use std::io::Read;
use std::path::{Path, PathBuf};

use tracing::debug;

use spl_common::{EtlError, Result};

/// Extract every XML file from a ZIP archive into `dest`, returning the
/// extracted paths paired with their archive-relative names.
///
/// Entry paths are flattened to their file names; SPL archives nest one
/// directory level that carries no information.
pub fn extract_zip_archive(path: &Path, dest: &Path) -> Result<Vec<(PathBuf, String)>> {
    let file = std::fs::File::open(path)?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| {
        EtlError::acquisition(
            path.display().to_string(),
            format!("not a readable zip archive: {e}"),
        )
    })?;

    std::fs::create_dir_all(dest)?;
    let mut extracted = Vec::new();
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(|e| {
            EtlError::acquisition(
                path.display().to_string(),
                format!("bad zip entry at index {i}: {e}"),
            )
        })?;
        if entry.is_dir() {
            continue;
        }
        let entry_name = entry.name().to_string();
        if !entry_name.to_lowercase().ends_with(".xml") {
            continue;
        }
        let file_name = entry_name.rsplit('/').next().unwrap_or(&entry_name);
        let out_path = dest.join(file_name);

        let mut contents = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut contents)?;
        std::fs::write(&out_path, &contents)?;
        debug!(entry = %entry_name, bytes = contents.len(), "Extracted XML file");
        extracted.push((out_path, entry_name));
    }
    Ok(extracted)
}
