//! Edited-buffer overlay.
//!
//! Files open in the editor are validated from their in-memory contents, never
//! from the possibly stale copy on disk.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Contents of the files currently open in the editor, keyed by absolute path.
pub type FileOverlay = HashMap<PathBuf, String>;

/// Look a path up in the overlay, trying its canonical form as well.
pub fn overlay_text<'a>(path: &Path, overlay: &'a FileOverlay) -> Option<&'a str> {
    if let Some(content) = overlay.get(path) {
        return Some(content);
    }
    let canonical = path.canonicalize().ok()?;
    overlay.get(&canonical).map(String::as_str)
}

/// Read a file, checking the overlay first, then falling back to disk.
pub async fn read_file_with_overlay(path: &Path, overlay: &FileOverlay) -> std::io::Result<String> {
    if let Some(content) = overlay_text(path, overlay) {
        return Ok(content.to_owned());
    }
    tokio::fs::read_to_string(path).await
}

/// Open buffers living under `root`, sorted.
pub fn open_files_under(overlay: &FileOverlay, root: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = overlay
        .keys()
        .filter(|path| path.starts_with(root))
        .cloned()
        .collect();
    files.sort();
    files
}
