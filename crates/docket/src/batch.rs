//! Batch loading from a directory layout.
//!
//! Each immediate subdirectory of the batch directory is one uploaded file;
//! its pages are the lexicographically sorted `*.txt` files inside, each with
//! an optional sibling raster (`.png`/`.jpg`/`.jpeg`) of the same stem:
//!
//! ```text
//! batch/
//!   scan-001/
//!     page-001.txt
//!     page-001.png
//!     page-002.txt
//!   scan-002/
//!     page-001.txt
//! ```

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use docket_core::{PageInput, UploadFile};
use std::path::Path;

const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// Read a batch directory into upload files, sorted by directory name.
pub fn load_batch(dir: &Path) -> Result<Vec<UploadFile>> {
    let mut file_dirs: Vec<_> = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read batch directory: {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .map(|entry| entry.path())
        .collect();
    file_dirs.sort();

    let mut files = Vec::new();
    for file_dir in file_dirs {
        let file = load_upload_file(&file_dir)?;
        if file.pages.is_empty() {
            tracing::warn!(dir = %file_dir.display(), "skipping file directory with no pages");
            continue;
        }
        files.push(file);
    }
    Ok(files)
}

fn load_upload_file(dir: &Path) -> Result<UploadFile> {
    let file_id = dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| dir.display().to_string());

    let mut page_paths: Vec<_> = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read file directory: {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "txt"))
        .collect();
    page_paths.sort();

    let mut pages = Vec::new();
    for path in &page_paths {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read page text: {}", path.display()))?;
        pages.push(PageInput {
            text,
            image: sibling_image(path),
            word_boxes: vec![],
            ocr_confidence: 1.0,
        });
    }

    Ok(UploadFile {
        file_id,
        uploaded_at: uploaded_at(dir),
        pages,
    })
}

/// The page raster next to a text file, if any: same stem, image extension.
fn sibling_image(text_path: &Path) -> Option<Vec<u8>> {
    for ext in IMAGE_EXTENSIONS {
        let candidate = text_path.with_extension(ext);
        if candidate.is_file() {
            match std::fs::read(&candidate) {
                Ok(bytes) => return Some(bytes),
                Err(err) => {
                    tracing::warn!(path = %candidate.display(), %err, "failed to read page image");
                    return None;
                }
            }
        }
    }
    None
}

/// Upload timestamp from directory mtime; falls back to the epoch so a
/// missing mtime still yields a deterministic ordering.
fn uploaded_at(dir: &Path) -> DateTime<Utc> {
    std::fs::metadata(dir)
        .and_then(|m| m.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| DateTime::<Utc>::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_batch_layout() {
        let dir = tempfile::tempdir().unwrap();
        let scan1 = dir.path().join("scan-001");
        let scan2 = dir.path().join("scan-002");
        std::fs::create_dir(&scan1).unwrap();
        std::fs::create_dir(&scan2).unwrap();
        std::fs::write(scan1.join("page-001.txt"), "INVOICE\nACME LTD").unwrap();
        std::fs::write(scan1.join("page-002.txt"), "Grand Total: £5.00").unwrap();
        std::fs::write(scan2.join("page-001.txt"), "DELIVERY NOTE").unwrap();
        // Non-page files are ignored
        std::fs::write(dir.path().join("notes.md"), "not a file dir").unwrap();

        let files = load_batch(dir.path()).unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].file_id, "scan-001");
        assert_eq!(files[0].pages.len(), 2);
        assert!(files[0].pages[0].text.starts_with("INVOICE"));
        assert_eq!(files[1].file_id, "scan-002");
    }

    #[test]
    fn test_sibling_image_is_attached() {
        let dir = tempfile::tempdir().unwrap();
        let scan = dir.path().join("scan-001");
        std::fs::create_dir(&scan).unwrap();
        std::fs::write(scan.join("page-001.txt"), "INVOICE").unwrap();
        std::fs::write(scan.join("page-001.png"), [0x89, 0x50, 0x4e, 0x47]).unwrap();

        let files = load_batch(dir.path()).unwrap();
        assert!(files[0].pages[0].image.is_some());
    }

    #[test]
    fn test_empty_file_directory_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("empty-scan")).unwrap();
        let files = load_batch(dir.path()).unwrap();
        assert!(files.is_empty());
    }

    #[test]
    fn test_missing_batch_dir_is_an_error() {
        let result = load_batch(Path::new("/nonexistent/batch"));
        assert!(result.is_err());
    }
}
