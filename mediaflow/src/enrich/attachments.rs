//! Discovery of attachment images on disk.
//!
//! Layout: `{images_dir}/{source}/{record_id}.{jpg,jpeg,png}`.

use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{debug, warn};

#[allow(clippy::unwrap_used)]
static IMAGE_FILE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?P<stem>.+)\.(?i:jpe?g|png)$").unwrap());

/// An image belonging to one record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Attachment {
    /// Source directory name.
    pub source_name: String,
    /// Record id parsed from the file name.
    pub record_id: i64,
    /// Full path of the image.
    pub path: PathBuf,
}

/// Lists every attachment image, sorted by `(source, record_id, path)`.
///
/// A missing root yields an empty list. Image files whose stem is not an
/// integer are skipped with a warning; other files are ignored.
pub fn scan_attachments(images_dir: &Path) -> std::io::Result<Vec<Attachment>> {
    if !images_dir.exists() {
        warn!(root = %images_dir.display(), "Images directory does not exist");
        return Ok(Vec::new());
    }

    let mut attachments = Vec::new();
    for source_entry in fs::read_dir(images_dir)? {
        let source_dir = source_entry?.path();
        if !source_dir.is_dir() {
            continue;
        }
        let Some(source_name) = source_dir.file_name().and_then(|n| n.to_str()) else {
            continue;
        };

        for entry in fs::read_dir(&source_dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(captures) = IMAGE_FILE.captures(file_name) else {
                debug!(path = %path.display(), "Ignoring non-image file");
                continue;
            };
            match captures["stem"].parse::<i64>() {
                Ok(record_id) => attachments.push(Attachment {
                    source_name: source_name.to_string(),
                    record_id,
                    path: path.clone(),
                }),
                Err(_) => {
                    warn!(path = %path.display(), "Image name is not a record id; skipped");
                }
            }
        }
    }

    attachments.sort();
    Ok(attachments)
}
