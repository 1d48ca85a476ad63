//! Structured metadata and preview extraction via an external exiftool
//! subprocess.

use {
    crate::ProcessError,
    serde_json::Value,
    std::{collections::HashMap, path::Path},
    tokio::process::Command,
    tracing::debug,
};

/// Embedded-image tags to try for the preview rendition, full previews before
/// thumbnails. The first tag yielding bytes wins.
const PREVIEW_TAGS: &[&str] = &["JpgFromRaw", "PreviewImage", "ThumbnailImage"];

/// Tag groups excluded from structured extraction: large embedded image blobs
/// and maker-note binary blocks that would bloat the stored document.
const EXCLUDED_GROUPS: &[&str] = &[
    "--ThumbnailImage",
    "--PreviewImage",
    "--JpgFromRaw",
    "--OtherImage",
    "--MakerNotes",
];

/// Raw output of metadata extraction for one source file: the group-prefixed
/// tag map and the embedded preview bytes.
pub struct ExtractedImage {
    pub filename: String,
    pub metadata: HashMap<String, Value>,
    pub preview: Vec<u8>,
}

fn extraction_failed(path: &Path, message: impl ToString) -> ProcessError {
    ProcessError::ExtractionFailed {
        path: path.to_string_lossy().into_owned(),
        message: message.to_string(),
    }
}

/// Pull the structured tag map and a binary preview out of `path` using the
/// exiftool binary at `tool`.
pub async fn extract(tool: &str, path: &Path) -> Result<ExtractedImage, ProcessError> {
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| extraction_failed(path, "filename is not valid UTF-8"))?
        .to_owned();

    let output = Command::new(tool)
        .arg("-json")
        .arg("-G")
        .args(EXCLUDED_GROUPS)
        .arg(path)
        .output()
        .await
        .map_err(|e| extraction_failed(path, e))?;

    if !output.status.success() {
        return Err(extraction_failed(
            path,
            String::from_utf8_lossy(&output.stderr),
        ));
    }

    let mut documents = serde_json::from_slice::<Vec<HashMap<String, Value>>>(&output.stdout)
        .map_err(|e| extraction_failed(path, e))?;

    if documents.is_empty() {
        return Err(extraction_failed(path, "no structured metadata returned"));
    }

    let metadata = documents.remove(0);

    let mut preview = None;

    for tag in PREVIEW_TAGS {
        let output = Command::new(tool)
            .arg("-b")
            .arg(format!("-{}", tag))
            .arg(path)
            .output()
            .await
            .map_err(|e| extraction_failed(path, e))?;

        if output.status.success() && !output.stdout.is_empty() {
            debug!("using {} preview for {}", tag, filename);

            preview = Some(output.stdout);
            break;
        }
    }

    let preview = preview.ok_or_else(|| ProcessError::NoPreviewAvailable {
        path: path.to_string_lossy().into_owned(),
    })?;

    Ok(ExtractedImage {
        filename,
        metadata,
        preview,
    })
}
