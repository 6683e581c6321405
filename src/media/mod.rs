// Media path rules and external transcoder wrappers

pub mod ffprobe;
pub mod process;
pub mod remux;

use std::path::{Component, Path, PathBuf};

use crate::constants::{OUTPUT_EXTENSION, RAW_VIDEO_EXTENSION, READY_SUFFIX, TEMP_SUFFIX};
use crate::error::{ConvertError, Result};

/// Normalize a path stored relative to the media root.
/// Leading separators are dropped; parent components are rejected outright.
pub fn normalize_relative(relative: &str) -> Result<String> {
    let trimmed = relative.trim().trim_start_matches(['/', '\\']);
    if trimmed.is_empty() {
        return Err(ConvertError::InvalidPath("empty media path".to_string()));
    }

    let escapes = Path::new(trimmed).components().any(|c| {
        matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_))
    });
    if escapes {
        return Err(ConvertError::InvalidPath(format!(
            "media path escapes the media root: {}",
            relative
        )));
    }

    Ok(trimmed.to_string())
}

/// Output location for a raw source: `.h264` becomes `.mp4`, anything else gets `.mp4` appended.
pub fn derive_output_path(source_path: &str) -> String {
    let raw_suffix = format!(".{}", RAW_VIDEO_EXTENSION);
    match source_path.strip_suffix(&raw_suffix) {
        Some(stem) => format!("{}.{}", stem, OUTPUT_EXTENSION),
        None => format!("{}.{}", source_path, OUTPUT_EXTENSION),
    }
}

/// Join a stored relative path onto the media root.
pub fn resolve_media_path(media_root: &Path, relative: &str) -> Result<PathBuf> {
    let rel = normalize_relative(relative)?;
    Ok(media_root.join(rel))
}

/// Companion sentinel the transfer process writes once `source` is complete.
pub fn ready_marker_path(source: &Path) -> PathBuf {
    append_suffix(source, READY_SUFFIX)
}

/// Where one run of the transcoder writes before the atomic rename.
/// Named per claim so an overlapping run of the same job never shares it.
pub fn temp_output_path(output: &Path, run_token: &str) -> PathBuf {
    append_suffix(output, &format!(".{}{}", run_token, TEMP_SUFFIX))
}

fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}
