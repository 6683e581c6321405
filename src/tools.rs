// External tool resolver for ffmpeg/ffprobe
//
// Resolution order:
// 1) Explicit path from configuration (--ffmpeg / FFMPEG_PATH, etc.)
// 2) Sidecar next to the executable (or in its bin/ subdirectory)
// 3) PATH fallback

use std::env;
use std::path::{Path, PathBuf};

/// Get the directory containing the current executable
fn exe_dir() -> Option<PathBuf> {
    env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|d| d.to_path_buf()))
}

/// Resolve a tool path, preferring an explicit configuration value.
fn resolve_tool(explicit: Option<&Path>, default_name: &str) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }

    let mut filename = default_name.to_string();
    if cfg!(windows) && !filename.to_lowercase().ends_with(".exe") {
        filename.push_str(".exe");
    }

    if let Some(dir) = exe_dir() {
        let candidate = dir.join(&filename);
        if candidate.exists() {
            return candidate;
        }

        let bin_candidate = dir.join("bin").join(&filename);
        if bin_candidate.exists() {
            return bin_candidate;
        }
    }

    PathBuf::from(default_name)
}

/// Get path to ffmpeg binary
pub fn ffmpeg_path(explicit: Option<&Path>) -> PathBuf {
    resolve_tool(explicit, "ffmpeg")
}

/// Get path to ffprobe binary
pub fn ffprobe_path(explicit: Option<&Path>) -> PathBuf {
    resolve_tool(explicit, "ffprobe")
}

/// Check if a tool is runnable at the resolved path
pub fn is_tool_available(path: &Path) -> bool {
    if path.is_file() {
        return true;
    }

    // Bare names rely on PATH lookup, so try running it
    std::process::Command::new(path)
        .arg("-version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}
