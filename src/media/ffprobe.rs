// FFprobe wrapper for duration probing

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ConvertError, Result};
use crate::media::process::{run_with_timeout, ProcessOutcome};

#[derive(Debug, Deserialize)]
struct FFprobeOutput {
    format: Option<FFprobeFormat>,
}

#[derive(Debug, Deserialize)]
struct FFprobeFormat {
    duration: Option<String>,
}

/// Run ffprobe on a finished file and return its duration in whole seconds.
pub fn probe_duration_secs(ffprobe: &Path, path: &Path, timeout: Duration) -> Result<i64> {
    let mut cmd = Command::new(ffprobe);
    cmd.args(["-v", "error", "-print_format", "json", "-show_format"])
        .arg(path);

    let outcome = run_with_timeout(cmd, timeout)
        .map_err(|e| ConvertError::FFprobe(format!("Failed to run ffprobe: {}", e)))?;

    let stdout = match outcome {
        ProcessOutcome::Exited { status, stdout, .. } if status.success() => stdout,
        ProcessOutcome::Exited { stderr, .. } => {
            return Err(ConvertError::FFprobe(format!("ffprobe failed: {}", stderr)));
        }
        ProcessOutcome::TimedOut { .. } => {
            return Err(ConvertError::FFprobe(format!("ffprobe timed out after {}s", timeout.as_secs())));
        }
    };

    parse_duration_output(&stdout)
        .ok_or_else(|| ConvertError::FFprobe("no duration in ffprobe output".to_string()))
}

/// Best-effort wrapper: `None` means "unavailable", never a job failure.
pub fn probe_duration_or_none(ffprobe: &Path, path: &Path, timeout: Duration) -> Option<i64> {
    match probe_duration_secs(ffprobe, path, timeout) {
        Ok(secs) => Some(secs),
        Err(e) => {
            log::warn!("Duration probe unavailable for {}: {}", path.display(), e);
            None
        }
    }
}

fn parse_duration_output(stdout: &str) -> Option<i64> {
    let output: FFprobeOutput = serde_json::from_str(stdout).ok()?;
    let seconds: f64 = output.format?.duration?.trim().parse().ok()?;
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    Some(seconds.round() as i64)
}
