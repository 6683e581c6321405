// H.264 elementary stream -> MP4 container remux (no re-encode)
//
// ffmpeg only ever writes to a temporary sibling of the output; the final
// path appears through a single rename, so a reader never sees a partial MP4.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use crate::constants::FFMPEG_THREADS;
use crate::error::{ConvertError, Result};
use crate::media::process::{run_with_timeout, ProcessOutcome};

/// Build the ffmpeg argument list for a container copy into `tmp_path`.
pub fn build_remux_args(source: &Path, tmp_path: &Path) -> Vec<String> {
    vec![
        "-hide_banner".to_string(),
        "-loglevel".to_string(), "error".to_string(),
        "-threads".to_string(), FFMPEG_THREADS.to_string(),
        "-i".to_string(), source.to_string_lossy().to_string(),
        "-c".to_string(), "copy".to_string(),
        "-movflags".to_string(), "faststart".to_string(),
        "-f".to_string(), "mp4".to_string(),
        "-y".to_string(),
        tmp_path.to_string_lossy().to_string(),
    ]
}

/// Run ffmpeg into `tmp_path`. On any failure the temp file is removed.
pub fn remux_to_temp(ffmpeg: &Path, source: &Path, tmp_path: &Path, timeout: Duration) -> Result<()> {
    // Leftover from a crashed run; ffmpeg -y would overwrite it, but a spawn failure would not
    let _ = std::fs::remove_file(tmp_path);

    let mut cmd = Command::new(ffmpeg);
    cmd.args(build_remux_args(source, tmp_path));

    let outcome = run_with_timeout(cmd, timeout)
        .map_err(|e| ConvertError::FFmpeg(format!("Failed to run ffmpeg ({}): {}", ffmpeg.display(), e)))?;

    let result = match outcome {
        ProcessOutcome::Exited { status, stderr, .. } if status.success() => {
            for line in stderr.lines() {
                log::debug!("ffmpeg: {}", line);
            }
            match std::fs::metadata(tmp_path) {
                Ok(meta) if meta.len() > 0 => Ok(()),
                Ok(_) => Err(ConvertError::FFmpeg("ffmpeg produced an empty file".to_string())),
                Err(_) => Err(ConvertError::FFmpeg("ffmpeg reported success but wrote no output".to_string())),
            }
        }
        ProcessOutcome::Exited { status, stderr, .. } => {
            let code = status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            Err(ConvertError::FFmpeg(format!("ffmpeg exited with code {}: {}", code, stderr)))
        }
        ProcessOutcome::TimedOut { stderr } => Err(ConvertError::FFmpeg(format!(
            "ffmpeg timed out after {}s (input may be corrupt): {}",
            timeout.as_secs(),
            stderr
        ))),
    };

    if result.is_err() {
        let _ = std::fs::remove_file(tmp_path);
    }
    result
}

/// Atomically move the finished temp file onto `output`. Returns the final size.
pub fn finalize_output(tmp_path: &Path, output: &Path) -> Result<u64> {
    if let Err(e) = std::fs::rename(tmp_path, output) {
        let _ = std::fs::remove_file(tmp_path);
        return Err(ConvertError::Io(e));
    }

    let size = std::fs::metadata(output)?.len();
    Ok(size)
}
