// Conversion executor: drives one claimed job to a terminal or deferred state.
//
//   Claimed -> (handshake) -> Validating -> Converting -> Finalizing -> Complete | Failed
//                  \-> Deferred (back to pending)
//
// Job-level problems become an `Outcome`; only store errors escape as `Err`,
// in which case the job stays `processing` until the reaper recovers it.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::Connection;

use crate::constants::DEFAULT_DURATION_SECONDS;
use crate::db::schema::{self, Claim, ReleaseReason};
use crate::error::Result;
use crate::jobs::handshake::{check_transfer_ready, Readiness};
use crate::jobs::shutdown::Shutdown;
use crate::media::{self, ffprobe, remux};

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub media_root: PathBuf,
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
    pub convert_timeout: Duration,
    pub probe_timeout: Duration,
    /// Pause after a deferral before the slot frees, so an unfinished
    /// transfer is not re-claimed in a hot loop.
    pub defer_delay: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Complete { duration_secs: i64, output_bytes: u64 },
    Failed { reason: String },
    /// Readiness marker missing; returned to `pending`.
    Deferred,
    /// Our claim was no longer current when we tried to write (reaped and
    /// re-claimed elsewhere). Nothing was written and nothing was deleted.
    Superseded,
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Complete { .. } => "complete",
            Outcome::Failed { .. } => "failed",
            Outcome::Deferred => "deferred",
            Outcome::Superseded => "superseded",
        }
    }
}

/// Run one claimed job.
pub fn execute(
    conn: &Connection,
    claim: &Claim,
    settings: &ExecutorSettings,
    shutdown: &Shutdown,
) -> Result<Outcome> {
    let job = &claim.job;

    let source_rel = match media::normalize_relative(&job.source_path) {
        Ok(rel) => rel,
        Err(e) => return fail(conn, claim, e.to_string()),
    };
    let output_rel = media::derive_output_path(&source_rel);
    let source = settings.media_root.join(&source_rel);
    let output = settings.media_root.join(&output_rel);

    // Transfer handshake
    let marker = match check_transfer_ready(&source) {
        Readiness::Ready { marker } => marker,
        Readiness::NotReady { marker } => {
            log::info!(
                "Job {}: waiting for transfer completion (no {}), deferring",
                job.id,
                marker.display()
            );
            if !schema::release_to_pending(conn, job.id, &claim.run_token, ReleaseReason::Deferred)? {
                log::warn!("Job {}: claim lost before deferral could be recorded", job.id);
                return Ok(Outcome::Superseded);
            }
            shutdown.wait(settings.defer_delay);
            return Ok(Outcome::Deferred);
        }
    };

    // Validating
    let tmp = media::temp_output_path(&output, &claim.run_token);
    if let Err(reason) = validate(&source, &output, &tmp) {
        return fail(conn, claim, reason);
    }

    // Converting
    log::info!("Job {}: converting {} -> {}", job.id, source_rel, output_rel);
    if let Err(e) = remux::remux_to_temp(&settings.ffmpeg, &source, &tmp, settings.convert_timeout) {
        return fail(conn, claim, e.to_string());
    }

    // Finalizing. A run whose claim was reaped meanwhile must not replace
    // the output the current owner is about to publish.
    let still_owned = schema::claim_is_current(conn, job.id, &claim.run_token);
    if !matches!(still_owned, Ok(true)) {
        let _ = fs::remove_file(&tmp);
        still_owned?;
        log::warn!("Job {}: claim lost during conversion; discarding output", job.id);
        return Ok(Outcome::Superseded);
    }
    let output_bytes = match remux::finalize_output(&tmp, &output) {
        Ok(size) => size,
        Err(e) => return fail(conn, claim, format!("Could not finalize {}: {}", output_rel, e)),
    };

    let duration_secs = ffprobe::probe_duration_or_none(&settings.ffprobe, &output, settings.probe_timeout)
        .unwrap_or(DEFAULT_DURATION_SECONDS);

    if !schema::mark_complete(conn, job.id, &claim.run_token, &output_rel, duration_secs)? {
        log::warn!(
            "Job {}: finished but the claim is no longer ours; leaving source in place",
            job.id
        );
        return Ok(Outcome::Superseded);
    }

    log::info!("Job {}: conversion successful (duration: {}s)", job.id, duration_secs);

    // Only after the completion is committed
    remove_source(job.id, &source, &marker, output_bytes);

    Ok(Outcome::Complete { duration_secs, output_bytes })
}

/// Record a terminal failure. Failures are not retried automatically.
fn fail(conn: &Connection, claim: &Claim, reason: String) -> Result<Outcome> {
    let job_id = claim.job.id;
    if !schema::mark_failed(conn, job_id, &claim.run_token, &reason)? {
        log::warn!("Job {}: failed ({}) but the claim is no longer ours", job_id, reason);
        return Ok(Outcome::Superseded);
    }
    log::error!("Job {}: conversion failed: {}", job_id, reason);
    Ok(Outcome::Failed { reason })
}

/// Preconditions that are not transient: a violation fails the job.
fn validate(source: &Path, output: &Path, tmp: &Path) -> std::result::Result<(), String> {
    if !source.is_file() {
        return Err(format!("H.264 file not found: {}", source.display()));
    }

    if let Err(e) = fs::File::open(source) {
        return Err(format!("No read permission for H.264 file {}: {}", source.display(), e));
    }

    let target_dir = match output.parent() {
        Some(dir) => dir,
        None => return Err(format!("Output path has no directory: {}", output.display())),
    };

    if let Err(e) = fs::create_dir_all(target_dir) {
        return Err(format!("Cannot create directory {}: {}", target_dir.display(), e));
    }

    // Probe writability with the temp path we are about to use anyway
    match OpenOptions::new().write(true).create(true).truncate(true).open(tmp) {
        Ok(_) => {
            let _ = fs::remove_file(tmp);
            Ok(())
        }
        Err(e) => Err(format!("No write permission for directory {}: {}", target_dir.display(), e)),
    }
}

fn remove_source(job_id: i64, source: &Path, marker: &Path, output_bytes: u64) {
    if output_bytes == 0 {
        log::warn!("Job {}: MP4 is empty; keeping H.264", job_id);
        return;
    }

    match fs::remove_file(source) {
        Ok(()) => log::info!("Job {}: deleted H.264 after successful conversion", job_id),
        Err(e) => {
            log::warn!("Job {}: could not delete H.264 {}: {}", job_id, source.display(), e);
            return;
        }
    }

    if let Err(e) = fs::remove_file(marker) {
        log::warn!("Job {}: could not delete {}: {}", job_id, marker.display(), e);
    }
}
