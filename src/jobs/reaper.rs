// Stale-claim reaper
//
// Sole crash-recovery path: a worker that dies mid-job leaves its row in
// `processing`; once the claim is older than the threshold it goes back to
// `pending` without any cooperation from the dead worker.

use std::time::{Duration, Instant};

use chrono::Utc;
use rusqlite::Connection;

use crate::db::schema::{self, parse_timestamp};
use crate::error::{ConvertError, Result};

#[derive(Debug, Clone)]
pub struct ReaperSettings {
    /// Claims older than this are presumed abandoned.
    pub threshold: Duration,
    /// Time between sweeps.
    pub interval: Duration,
    /// Claims older than `threshold * multiple` are also reported as overdue.
    pub flag_multiple: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Stale claims returned to `pending`.
    pub reset: usize,
    /// Stale claims past the flag multiple (counted in `reset` as well).
    pub flagged: usize,
    /// Stale rows that changed hands between the scan and the reset.
    pub skipped: usize,
}

/// One sweep over the store.
pub fn sweep_stale_claims(conn: &Connection, settings: &ReaperSettings) -> Result<ReapReport> {
    let now = Utc::now();
    let threshold = chrono::Duration::from_std(settings.threshold)
        .map_err(|e| ConvertError::Config(format!("stale threshold out of range: {}", e)))?;
    let cutoff = now - threshold;

    let overdue_after = settings
        .flag_multiple
        .and_then(|m| i32::try_from(m).ok())
        .and_then(|m| threshold.checked_mul(m));

    let mut report = ReapReport::default();

    for claim in schema::find_stale_claims(conn, cutoff)? {
        let age = parse_timestamp(&claim.claimed_at).map(|at| now - at);

        if let (Some(age), Some(limit)) = (age, overdue_after) {
            if age > limit {
                report.flagged += 1;
                log::warn!(
                    "Job {}: claim by {} is {}s old (over {}x the stale threshold); the job may be hung rather than abandoned",
                    claim.id,
                    claim.claimed_by,
                    age.num_seconds(),
                    settings.flag_multiple.unwrap_or_default()
                );
            }
        }

        if schema::reset_stale_claim(conn, &claim)? {
            report.reset += 1;
            log::info!(
                "[RECOVERY] Job {}: reset stale claim by {} (claimed at {})",
                claim.id,
                claim.claimed_by,
                claim.claimed_at
            );
        } else {
            report.skipped += 1;
        }
    }

    if report.reset > 0 {
        log::info!(
            "[RECOVERY] Reset {} stale claim(s) older than {}s",
            report.reset,
            settings.threshold.as_secs()
        );
    }

    Ok(report)
}

/// Runs sweeps on its own cadence, independent of claim traffic.
pub struct Reaper {
    settings: ReaperSettings,
    last_sweep: Option<Instant>,
}

impl Reaper {
    pub fn new(settings: ReaperSettings) -> Self {
        Self {
            settings,
            last_sweep: None,
        }
    }

    pub fn settings(&self) -> &ReaperSettings {
        &self.settings
    }

    /// The first sweep is due immediately so a restart recovers its own dead claims.
    pub fn is_due(&self, now: Instant) -> bool {
        self.until_due(now).is_zero()
    }

    pub fn until_due(&self, now: Instant) -> Duration {
        match self.last_sweep {
            None => Duration::ZERO,
            Some(last) => (last + self.settings.interval).saturating_duration_since(now),
        }
    }

    /// Sweep if due. The cadence only advances after a successful sweep,
    /// so a store outage retries on the next loop.
    pub fn maybe_sweep(&mut self, conn: &Connection) -> Result<Option<ReapReport>> {
        let now = Instant::now();
        if !self.is_due(now) {
            return Ok(None);
        }

        let report = sweep_stale_claims(conn, &self.settings)?;
        self.last_sweep = Some(now);
        Ok(Some(report))
    }
}
