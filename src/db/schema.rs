// Database schema types and query helpers
//
// Every mutation here is a single conditional statement. Correctness under
// concurrent daemons rests on those WHERE clauses, never on a read that
// happened earlier.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{Connection, params, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::{RELEASE_DEFERRED, RELEASE_REAPED};
use crate::error::{ConvertError, Result};
use crate::media;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

const JOB_COLUMNS: &str = "id, source_path, output_path, status, claimed_by, claimed_at, run_token,
    attempts, release_reason, last_error, result_duration, created_at, completed_at";

/// Format a timestamp the same way SQLite's `strftime('%Y-%m-%d %H:%M:%f', 'now')` does,
/// so stored values and Rust-computed cutoffs compare correctly as text.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Parse a stored timestamp (with or without milliseconds).
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

// ----- Status -----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Complete,
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Complete,
        JobStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Complete => "complete",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ConvertError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "complete" => Ok(JobStatus::Complete),
            "failed" => Ok(JobStatus::Failed),
            other => Err(ConvertError::Other(format!("Unknown job status: {}", other))),
        }
    }
}

impl ToSql for JobStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for JobStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value.as_str()?.parse().map_err(|_| FromSqlError::InvalidType)
    }
}

/// Why a claimed job went back to `pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReleaseReason {
    /// The readiness marker was missing; picked up again on a later poll.
    Deferred,
    /// The claim went stale and the reaper took it back.
    Reaped,
}

impl ReleaseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseReason::Deferred => RELEASE_DEFERRED,
            ReleaseReason::Reaped => RELEASE_REAPED,
        }
    }
}

impl ToSql for ReleaseReason {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for ReleaseReason {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            RELEASE_DEFERRED => Ok(ReleaseReason::Deferred),
            RELEASE_REAPED => Ok(ReleaseReason::Reaped),
            _ => Err(FromSqlError::InvalidType),
        }
    }
}

// ----- Jobs -----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub source_path: String,
    pub output_path: String,
    pub status: JobStatus,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<String>,
    pub run_token: Option<String>,
    pub attempts: i64,
    pub release_reason: Option<ReleaseReason>,
    pub last_error: Option<String>,
    pub result_duration: Option<i64>,
    pub created_at: String,
    pub completed_at: Option<String>,
}

/// Proof of ownership returned by a successful [`try_claim`].
/// Terminal writes and releases must present the run token.
#[derive(Debug, Clone)]
pub struct Claim {
    pub job: Job,
    pub run_token: String,
}

fn map_job(row: &rusqlite::Row) -> rusqlite::Result<Job> {
    Ok(Job {
        id: row.get(0)?,
        source_path: row.get(1)?,
        output_path: row.get(2)?,
        status: row.get(3)?,
        claimed_by: row.get(4)?,
        claimed_at: row.get(5)?,
        run_token: row.get(6)?,
        attempts: row.get(7)?,
        release_reason: row.get(8)?,
        last_error: row.get(9)?,
        result_duration: row.get(10)?,
        created_at: row.get(11)?,
        completed_at: row.get(12)?,
    })
}

/// Create a pending job for a raw video (upstream producer contract).
/// Enqueueing the same source twice returns the existing job id.
pub fn insert_job(conn: &Connection, source_path: &str) -> Result<i64> {
    let source = media::normalize_relative(source_path)?;
    let output = media::derive_output_path(&source);

    conn.execute(
        "INSERT INTO jobs (source_path, output_path) VALUES (?1, ?2)
         ON CONFLICT(source_path) DO NOTHING",
        params![source, output],
    )?;

    let id = conn.query_row(
        "SELECT id FROM jobs WHERE source_path = ?1",
        params![source],
        |row| row.get(0),
    )?;
    Ok(id)
}

pub fn get_job(conn: &Connection, id: i64) -> Result<Option<Job>> {
    let job = conn
        .query_row(
            &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
            params![id],
            map_job,
        )
        .optional()?;
    Ok(job)
}

pub fn list_jobs(conn: &Connection, status: Option<JobStatus>, limit: i64) -> Result<Vec<Job>> {
    let jobs = match status {
        Some(st) => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM jobs WHERE status = ?1 ORDER BY created_at DESC, id DESC LIMIT ?2",
                JOB_COLUMNS
            ))?;
            let rows = stmt.query_map(params![st, limit], map_job)?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        }
        None => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM jobs ORDER BY created_at DESC, id DESC LIMIT ?1",
                JOB_COLUMNS
            ))?;
            let rows = stmt.query_map(params![limit], map_job)?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        }
    };
    Ok(jobs)
}

/// Count jobs per status; statuses with no rows are reported as zero.
pub fn count_jobs_by_status(conn: &Connection) -> Result<Vec<(JobStatus, i64)>> {
    let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status")?;
    let found = stmt
        .query_map([], |row| Ok((row.get::<_, JobStatus>(0)?, row.get::<_, i64>(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(JobStatus::ALL
        .iter()
        .map(|st| {
            let n = found.iter().find(|(s, _)| s == st).map(|(_, n)| *n).unwrap_or(0);
            (*st, n)
        })
        .collect())
}

/// Newest pending job id. This is a hint, not a lock: the row may be gone
/// or claimed by someone else by the time [`try_claim`] runs.
pub fn select_one_candidate(conn: &Connection) -> Result<Option<i64>> {
    let id = conn
        .query_row(
            "SELECT id FROM jobs WHERE status = 'pending'
             ORDER BY created_at DESC, id DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id)
}

/// Conditionally move a job from `pending` to `processing`.
/// Returns `None` when the job is no longer pending or no longer exists.
pub fn try_claim(conn: &Connection, job_id: i64, worker_id: &str) -> Result<Option<Claim>> {
    let run_token = Uuid::new_v4().to_string();

    let job = conn
        .query_row(
            &format!(
                "UPDATE jobs
                 SET status = 'processing',
                     claimed_by = ?1,
                     claimed_at = strftime('%Y-%m-%d %H:%M:%f', 'now'),
                     run_token = ?2,
                     attempts = attempts + 1,
                     release_reason = NULL
                 WHERE id = ?3 AND status = 'pending'
                 RETURNING {}",
                JOB_COLUMNS
            ),
            params![worker_id, run_token, job_id],
            map_job,
        )
        .optional()?;

    Ok(job.map(|job| Claim { job, run_token }))
}

/// Terminal success write. A no-op (returns false) unless the job is still
/// `processing` under this run token.
pub fn mark_complete(
    conn: &Connection,
    job_id: i64,
    run_token: &str,
    output_path: &str,
    duration_secs: i64,
) -> Result<bool> {
    let rows = conn.execute(
        "UPDATE jobs
         SET status = 'complete',
             output_path = ?1,
             result_duration = ?2,
             last_error = NULL,
             completed_at = strftime('%Y-%m-%d %H:%M:%f', 'now'),
             claimed_by = NULL, claimed_at = NULL, run_token = NULL
         WHERE id = ?3 AND status = 'processing' AND run_token = ?4",
        params![output_path, duration_secs, job_id, run_token],
    )?;
    Ok(rows > 0)
}

/// Terminal failure write with diagnostic text. Same precondition as [`mark_complete`].
pub fn mark_failed(conn: &Connection, job_id: i64, run_token: &str, error: &str) -> Result<bool> {
    let rows = conn.execute(
        "UPDATE jobs
         SET status = 'failed',
             last_error = ?1,
             completed_at = strftime('%Y-%m-%d %H:%M:%f', 'now'),
             claimed_by = NULL, claimed_at = NULL, run_token = NULL
         WHERE id = ?2 AND status = 'processing' AND run_token = ?3",
        params![error, job_id, run_token],
    )?;
    Ok(rows > 0)
}

/// Whether `run_token` still owns the job's current claim.
pub fn claim_is_current(conn: &Connection, job_id: i64, run_token: &str) -> Result<bool> {
    let owned = conn
        .query_row(
            "SELECT 1 FROM jobs WHERE id = ?1 AND status = 'processing' AND run_token = ?2",
            params![job_id, run_token],
            |_| Ok(()),
        )
        .optional()?;
    Ok(owned.is_some())
}

/// Give a claimed job back to the pool without a terminal outcome.
pub fn release_to_pending(
    conn: &Connection,
    job_id: i64,
    run_token: &str,
    reason: ReleaseReason,
) -> Result<bool> {
    let rows = conn.execute(
        "UPDATE jobs
         SET status = 'pending',
             release_reason = ?1,
             claimed_by = NULL, claimed_at = NULL, run_token = NULL
         WHERE id = ?2 AND status = 'processing' AND run_token = ?3",
        params![reason, job_id, run_token],
    )?;
    Ok(rows > 0)
}

// ----- Stale claims -----

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleClaim {
    pub id: i64,
    pub claimed_by: String,
    pub claimed_at: String,
}

/// Jobs stuck in `processing` with a claim older than `cutoff`.
pub fn find_stale_claims(conn: &Connection, cutoff: DateTime<Utc>) -> Result<Vec<StaleClaim>> {
    let mut stmt = conn.prepare(
        "SELECT id, claimed_by, claimed_at FROM jobs
         WHERE status = 'processing' AND claimed_at < ?1
         ORDER BY claimed_at ASC",
    )?;
    let claims = stmt
        .query_map(params![format_timestamp(cutoff)], |row| {
            Ok(StaleClaim {
                id: row.get(0)?,
                claimed_by: row.get(1)?,
                claimed_at: row.get(2)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(claims)
}

/// Reset one stale claim, but only if nobody re-claimed the job since it was read.
pub fn reset_stale_claim(conn: &Connection, claim: &StaleClaim) -> Result<bool> {
    let rows = conn.execute(
        "UPDATE jobs
         SET status = 'pending',
             release_reason = 'reaped',
             claimed_by = NULL, claimed_at = NULL, run_token = NULL
         WHERE id = ?1 AND status = 'processing' AND claimed_by = ?2 AND claimed_at = ?3",
        params![claim.id, claim.claimed_by, claim.claimed_at],
    )?;
    Ok(rows > 0)
}

/// Operator intervention: put a failed job back in the queue.
pub fn retry_failed_job(conn: &Connection, job_id: i64) -> Result<bool> {
    if get_job(conn, job_id)?.is_none() {
        return Err(ConvertError::JobNotFound(job_id));
    }

    let rows = conn.execute(
        "UPDATE jobs
         SET status = 'pending', completed_at = NULL, result_duration = NULL, release_reason = NULL
         WHERE id = ?1 AND status = 'failed'",
        params![job_id],
    )?;
    Ok(rows > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::migrations::run_migrations(&conn).unwrap();
        conn
    }

    fn backdate_claim(conn: &Connection, id: i64, secs: i64) {
        let ts = format_timestamp(Utc::now() - chrono::Duration::seconds(secs));
        conn.execute("UPDATE jobs SET claimed_at = ?1 WHERE id = ?2", params![ts, id]).unwrap();
    }

    #[test]
    fn test_insert_derives_output_path() {
        let conn = setup_db();
        let id = insert_job(&conn, "/cam1/2024/event_0001.h264").unwrap();
        let job = get_job(&conn, id).unwrap().unwrap();

        assert_eq!(job.source_path, "cam1/2024/event_0001.h264");
        assert_eq!(job.output_path, "cam1/2024/event_0001.mp4");
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.claimed_by.is_none());
        assert_eq!(job.attempts, 0);
    }

    #[test]
    fn test_insert_is_idempotent_per_source() {
        let conn = setup_db();
        let a = insert_job(&conn, "cam1/a.h264").unwrap();
        let b = insert_job(&conn, "cam1/a.h264").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_insert_rejects_parent_traversal() {
        let conn = setup_db();
        assert!(insert_job(&conn, "../etc/passwd.h264").is_err());
    }

    #[test]
    fn test_candidate_is_newest_first() {
        let conn = setup_db();
        let old = insert_job(&conn, "cam1/old.h264").unwrap();
        let new = insert_job(&conn, "cam1/new.h264").unwrap();
        conn.execute(
            "UPDATE jobs SET created_at = '2020-01-01 00:00:00.000' WHERE id = ?1",
            params![old],
        )
        .unwrap();

        assert_eq!(select_one_candidate(&conn).unwrap(), Some(new));
    }

    #[test]
    fn test_no_candidate_when_empty() {
        let conn = setup_db();
        assert_eq!(select_one_candidate(&conn).unwrap(), None);
    }

    #[test]
    fn test_claim_sets_ownership_once() {
        let conn = setup_db();
        let id = insert_job(&conn, "cam1/a.h264").unwrap();

        let claim = try_claim(&conn, id, "host-a:1").unwrap().unwrap();
        assert_eq!(claim.job.status, JobStatus::Processing);
        assert_eq!(claim.job.claimed_by.as_deref(), Some("host-a:1"));
        assert!(claim.job.claimed_at.is_some());
        assert_eq!(claim.job.run_token.as_deref(), Some(claim.run_token.as_str()));
        assert_eq!(claim.job.attempts, 1);

        // Second claimant loses without an error
        assert!(try_claim(&conn, id, "host-b:2").unwrap().is_none());
        let job = get_job(&conn, id).unwrap().unwrap();
        assert_eq!(job.claimed_by.as_deref(), Some("host-a:1"));
    }

    #[test]
    fn test_claim_missing_row_is_no_work() {
        let conn = setup_db();
        assert!(try_claim(&conn, 4242, "host:1").unwrap().is_none());
    }

    #[test]
    fn test_terminal_write_is_single_shot() {
        let conn = setup_db();
        let id = insert_job(&conn, "cam1/a.h264").unwrap();
        let claim = try_claim(&conn, id, "host:1").unwrap().unwrap();

        assert!(mark_complete(&conn, id, &claim.run_token, "cam1/a.mp4", 42).unwrap());
        // Duplicate terminal writes do not touch the row
        assert!(!mark_complete(&conn, id, &claim.run_token, "cam1/a.mp4", 7).unwrap());
        assert!(!mark_failed(&conn, id, &claim.run_token, "late failure").unwrap());

        let job = get_job(&conn, id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Complete);
        assert_eq!(job.result_duration, Some(42));
        assert!(job.last_error.is_none());
        assert!(job.claimed_by.is_none());
        assert!(job.claimed_at.is_none());
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn test_stale_token_cannot_write() {
        let conn = setup_db();
        let id = insert_job(&conn, "cam1/a.h264").unwrap();
        let first = try_claim(&conn, id, "host:1").unwrap().unwrap();
        assert!(release_to_pending(&conn, id, &first.run_token, ReleaseReason::Deferred).unwrap());
        let second = try_claim(&conn, id, "host:1").unwrap().unwrap();

        assert!(!mark_failed(&conn, id, &first.run_token, "old run").unwrap());
        assert!(mark_failed(&conn, id, &second.run_token, "new run").unwrap());

        let job = get_job(&conn, id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.last_error.as_deref(), Some("new run"));
        assert_eq!(job.attempts, 2);
    }

    #[test]
    fn test_deferred_release_records_reason() {
        let conn = setup_db();
        let id = insert_job(&conn, "cam1/a.h264").unwrap();
        let claim = try_claim(&conn, id, "host:1").unwrap().unwrap();

        assert!(release_to_pending(&conn, id, &claim.run_token, ReleaseReason::Deferred).unwrap());
        let job = get_job(&conn, id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.release_reason, Some(ReleaseReason::Deferred));
        assert!(job.claimed_by.is_none());
        assert!(job.claimed_at.is_none());

        // Re-claimable, and the reason clears on claim
        let again = try_claim(&conn, id, "host:2").unwrap().unwrap();
        assert!(again.job.release_reason.is_none());
    }

    #[test]
    fn test_stale_claims_found_and_reset() {
        let conn = setup_db();
        let stale = insert_job(&conn, "cam1/stale.h264").unwrap();
        let fresh = insert_job(&conn, "cam1/fresh.h264").unwrap();
        try_claim(&conn, stale, "dead:1").unwrap().unwrap();
        try_claim(&conn, fresh, "alive:2").unwrap().unwrap();
        backdate_claim(&conn, stale, 600);

        let cutoff = Utc::now() - chrono::Duration::seconds(300);
        let claims = find_stale_claims(&conn, cutoff).unwrap();
        assert_eq!(claims.len(), 1);
        assert_eq!(claims[0].id, stale);

        assert!(reset_stale_claim(&conn, &claims[0]).unwrap());
        let job = get_job(&conn, stale).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.release_reason, Some(ReleaseReason::Reaped));
        assert!(job.claimed_by.is_none());

        let other = get_job(&conn, fresh).unwrap().unwrap();
        assert_eq!(other.status, JobStatus::Processing);
    }

    #[test]
    fn test_reset_skips_reclaimed_job() {
        let conn = setup_db();
        let id = insert_job(&conn, "cam1/a.h264").unwrap();
        try_claim(&conn, id, "dead:1").unwrap().unwrap();
        backdate_claim(&conn, id, 600);

        let cutoff = Utc::now() - chrono::Duration::seconds(300);
        let claims = find_stale_claims(&conn, cutoff).unwrap();

        // Claim is reset and re-taken between the read and the reset
        conn.execute(
            "UPDATE jobs SET claimed_by = 'live:2', claimed_at = strftime('%Y-%m-%d %H:%M:%f', 'now') WHERE id = ?1",
            params![id],
        )
        .unwrap();

        assert!(!reset_stale_claim(&conn, &claims[0]).unwrap());
        let job = get_job(&conn, id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.claimed_by.as_deref(), Some("live:2"));
    }

    #[test]
    fn test_retry_only_from_failed() {
        let conn = setup_db();
        let id = insert_job(&conn, "cam1/a.h264").unwrap();
        assert!(!retry_failed_job(&conn, id).unwrap());

        let claim = try_claim(&conn, id, "host:1").unwrap().unwrap();
        mark_failed(&conn, id, &claim.run_token, "ffmpeg exited with code 1").unwrap();
        assert!(retry_failed_job(&conn, id).unwrap());

        let job = get_job(&conn, id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.completed_at.is_none());
        assert_eq!(job.last_error.as_deref(), Some("ffmpeg exited with code 1"));

        assert!(matches!(retry_failed_job(&conn, 999), Err(ConvertError::JobNotFound(999))));
    }

    #[test]
    fn test_counts_include_empty_statuses() {
        let conn = setup_db();
        insert_job(&conn, "cam1/a.h264").unwrap();
        insert_job(&conn, "cam1/b.h264").unwrap();

        let counts = count_jobs_by_status(&conn).unwrap();
        assert_eq!(counts.len(), 4);
        assert!(counts.contains(&(JobStatus::Pending, 2)));
        assert!(counts.contains(&(JobStatus::Failed, 0)));
    }

    #[test]
    fn test_list_jobs_filters_status() {
        let conn = setup_db();
        let a = insert_job(&conn, "cam1/a.h264").unwrap();
        insert_job(&conn, "cam1/b.h264").unwrap();
        try_claim(&conn, a, "host:1").unwrap().unwrap();

        let processing = list_jobs(&conn, Some(JobStatus::Processing), 10).unwrap();
        assert_eq!(processing.len(), 1);
        assert_eq!(processing[0].id, a);
        assert_eq!(list_jobs(&conn, None, 10).unwrap().len(), 2);
    }

    #[test]
    fn test_timestamp_round_trip_with_sqlite_format() {
        let conn = setup_db();
        let now: String = conn
            .query_row("SELECT strftime('%Y-%m-%d %H:%M:%f', 'now')", [], |row| row.get(0))
            .unwrap();
        let parsed = parse_timestamp(&now).unwrap();
        assert!((Utc::now() - parsed).num_seconds().abs() < 5);
        assert!(parse_timestamp("2024-05-01 10:00:00").is_some());
        assert!(parse_timestamp("yesterday").is_none());
    }
}
