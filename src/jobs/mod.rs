// Conversion job system
//
// Claiming is optimistic: read a candidate id, then flip it to `processing`
// with a statement that only matches while the row is still `pending`.
// Losing that race is normal traffic, not an error.

pub mod backoff;
pub mod executor;
pub mod handshake;
pub mod reaper;
pub mod shutdown;
pub mod worker;


use rusqlite::Connection;

use crate::constants::CLAIM_RACE_RETRIES;
use crate::db::schema::{self, Claim};
use crate::error::Result;

/// Get worker identifier (`host:pid`). Threads of one process share it;
/// per-claim ownership is carried by the run token.
pub fn worker_id() -> String {
    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let pid = std::process::id();
    format!("{}:{}", hostname, pid)
}

/// Claim the newest pending job for `worker_id`.
///
/// Returns `Ok(None)` when there is no pending work, or when every candidate
/// seen in this pick was taken by another claimant first.
pub fn claim_next(conn: &Connection, worker_id: &str) -> Result<Option<Claim>> {
    for attempt in 1..=CLAIM_RACE_RETRIES {
        let candidate = match schema::select_one_candidate(conn)? {
            Some(id) => id,
            None => return Ok(None),
        };

        match schema::try_claim(conn, candidate, worker_id)? {
            Some(claim) => {
                log::info!(
                    "Claimed job {} ({}) attempt #{}",
                    claim.job.id,
                    claim.job.source_path,
                    claim.job.attempts
                );
                return Ok(Some(claim));
            }
            None => {
                log::debug!(
                    "Job {} was claimed elsewhere (pick {}/{})",
                    candidate,
                    attempt,
                    CLAIM_RACE_RETRIES
                );
            }
        }
    }

    Ok(None)
}
