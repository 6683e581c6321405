// Conversion daemon: bounded worker pool plus the claim/poll loop.
//
// Each loop tick: sweep stale claims when due, reap finished workers, claim
// up to the number of free slots, then either reset the backoff (claimed
// something) or sleep it (empty poll). When the pool is full the loop blocks
// on a worker finishing instead of polling. Shutdown stops claiming at once
// and waits for in-flight jobs to reach a terminal or deferred state.

use std::collections::HashMap;
use std::path::PathBuf;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};

use crate::db::schema::{self, Claim};
use crate::db::Store;
use crate::error::{ConvertError, Result};
use crate::jobs::backoff::Backoff;
use crate::jobs::executor::{self, ExecutorSettings, Outcome};
use crate::jobs::reaper::{Reaper, ReaperSettings};
use crate::jobs::shutdown::Shutdown;
use crate::jobs::{claim_next, worker_id};

#[derive(Debug, Clone)]
pub struct DaemonSettings {
    pub db_path: PathBuf,
    pub concurrency: usize,
    pub backoff_floor: Duration,
    pub backoff_ceiling: Duration,
    pub reconnect_delay: Duration,
    pub reaper: ReaperSettings,
    pub executor: ExecutorSettings,
}

/// Totals over one daemon run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DaemonStats {
    pub claimed: usize,
    pub completed: usize,
    pub failed: usize,
    pub deferred: usize,
    pub superseded: usize,
    /// Workers that ended with a store error (job left for the reaper).
    pub errored: usize,
    pub reaped: usize,
    /// Store connections recreated after a poll-loop store error.
    pub reconnects: usize,
    /// Most workers ever running at once.
    pub peak_in_flight: usize,
}

impl DaemonStats {
    fn record(&mut self, result: &Result<Outcome>) {
        match result {
            Ok(Outcome::Complete { .. }) => self.completed += 1,
            Ok(Outcome::Failed { .. }) => self.failed += 1,
            Ok(Outcome::Deferred) => self.deferred += 1,
            Ok(Outcome::Superseded) => self.superseded += 1,
            Err(_) => self.errored += 1,
        }
    }
}

struct JobReport {
    slot: u64,
    job_id: i64,
    result: Result<Outcome>,
}

/// Up to `capacity` jobs running on their own threads, each with its own
/// store connection.
///
/// Workers are tracked per spawn, not per job: a deferred job can be
/// re-claimed here while its first worker is still sleeping out the delay.
pub struct WorkerPool {
    capacity: usize,
    db_path: PathBuf,
    settings: ExecutorSettings,
    shutdown: Shutdown,
    in_flight: HashMap<u64, JoinHandle<()>>,
    next_slot: u64,
    done_tx: Sender<JobReport>,
    done_rx: Receiver<JobReport>,
}

impl WorkerPool {
    pub fn new(capacity: usize, db_path: PathBuf, settings: ExecutorSettings, shutdown: Shutdown) -> Self {
        let (done_tx, done_rx) = crossbeam_channel::unbounded();
        Self {
            capacity: capacity.max(1),
            db_path,
            settings,
            shutdown,
            in_flight: HashMap::new(),
            next_slot: 0,
            done_tx,
            done_rx,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn free_slots(&self) -> usize {
        self.capacity.saturating_sub(self.in_flight.len())
    }

    /// Hand a claimed job to a new worker thread.
    pub fn spawn(&mut self, claim: Claim) -> Result<()> {
        let job_id = claim.job.id;
        let slot = self.next_slot;
        self.next_slot += 1;
        let db_path = self.db_path.clone();
        let settings = self.settings.clone();
        let shutdown = self.shutdown.clone();
        let done_tx = self.done_tx.clone();

        let handle = std::thread::Builder::new()
            .name(format!("mp4w-{}", job_id))
            .spawn(move || {
                let result = run_claimed_job(&db_path, &claim, &settings, &shutdown);
                let _ = done_tx.send(JobReport { slot, job_id, result });
            })?;

        self.in_flight.insert(slot, handle);
        Ok(())
    }

    /// Collect every worker that has already finished, without blocking.
    pub fn reap_finished(&mut self, stats: &mut DaemonStats) -> usize {
        let mut reaped = 0;
        while let Ok(report) = self.done_rx.try_recv() {
            self.finish(report, stats);
            reaped += 1;
        }
        reaped + self.reap_silent_exits(stats)
    }

    /// Block until a worker finishes, shutdown is requested, or `timeout` passes.
    pub fn wait_for_completion(&mut self, timeout: Duration, stats: &mut DaemonStats) {
        let done_rx = self.done_rx.clone();
        let shutdown_rx = self.shutdown.receiver().clone();
        let report = crossbeam_channel::select! {
            recv(done_rx) -> report => report.ok(),
            recv(shutdown_rx) -> _ => None,
            default(timeout) => None,
        };
        if let Some(report) = report {
            self.finish(report, stats);
        }
        self.reap_finished(stats);
    }

    /// Wait for every in-flight job to finish.
    pub fn drain(&mut self, stats: &mut DaemonStats) {
        if !self.in_flight.is_empty() {
            log::info!(
                "Shutdown: waiting for {} in-flight conversion(s) to finish...",
                self.in_flight.len()
            );
        }
        while !self.in_flight.is_empty() {
            match self.done_rx.recv_timeout(Duration::from_secs(1)) {
                Ok(report) => self.finish(report, stats),
                Err(_) => {
                    self.reap_silent_exits(stats);
                }
            }
        }
    }

    fn finish(&mut self, report: JobReport, stats: &mut DaemonStats) {
        if let Some(handle) = self.in_flight.remove(&report.slot) {
            let _ = handle.join();
        }
        match &report.result {
            Ok(outcome) => log::debug!("Job {}: worker finished ({})", report.job_id, outcome.label()),
            Err(e) => log::error!("Job {}: worker error: {}", report.job_id, e),
        }
        stats.record(&report.result);
    }

    /// Threads that ended without reporting (should not happen; panics are
    /// caught inside the worker) still free their slot.
    fn reap_silent_exits(&mut self, stats: &mut DaemonStats) -> usize {
        let gone: Vec<u64> = self
            .in_flight
            .iter()
            .filter(|(_, h)| h.is_finished())
            .map(|(slot, _)| *slot)
            .collect();

        let mut reaped = 0;
        for slot in gone {
            // A report may have landed between the scan and now
            if let Ok(report) = self.done_rx.try_recv() {
                self.finish(report, stats);
                reaped += 1;
                continue;
            }
            if let Some(handle) = self.in_flight.remove(&slot) {
                let _ = handle.join();
                log::error!("Worker {}: exited without a report", slot);
                stats.errored += 1;
                reaped += 1;
            }
        }
        reaped
    }
}

/// Worker body: own connection, panic isolation, executor run.
fn run_claimed_job(
    db_path: &std::path::Path,
    claim: &Claim,
    settings: &ExecutorSettings,
    shutdown: &Shutdown,
) -> Result<Outcome> {
    let store = Store::open(db_path)?;
    let conn = store.conn();

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        executor::execute(conn, claim, settings, shutdown)
    }));

    match result {
        Ok(result) => result,
        Err(_) => {
            log::error!("Job {}: worker panicked (recovered)", claim.job.id);
            let reason = "worker panicked during conversion";
            if schema::mark_failed(conn, claim.job.id, &claim.run_token, reason)? {
                Ok(Outcome::Failed { reason: reason.to_string() })
            } else {
                Ok(Outcome::Superseded)
            }
        }
    }
}

/// Drop the store connection and open a new one after a store error.
fn reconnect(store: &mut Store, delay: Duration, shutdown: &Shutdown, stats: &mut DaemonStats) {
    log::warn!("Store connection lost or stale; recreating");
    if shutdown.wait(delay) {
        return;
    }
    match store.reset() {
        Ok(()) => stats.reconnects += 1,
        Err(e) => {
            log::error!("Store reconnect failed: {}", e);
            shutdown.wait(delay);
        }
    }
}

/// Run the conversion daemon until `shutdown` is triggered, then drain.
pub fn run_daemon(settings: &DaemonSettings, shutdown: &Shutdown) -> Result<DaemonStats> {
    let mut store = Store::open(&settings.db_path).map_err(ConvertError::from)?;
    let worker_id = worker_id();

    let mut pool = WorkerPool::new(
        settings.concurrency,
        settings.db_path.clone(),
        settings.executor.clone(),
        shutdown.clone(),
    );
    let mut backoff = Backoff::new(settings.backoff_floor, settings.backoff_ceiling);
    let mut reaper = Reaper::new(settings.reaper.clone());
    let mut stats = DaemonStats::default();

    log::info!(
        "=== MP4 Converter: starting up as {} (concurrency={}, backoff=[{:?}..{:?}], stale>{}s every {}s) ===",
        worker_id,
        settings.concurrency,
        settings.backoff_floor,
        settings.backoff_ceiling,
        settings.reaper.threshold.as_secs(),
        settings.reaper.interval.as_secs()
    );

    while !shutdown.is_requested() {
        match reaper.maybe_sweep(store.conn()) {
            Ok(Some(report)) => stats.reaped += report.reset,
            Ok(None) => {}
            Err(e) => {
                log::error!("Stale claim recovery failed: {}", e);
                if e.is_store_error() {
                    reconnect(&mut store, settings.reconnect_delay, shutdown, &mut stats);
                    continue;
                }
            }
        }

        pool.reap_finished(&mut stats);

        let free = pool.free_slots();
        if free == 0 {
            let tick = reaper.until_due(Instant::now()).max(Duration::from_millis(100));
            pool.wait_for_completion(tick, &mut stats);
            continue;
        }

        let mut claimed_any = false;
        let mut store_failed = false;

        for _ in 0..free {
            if shutdown.is_requested() {
                break;
            }
            match claim_next(store.conn(), &worker_id) {
                Ok(Some(claim)) => {
                    claimed_any = true;
                    stats.claimed += 1;
                    let job_id = claim.job.id;
                    if let Err(e) = pool.spawn(claim) {
                        // Left in `processing`; the reaper hands it back later
                        log::error!("Job {}: could not start worker thread: {}", job_id, e);
                    }
                    stats.peak_in_flight = stats.peak_in_flight.max(pool.in_flight());
                }
                Ok(None) => break,
                Err(e) => {
                    log::error!("Claim attempt failed: {}", e);
                    store_failed = e.is_store_error();
                    break;
                }
            }
        }

        if store_failed {
            // Backoff is untouched by store outages
            reconnect(&mut store, settings.reconnect_delay, shutdown, &mut stats);
            continue;
        }

        if claimed_any {
            backoff.reset();
        } else {
            let delay = backoff.next_delay();
            log::debug!("No work claimed, sleeping for {:?}", delay);
            shutdown.wait(delay);
        }
    }

    pool.drain(&mut stats);
    log::info!("=== MP4 Converter: clean shutdown ({:?}) ===", stats);
    Ok(stats)
}

/// Claim and run at most one job on the calling thread.
pub fn run_once(settings: &DaemonSettings) -> Result<Option<(i64, Outcome)>> {
    let store = Store::open(&settings.db_path).map_err(ConvertError::from)?;
    let claim = match claim_next(store.conn(), &worker_id())? {
        Some(c) => c,
        None => return Ok(None),
    };

    let job_id = claim.job.id;
    let outcome = executor::execute(store.conn(), &claim, &settings.executor, &Shutdown::new())?;
    Ok(Some((job_id, outcome)))
}
