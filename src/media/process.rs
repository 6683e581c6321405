// Bounded subprocess execution
//
// std::process has no wait-with-timeout, so the child is polled with try_wait
// while stdout/stderr drain on helper threads (a full pipe would otherwise
// stall the child and turn every large diagnostic into a timeout).

use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::constants::PROCESS_POLL_INTERVAL_MS;

/// How a bounded child process ended.
#[derive(Debug)]
pub enum ProcessOutcome {
    Exited {
        status: ExitStatus,
        stdout: String,
        stderr: String,
    },
    /// Wall-clock limit hit; the child was killed and reaped.
    TimedOut { stderr: String },
}

impl ProcessOutcome {
    pub fn success(&self) -> bool {
        matches!(self, ProcessOutcome::Exited { status, .. } if status.success())
    }

    pub fn stderr(&self) -> &str {
        match self {
            ProcessOutcome::Exited { stderr, .. } => stderr,
            ProcessOutcome::TimedOut { stderr } => stderr,
        }
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<String>> {
    pipe.map(|mut r| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = r.read_to_end(&mut buf);
            String::from_utf8_lossy(&buf).trim().to_string()
        })
    })
}

fn collect(handle: Option<JoinHandle<String>>) -> String {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

/// Spawn `cmd` and wait at most `timeout` for it to exit.
/// Spawn failures (e.g. binary not found) are returned as IO errors.
pub fn run_with_timeout(mut cmd: Command, timeout: Duration) -> std::io::Result<ProcessOutcome> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child: Child = cmd.spawn()?;
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let deadline = Instant::now() + timeout;
    let poll = Duration::from_millis(PROCESS_POLL_INTERVAL_MS);

    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(ProcessOutcome::Exited {
                status,
                stdout: collect(stdout),
                stderr: collect(stderr),
            });
        }

        let now = Instant::now();
        if now >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            // Discard stdout; the run is void
            drop(collect(stdout));
            return Ok(ProcessOutcome::TimedOut { stderr: collect(stderr) });
        }

        std::thread::sleep(poll.min(deadline - now));
    }
}
