// Camera Central Constants
// Defaults mirror the values the capture side and the upstream API already assume.

// Store
pub const DEFAULT_DB_PATH: &str = "camcentral.db";
pub const DB_BUSY_TIMEOUT_MS: u64 = 5_000;

// Media layout
pub const DEFAULT_MEDIA_ROOT: &str = "/mnt/sdcard/security_camera/security_footage";
pub const RAW_VIDEO_EXTENSION: &str = "h264";
pub const OUTPUT_EXTENSION: &str = "mp4";
pub const READY_SUFFIX: &str = ".READY";
pub const TEMP_SUFFIX: &str = ".tmp";

// Worker pool and backoff
pub const DEFAULT_CONCURRENCY: usize = 2;
pub const DEFAULT_BACKOFF_MIN_SECONDS: f64 = 0.5;
pub const DEFAULT_BACKOFF_MAX_SECONDS: f64 = 7.0;
pub const DEFAULT_DEFER_DELAY_SECONDS: f64 = 2.0;
pub const DEFAULT_RECONNECT_DELAY_SECONDS: f64 = 3.0;

// Stale claim recovery
pub const DEFAULT_STALE_CLAIM_MINUTES: u64 = 5;
pub const DEFAULT_STALE_CHECK_INTERVAL_SECONDS: u64 = 60;

// Lost claim races retried inside a single pick before reporting "no work"
pub const CLAIM_RACE_RETRIES: usize = 3;

// Transcoder
pub const DEFAULT_CONVERT_TIMEOUT_SECONDS: u64 = 300;
pub const DEFAULT_PROBE_TIMEOUT_SECONDS: u64 = 30;
pub const FFMPEG_THREADS: u32 = 2;
pub const DEFAULT_DURATION_SECONDS: i64 = 60;
pub const PROCESS_POLL_INTERVAL_MS: u64 = 50;

// Release reasons recorded when a claim returns to pending
pub const RELEASE_DEFERRED: &str = "deferred";
pub const RELEASE_REAPED: &str = "reaped";
