// Daemon configuration: flags with environment fallbacks

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Args;

use crate::constants::*;
use crate::error::{ConvertError, Result};
use crate::jobs::executor::ExecutorSettings;
use crate::jobs::reaper::ReaperSettings;
use crate::jobs::worker::DaemonSettings;
use crate::tools;

/// Load `ENV_FILE` (or `./.env`) into the process environment if present.
/// Variables already set win over the file. Returns the file that was read.
pub fn load_env_file() -> Option<PathBuf> {
    match std::env::var_os("ENV_FILE") {
        Some(path) => dotenvy::from_path(&path).ok().map(|_| PathBuf::from(path)),
        None => dotenvy::dotenv().ok(),
    }
}

/// Store location, shared by the daemon and `camctl`.
#[derive(Args, Debug, Clone)]
pub struct StoreArgs {
    /// SQLite job store
    #[arg(long = "database", env = "DATABASE_PATH", default_value = DEFAULT_DB_PATH)]
    pub db_path: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct ConverterConfig {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Directory that job paths are relative to
    #[arg(long, env = "MEDIA_ROOT", default_value = DEFAULT_MEDIA_ROOT)]
    pub media_root: PathBuf,

    /// Jobs converted at the same time
    #[arg(long, env = "CONVERT_CONCURRENCY", default_value_t = DEFAULT_CONCURRENCY)]
    pub concurrency: usize,

    /// Idle poll delay after the first empty poll (seconds)
    #[arg(long = "backoff-min", env = "BACKOFF_MIN_SECONDS", default_value_t = DEFAULT_BACKOFF_MIN_SECONDS)]
    pub backoff_min_secs: f64,

    /// Longest idle poll delay (seconds)
    #[arg(long = "backoff-max", env = "BACKOFF_MAX_SECONDS", default_value_t = DEFAULT_BACKOFF_MAX_SECONDS)]
    pub backoff_max_secs: f64,

    /// Claims older than this are returned to pending
    #[arg(long, env = "STALE_CLAIM_MINUTES", default_value_t = DEFAULT_STALE_CLAIM_MINUTES)]
    pub stale_claim_minutes: u64,

    /// Seconds between stale-claim sweeps
    #[arg(long = "stale-check-interval", env = "STALE_CLAIM_CHECK_INTERVAL", default_value_t = DEFAULT_STALE_CHECK_INTERVAL_SECONDS)]
    pub stale_check_interval_secs: u64,

    /// Warn about claims older than this many stale thresholds
    #[arg(long, env = "STALE_FLAG_MULTIPLE")]
    pub stale_flag_multiple: Option<u32>,

    /// Per-job ffmpeg timeout (seconds)
    #[arg(long = "convert-timeout", env = "CONVERT_TIMEOUT_SECONDS", default_value_t = DEFAULT_CONVERT_TIMEOUT_SECONDS)]
    pub convert_timeout_secs: u64,

    /// Duration probe timeout (seconds)
    #[arg(long = "probe-timeout", env = "PROBE_TIMEOUT_SECONDS", default_value_t = DEFAULT_PROBE_TIMEOUT_SECONDS)]
    pub probe_timeout_secs: u64,

    /// Pause after deferring a job whose transfer is not finished (seconds)
    #[arg(long = "defer-delay", env = "DEFER_DELAY_SECONDS", default_value_t = DEFAULT_DEFER_DELAY_SECONDS)]
    pub defer_delay_secs: f64,

    /// Pause before reopening the store after a store error (seconds)
    #[arg(long = "reconnect-delay", env = "RECONNECT_DELAY_SECONDS", default_value_t = DEFAULT_RECONNECT_DELAY_SECONDS)]
    pub reconnect_delay_secs: f64,

    /// ffmpeg binary (default: bundled sidecar, then PATH)
    #[arg(long, env = "FFMPEG_PATH")]
    pub ffmpeg: Option<PathBuf>,

    /// ffprobe binary (default: bundled sidecar, then PATH)
    #[arg(long, env = "FFPROBE_PATH")]
    pub ffprobe: Option<PathBuf>,

    /// Append logs to this file instead of stderr
    #[arg(long, env = "LOG_FILE")]
    pub log_file: Option<PathBuf>,
}

fn secs_f64(name: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| ConvertError::Config(format!("{} must be a non-negative number of seconds, got {}", name, value)))
}

impl ConverterConfig {
    pub fn db_path(&self) -> &Path {
        &self.store.db_path
    }

    pub fn ffmpeg_path(&self) -> PathBuf {
        tools::ffmpeg_path(self.ffmpeg.as_deref())
    }

    pub fn ffprobe_path(&self) -> PathBuf {
        tools::ffprobe_path(self.ffprobe.as_deref())
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_claim_minutes.saturating_mul(60))
    }

    pub fn convert_timeout(&self) -> Duration {
        Duration::from_secs(self.convert_timeout_secs)
    }

    /// Reject settings the daemon cannot run with. Suspicious but workable
    /// settings are only logged.
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(ConvertError::Config("concurrency must be at least 1".to_string()));
        }

        let floor = secs_f64("backoff-min", self.backoff_min_secs)?;
        let ceiling = secs_f64("backoff-max", self.backoff_max_secs)?;
        if floor.is_zero() {
            return Err(ConvertError::Config("backoff-min must be positive".to_string()));
        }
        if ceiling < floor {
            return Err(ConvertError::Config(format!(
                "backoff-max ({}s) is below backoff-min ({}s)",
                self.backoff_max_secs, self.backoff_min_secs
            )));
        }
        secs_f64("defer-delay", self.defer_delay_secs)?;
        secs_f64("reconnect-delay", self.reconnect_delay_secs)?;

        let zero_checks = [
            ("stale-claim-minutes", self.stale_claim_minutes),
            ("stale-check-interval", self.stale_check_interval_secs),
            ("convert-timeout", self.convert_timeout_secs),
            ("probe-timeout", self.probe_timeout_secs),
        ];
        for (name, value) in zero_checks {
            if value == 0 {
                return Err(ConvertError::Config(format!("{} must be greater than zero", name)));
            }
        }

        if let Some(multiple) = self.stale_flag_multiple {
            if multiple <= 1 {
                return Err(ConvertError::Config(format!(
                    "stale-flag-multiple must be greater than 1, got {}",
                    multiple
                )));
            }
        }

        if !self.media_root.is_dir() {
            return Err(ConvertError::Config(format!(
                "media root is not a directory: {}",
                self.media_root.display()
            )));
        }

        if self.stale_threshold() <= self.convert_timeout() {
            log::warn!(
                "Stale claim threshold ({}s) does not exceed the convert timeout ({}s); a slow but live job may be reaped",
                self.stale_threshold().as_secs(),
                self.convert_timeout_secs
            );
        }

        Ok(())
    }

    pub fn executor_settings(&self) -> Result<ExecutorSettings> {
        Ok(ExecutorSettings {
            media_root: self.media_root.clone(),
            ffmpeg: self.ffmpeg_path(),
            ffprobe: self.ffprobe_path(),
            convert_timeout: self.convert_timeout(),
            probe_timeout: Duration::from_secs(self.probe_timeout_secs),
            defer_delay: secs_f64("defer-delay", self.defer_delay_secs)?,
        })
    }

    pub fn reaper_settings(&self) -> ReaperSettings {
        ReaperSettings {
            threshold: self.stale_threshold(),
            interval: Duration::from_secs(self.stale_check_interval_secs),
            flag_multiple: self.stale_flag_multiple,
        }
    }

    pub fn daemon_settings(&self) -> Result<DaemonSettings> {
        Ok(DaemonSettings {
            db_path: self.store.db_path.clone(),
            concurrency: self.concurrency,
            backoff_floor: secs_f64("backoff-min", self.backoff_min_secs)?,
            backoff_ceiling: secs_f64("backoff-max", self.backoff_max_secs)?,
            reconnect_delay: secs_f64("reconnect-delay", self.reconnect_delay_secs)?,
            reaper: self.reaper_settings(),
            executor: self.executor_settings()?,
        })
    }

    /// Transcoder availability: ffmpeg is required, ffprobe is best effort.
    pub fn check_tools(&self) -> Result<()> {
        let ffmpeg = self.ffmpeg_path();
        if !tools::is_tool_available(&ffmpeg) {
            return Err(ConvertError::Config(format!(
                "ffmpeg not found or not runnable: {}",
                ffmpeg.display()
            )));
        }

        let ffprobe = self.ffprobe_path();
        if !tools::is_tool_available(&ffprobe) {
            log::warn!(
                "ffprobe not available ({}); completed jobs will record the default duration of {}s",
                ffprobe.display(),
                DEFAULT_DURATION_SECONDS
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use tempfile::TempDir;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        config: ConverterConfig,
    }

    fn parse(args: &[&str]) -> ConverterConfig {
        let mut argv = vec!["mp4-converter"];
        argv.extend_from_slice(args);
        TestCli::try_parse_from(argv).unwrap().config
    }

    #[test]
    fn test_flags_override_defaults() {
        let media = TempDir::new().unwrap();
        let root = media.path().to_string_lossy().to_string();
        let config = parse(&[
            "--media-root", &root,
            "--database", "/tmp/jobs.db",
            "--concurrency", "4",
            "--backoff-min", "0.25",
            "--stale-claim-minutes", "10",
            "--stale-flag-multiple", "3",
        ]);

        assert_eq!(config.concurrency, 4);
        assert_eq!(config.db_path(), Path::new("/tmp/jobs.db"));
        assert_eq!(config.stale_threshold(), Duration::from_secs(600));
        config.validate().unwrap();

        let daemon = config.daemon_settings().unwrap();
        assert_eq!(daemon.backoff_floor, Duration::from_millis(250));
        assert_eq!(daemon.reaper.flag_multiple, Some(3));
        assert_eq!(daemon.executor.media_root, media.path());
    }

    #[test]
    fn test_rejects_unusable_settings() {
        let media = TempDir::new().unwrap();
        let root = media.path().to_string_lossy().to_string();

        let bad: &[&[&str]] = &[
            &["--concurrency", "0"],
            &["--backoff-min", "0"],
            &["--backoff-min", "5", "--backoff-max", "1"],
            &["--convert-timeout", "0"],
            &["--stale-check-interval", "0"],
            &["--stale-flag-multiple", "1"],
        ];
        for extra in bad {
            let mut args = vec!["--media-root", root.as_str()];
            args.extend_from_slice(extra);
            let config = parse(&args);
            assert!(matches!(config.validate(), Err(ConvertError::Config(_))), "{:?}", extra);
        }
    }

    #[test]
    fn test_missing_media_root_is_rejected() {
        let config = parse(&["--media-root", "/definitely/not/here/camcentral"]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_equal_stale_threshold_only_warns() {
        let media = TempDir::new().unwrap();
        let root = media.path().to_string_lossy().to_string();
        let config = parse(&["--media-root", &root, "--stale-claim-minutes", "5", "--convert-timeout", "300"]);
        assert!(config.validate().is_ok());
    }
}
