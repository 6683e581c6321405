// Camera Central MP4 converter daemon

use anyhow::Result;
use clap::Parser;

use camcentral_lib::config::{load_env_file, ConverterConfig};
use camcentral_lib::jobs::shutdown::Shutdown;
use camcentral_lib::jobs::worker::run_daemon;
use camcentral_lib::logging::init_logging;

#[derive(Parser)]
#[command(name = "mp4-converter")]
#[command(about = "Claims H.264 conversion jobs and remuxes them to MP4", long_about = None)]
#[command(version)]
struct Cli {
    #[command(flatten)]
    config: ConverterConfig,
}

fn main() -> Result<()> {
    let env_file = load_env_file();
    let cli = Cli::parse();
    let config = cli.config;

    init_logging(config.log_file.as_deref())?;
    if let Some(path) = env_file {
        log::info!("Loaded environment from {}", path.display());
    }

    config.validate()?;
    config.check_tools()?;
    let settings = config.daemon_settings()?;

    let shutdown = Shutdown::new();
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            log::info!("Shutdown signal received, finishing in-flight jobs");
            shutdown.trigger();
        })?;
    }

    run_daemon(&settings, &shutdown)?;
    Ok(())
}
