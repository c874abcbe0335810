use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use switchline::config::Bootstrap;
use switchline::server::{self, Options};

#[derive(Parser, Debug)]
#[command(name = "switchline", version, about = "HTTP/1.1 service proxy data plane")]
struct Cli {
    /// Number of worker threads.
    #[arg(long, default_value_t = 0, value_name = "N")]
    concurrency: usize,

    /// Bootstrap configuration file (JSON).
    #[arg(long, value_name = "PATH")]
    config_path: PathBuf,

    /// Hot-restart epoch. Accepted for interface compatibility.
    #[arg(long, default_value_t = 0, value_name = "K")]
    restart_epoch: u32,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short = 'l', long = "log-level", default_value = "info", value_name = "LEVEL")]
    log_level: String,

    /// Name of the service cluster this proxy fronts.
    #[arg(long, value_name = "NAME")]
    service_cluster: Option<String>,

    /// Name of this node.
    #[arg(long, value_name = "NAME")]
    service_node: Option<String>,

    /// Zone this node runs in, for zone-aware routing and stats.
    #[arg(long, default_value = "", value_name = "NAME")]
    service_zone: String,

    /// Access-log flush interval in milliseconds.
    #[arg(long, default_value_t = 10_000, value_name = "MS")]
    file_flush_interval_msec: u64,

    /// Time to drain connections on shutdown, in seconds.
    #[arg(long, default_value_t = 600, value_name = "S")]
    drain_time_s: u64,

    /// Time before a parent process exits after hot restart, in seconds.
    #[arg(long, default_value_t = 900, value_name = "S")]
    parent_shutdown_time_s: u64,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if cli.restart_epoch != 0 {
        tracing::warn!(epoch = cli.restart_epoch, "hot restart is not supported; ignoring epoch");
    }
    if let Some(node) = &cli.service_node {
        tracing::info!(node, "starting");
    }

    let bootstrap = match Bootstrap::load(&cli.config_path) {
        Ok(bootstrap) => bootstrap,
        Err(e) => {
            tracing::error!(error = %e, path = %cli.config_path.display(), "failed to load config");
            return ExitCode::from(1);
        }
    };

    let options = Options {
        concurrency: if cli.concurrency == 0 {
            Options::default().concurrency
        } else {
            cli.concurrency
        },
        service_cluster: cli.service_cluster,
        service_node: cli.service_node,
        service_zone: cli.service_zone,
        file_flush_interval: Duration::from_millis(cli.file_flush_interval_msec),
        drain_time: Duration::from_secs(cli.drain_time_s),
        parent_shutdown_time: Duration::from_secs(cli.parent_shutdown_time_s),
    };

    match server::run(options, bootstrap) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "fatal initialization error");
            ExitCode::from(1)
        }
    }
}
