use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pingrig_launcher::{client, config, event_log, server, supervisor};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "pingrig-launcher")]
#[command(about = "TCP liveness-probe experiment: server, clients, and a process launcher", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch the server and N clients, supervise them for the
    /// experiment duration, then shut everything down
    Run {
        /// Total experiment duration in seconds
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
        timeout: u64,

        /// Number of concurrent client processes
        #[arg(long, default_value = "1")]
        clients: u32,

        /// Server port
        #[arg(short, long, default_value = "8888")]
        port: u16,

        /// Directory for per-process outcome logs (overrides config)
        #[arg(long)]
        log_dir: Option<PathBuf>,

        /// Path to pingrig.toml (default: search current dir and parents)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Raise logging verbosity; does not change protocol behavior
        #[arg(long)]
        debug: bool,
    },

    /// Run one probe server process
    Server {
        /// Host to listen on
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Port to listen on
        #[arg(short, long, default_value = "8888")]
        port: u16,

        /// Outcome log file
        #[arg(long, default_value = "logs/server.log")]
        log: PathBuf,

        /// Run duration in seconds
        #[arg(long, default_value = "300")]
        timeout: u64,

        /// Path to pingrig.toml
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Raise logging verbosity
        #[arg(long)]
        debug: bool,
    },

    /// Run one probe client process
    Client {
        /// Client identifier (used for logging)
        #[arg(long)]
        id: u32,

        /// Server host
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Server port
        #[arg(short, long, default_value = "8888")]
        port: u16,

        /// Outcome log file (default: logs/client_<id>.log)
        #[arg(long)]
        log: Option<PathBuf>,

        /// Run duration in seconds
        #[arg(long, default_value = "300")]
        timeout: u64,

        /// Path to pingrig.toml
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Raise logging verbosity
        #[arg(long)]
        debug: bool,
    },
}

impl Commands {
    fn debug(&self) -> bool {
        match self {
            Commands::Run { debug, .. }
            | Commands::Server { debug, .. }
            | Commands::Client { debug, .. } => *debug,
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<config::Config> {
    match path {
        Some(path) => config::Config::from_file(path),
        None => config::Config::find_or_default(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.command.debug() { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    match cli.command {
        Commands::Run {
            timeout,
            clients,
            port,
            log_dir,
            config,
            debug,
        } => {
            let cfg = load_config(config.as_ref())?;

            let mut sup =
                supervisor::Supervisor::new(Duration::from_secs(timeout), clients, port, cfg)
                    .with_config_path(config)
                    .with_debug(debug);
            if let Some(dir) = log_dir {
                sup = sup.with_log_dir(dir);
            }

            let report = sup.run().await?;
            if report.all_clean() {
                log::info!("Experiment finished cleanly");
            } else {
                log::error!("Experiment finished with failures");
                std::process::exit(1);
            }
        }

        Commands::Server {
            host,
            port,
            log,
            timeout,
            config,
            ..
        } => {
            let cfg = load_config(config.as_ref())?;

            if let Some(parent) = log.parent() {
                std::fs::create_dir_all(parent)
                    .context(format!("Failed to create log directory: {}", parent.display()))?;
            }
            let event_log = Arc::new(event_log::EventLog::create(&log)?);

            server::ProbeServer::new(format!("{host}:{port}"), event_log)
                .with_idle_timeout(cfg.timing.idle_timeout())
                .with_run_duration(Duration::from_secs(timeout))
                .run()
                .await?;
        }

        Commands::Client {
            id,
            host,
            port,
            log,
            timeout,
            config,
            ..
        } => {
            let cfg = load_config(config.as_ref())?;

            let log = log.unwrap_or_else(|| PathBuf::from(format!("logs/client_{id}.log")));
            if let Some(parent) = log.parent() {
                std::fs::create_dir_all(parent)
                    .context(format!("Failed to create log directory: {}", parent.display()))?;
            }
            let event_log = Arc::new(event_log::EventLog::create(&log)?);

            client::ProbeClient::new(id, format!("{host}:{port}"), event_log)
                .with_interval(cfg.timing.probe_interval())
                .with_response_timeout(cfg.timing.response_timeout())
                .with_retry(cfg.retry.clone())
                .with_run_duration(Duration::from_secs(timeout))
                .run()
                .await?;
        }
    }

    Ok(())
}
