use clap::Parser;
use reprise::config::{Config, Overrides};
use reprise::error::StartupError;
use reprise::logging;
use reprise::proxy::ProxyServer;
use reprise::recording::ProxyMode;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;

/// Reprise - record and replay HTTP traffic
#[derive(Parser, Debug)]
#[command(name = "reprise")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(short, long, env = "REPRISE_CONFIG")]
    config: Option<PathBuf>,

    /// Listen host
    #[arg(long, env = "REPRISE_HOST")]
    host: Option<String>,

    /// Listen port
    #[arg(short, long, env = "REPRISE_PORT")]
    port: Option<u16>,

    /// Upstream base URL, e.g. http://127.0.0.1:9000
    #[arg(short, long, env = "REPRISE_UPSTREAM")]
    upstream: Option<String>,

    /// record, replay_only or hybrid
    #[arg(short, long, env = "REPRISE_MODE")]
    mode: Option<ProxyMode>,

    /// Recording log file (JSON lines)
    #[arg(short, long, env = "REPRISE_RECORDINGS")]
    recordings: Option<PathBuf>,

    /// Serve Prometheus metrics on this port
    #[arg(long, env = "REPRISE_METRICS_PORT")]
    metrics_port: Option<u16>,

    /// Log filter, e.g. info or reprise=debug
    #[arg(long, env = "REPRISE_LOG_LEVEL")]
    log_level: Option<String>,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            listen_host: self.host.clone(),
            listen_port: self.port,
            upstream_url: self.upstream.clone(),
            mode: self.mode,
            recording_path: self.recordings.clone(),
            metrics_port: self.metrics_port,
            log_level: self.log_level.clone(),
        }
    }
}

fn load_config(args: &Args) -> Result<Config, StartupError> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    config.apply_overrides(args.overrides());
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("reprise: {e}");
            return ExitCode::from(e.exit_code());
        }
    };

    if let Err(e) = logging::init(&config.logging) {
        eprintln!("reprise: {e:#}");
        return ExitCode::FAILURE;
    }

    let result = match ProxyServer::new(config) {
        Ok(server) => server.run().await,
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::from(e.exit_code())
        }
    }
}
