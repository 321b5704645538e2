use clap::Parser;
use eyre::{Context, Result};
use gateway::event_log::EventLog;
use gateway::{Gateway, GatewayConfig, Shutdown, StopReason};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[derive(Parser)]
#[command(name = "sensor-gateway")]
#[command(about = "collects sensor readings over tcp into analytics and sqlite storage")]
struct Args {
    #[arg(help = "tcp port to listen on (default 5678)")]
    port: Option<u16>,

    #[arg(short, long, help = "configuration file path (toml format)")]
    config: Option<PathBuf>,

    #[arg(short = 'm', long, help = "room to sensor map file")]
    sensor_map: Option<PathBuf>,

    #[arg(short, long, help = "sqlite database file")]
    db: Option<PathBuf>,

    #[arg(short, long, help = "event log output file")]
    log_file: Option<PathBuf>,

    #[arg(
        long,
        value_parser = humantime::parse_duration,
        help = "stop after this long (e.g. 30s, 5m)"
    )]
    duration: Option<Duration>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => GatewayConfig::load(path)
            .with_context(|| format!("failed to load config path={}", path.display()))?,
        None => GatewayConfig::default(),
    };
    match args.port {
        Some(port) => config.multiplexer.port = port,
        None if args.config.is_none() => {
            println!("using default port {}", config.multiplexer.port)
        }
        None => {}
    }
    if let Some(path) = args.sensor_map {
        config.analytics.sensor_map = path;
    }
    if let Some(path) = args.db {
        config.storage.db_path = path;
    }
    if let Some(path) = args.log_file {
        config.event_log.path = path;
    }

    let event_log = EventLog::open(&config.event_log.path).with_context(|| {
        format!(
            "failed to open event log path={}",
            config.event_log.path.display()
        )
    })?;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(
                    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
                ),
        )
        .with(event_log.layer())
        .init();
    tracing::info!("event log initialized");

    let shutdown = Shutdown::new();
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            tracing::info!("received ctrl+c, shutting down gracefully...");
            shutdown.request(StopReason::External);
        })?;
    }
    if let Some(duration) = args.duration {
        let shutdown = shutdown.clone();
        thread::Builder::new()
            .name("timer".to_string())
            .spawn(move || {
                if !shutdown.sleep(duration) {
                    shutdown.request(StopReason::External);
                }
            })?;
    }

    let gateway = Gateway::new(config, shutdown).wrap_err("failed to start gateway")?;
    let summary = gateway.run()?;
    tracing::info!(
        reason = %summary.reason,
        leftover = summary.leftover,
        "gateway stopped"
    );
    event_log.close()?;

    if let StopReason::Fatal(cause) = summary.reason {
        eyre::bail!("gateway stopped on fatal error: {}", cause);
    }
    Ok(())
}
