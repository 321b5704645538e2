use clap::Parser;
use eyre::{Context, Result};
use protocol::Reading;
use rand::Rng;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "sensor-node")]
#[command(about = "simulated sensor node streaming temperature readings to a gateway")]
struct Args {
    #[arg(help = "sensor id announced in every reading")]
    sensor_id: u16,

    #[arg(short, long, default_value = "127.0.0.1:5678", help = "gateway address")]
    address: SocketAddr,

    #[arg(
        short,
        long,
        default_value = "1s",
        value_parser = humantime::parse_duration,
        help = "delay between readings (e.g. 500ms, 2s)"
    )]
    interval: Duration,

    #[arg(short = 'n', long, help = "stop after this many readings")]
    count: Option<u64>,

    #[arg(long, default_value_t = 18.0, help = "center of the simulated temperature")]
    base: f64,

    #[arg(long, default_value_t = 3.0, help = "maximum deviation from the base")]
    spread: f64,
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let mut stream = TcpStream::connect(args.address)
        .with_context(|| format!("failed to connect to gateway address={}", args.address))?;
    tracing::info!(sensor_id = args.sensor_id, address = %args.address, "connected to gateway");

    let mut rng = rand::thread_rng();
    let spread = args.spread.abs();
    let mut sent = 0u64;
    while running.load(Ordering::SeqCst) && args.count.is_none_or(|count| sent < count) {
        let value = if spread > 0.0 {
            args.base + rng.gen_range(-spread..=spread)
        } else {
            args.base
        };
        let reading = Reading::new(args.sensor_id, value, gateway::unix_timestamp());
        reading
            .write_to(&mut stream)
            .wrap_err("gateway closed the connection")?;
        sent += 1;
        tracing::debug!(value, sent, "reading sent");
        sleep(args.interval);
    }

    tracing::info!(sent, "sensor node finished");
    Ok(())
}
