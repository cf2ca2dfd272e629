//! rpb-daemon — remote push-button HTTP daemon.
//!
//! Drives a relay wired in parallel with a garage-door opener button and
//! serves its state over an authenticated JSON API. Without `--hardware`
//! (or when the GPIO peripheral is unavailable) the daemon runs against a
//! simulated actuator, which is the useful mode on development hosts.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use rpb_core::{
    ActuatorBackend, ButtonController, NotificationHub, PersistenceGateway, SimulatedBackend,
    StateWatcher, now_utc_ms,
};
use rpb_daemon::auth::secret_digest;
use rpb_daemon::db::{SqliteStore, StartupRecord};
use rpb_daemon::http::{self, AppState};
use secrecy::SecretString;
use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// rpb daemon - remote push button server
#[derive(Parser, Debug)]
#[command(name = "rpb-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Login password shared by every client (falls back to $RPB_SECRET)
    #[arg(long)]
    secret: Option<String>,

    /// Where the database is
    #[arg(long, default_value = "./rpb.db")]
    db: PathBuf,

    /// Address to bind to
    #[arg(long, default_value = "0.0.0.0:5000")]
    addr: SocketAddr,

    /// BCM pin sensing whether the circuit is on
    #[arg(long, default_value_t = 14)]
    input: u8,

    /// BCM pin driving the relay
    #[arg(long, default_value_t = 15)]
    output: u8,

    /// Drive the real GPIO pins instead of the simulated actuator
    #[arg(long)]
    hardware: bool,

    /// Maximum seconds the server holds a press before releasing it
    #[arg(long, default_value_t = 20.0, value_name = "SECONDS")]
    timeout: f64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,
}

/// Daemon configuration derived from args and the environment.
struct DaemonConfig {
    secret: SecretString,
    db_path: PathBuf,
    addr: SocketAddr,
    input_pin: u8,
    output_pin: u8,
    hardware: bool,
    max_hold: Duration,
}

impl DaemonConfig {
    fn new(args: &Args) -> Result<Self> {
        let secret = args
            .secret
            .clone()
            .or_else(|| std::env::var("RPB_SECRET").ok())
            .unwrap_or_default();
        if secret.is_empty() || secret == "<INSERT SECRET HERE>" {
            bail!("secret must be supplied via --secret or $RPB_SECRET");
        }
        if !args.timeout.is_finite() || args.timeout <= 0.0 {
            bail!("timeout must be a positive number of seconds");
        }

        Ok(Self {
            secret: SecretString::from(secret),
            db_path: args.db.clone(),
            addr: args.addr,
            input_pin: args.input,
            output_pin: args.output,
            hardware: args.hardware,
            max_hold: Duration::from_secs_f64(args.timeout),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args)?;
    let config = DaemonConfig::new(&args)?;

    let store = Arc::new(SqliteStore::open(&config.db_path).context("failed to open database")?);
    let hub = Arc::new(NotificationHub::new());

    let backend = select_backend(&config);
    let gateway: Arc<dyn PersistenceGateway> = store.clone();
    let controller = Arc::new(ButtonController::new(
        backend,
        config.max_hold,
        gateway,
        Arc::clone(&hub),
    ));
    controller.setup().context("actuator setup failed")?;

    let watcher_gateway: Arc<dyn PersistenceGateway> = store.clone();
    let watcher = StateWatcher::new(
        Arc::clone(&controller),
        watcher_gateway,
        Arc::clone(&hub),
    )
    .spawn();

    let started_at = now_utc_ms();
    if let Err(err) = store.record_startup(&StartupRecord {
        started_at,
        timeout_secs: config.max_hold.as_secs_f64(),
        input_pin: config.input_pin,
        output_pin: config.output_pin,
        hardware: config.hardware,
    }) {
        warn!(%err, "failed to record startup");
    }

    let app = AppState {
        controller,
        hub,
        store,
        secret_digest: secret_digest(&config.secret),
        max_hold: config.max_hold,
        started_at,
    };
    let router = http::router(app);

    let listener = TcpListener::bind(config.addr)
        .await
        .context("failed to bind listener")?;
    info!(addr = %config.addr, "server online");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server error")?;

    watcher.abort();
    info!("daemon shutdown complete");
    Ok(())
}

fn init_tracing(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    Ok(())
}

/// Pick the actuator. Hardware is only attempted when requested; a GPIO
/// failure degrades to the simulator rather than refusing to start, so the
/// API stays reachable on hosts without pin access.
fn select_backend(config: &DaemonConfig) -> Box<dyn ActuatorBackend> {
    if config.hardware {
        #[cfg(feature = "hardware")]
        {
            match rpb_core::GpioBackend::new(config.input_pin, config.output_pin) {
                Ok(gpio) => {
                    info!(
                        input = config.input_pin,
                        output = config.output_pin,
                        "driving hardware GPIO pins"
                    );
                    return Box::new(gpio);
                },
                Err(err) => {
                    warn!(%err, "cannot access GPIO, falling back to the simulated actuator");
                },
            }
        }
        #[cfg(not(feature = "hardware"))]
        warn!("built without the `hardware` feature, falling back to the simulated actuator");
    }

    info!("using the simulated actuator");
    Box::new(SimulatedBackend::new())
}

async fn shutdown_signal() {
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT");

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }
}
