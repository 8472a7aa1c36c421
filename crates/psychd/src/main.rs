//! psychd: periodically fetches MarketPsych bulletins and publishes them
//! as unsolicited refreshes to the downstream market-data fabric.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use psych_handler::wire::loopback::LoopbackContext;
use psych_handler::wire::{self, WireContext};
use psych_handler::{EventPump, Provider, Runner, Scheduler, ServerState};
use psych_metadata::Config;

#[derive(Parser, Debug)]
#[command(name = "psychd")]
#[command(about = "MarketPsych sentiment feed handler")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Monitor server bind address
    #[arg(long, default_value = "0.0.0.0:8080")]
    monitor_addr: String,
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    if let Err(code) = run(args).await {
        std::process::exit(code);
    }
}

async fn run(args: Args) -> Result<(), i32> {
    info!(version = env!("CARGO_PKG_VERSION"), "starting");

    // Load configuration; invalid configuration is fatal.
    let config = match Config::load(&args.config) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!(error = %e, path = %args.config.display(), "cannot load configuration");
            return Err(1);
        }
    };
    info!(
        service = %config.service_name,
        resources = config.resources.len(),
        sessions = config.sessions.len(),
        "loaded configuration"
    );

    // Event queue, then the wire context that feeds it.
    let (event_tx, event_rx) = wire::event_queue();
    info!(name = %config.event_queue_name, "created event queue");
    let context: Arc<dyn WireContext> = LoopbackContext::new(event_tx);

    // Provider builds its sessions and issues every login.
    let provider = Arc::new(Provider::new(Arc::clone(&config), context));
    if let Err(e) = provider.init() {
        error!(error = %e, "provider initialization failed");
        return Err(1);
    }

    // Connections and item streams.
    let runner = match Runner::build(Arc::clone(&config), Arc::clone(&provider)) {
        Ok(runner) => Arc::new(runner),
        Err(e) => {
            error!(error = %e, "cannot build fetcher");
            return Err(1);
        }
    };
    info!(
        streams = runner.query_vector().stream_count(),
        "created item streams"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Monitor server.
    let monitor_addr: SocketAddr = match args.monitor_addr.parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!(error = %e, addr = %args.monitor_addr, "bad monitor address");
            return Err(1);
        }
    };
    let server_state = ServerState::new(&config.monitor_name, Arc::clone(&provider));
    tokio::spawn(async move {
        if let Err(e) = psych_handler::run_server(monitor_addr, server_state).await {
            error!(error = %e, "monitor server error");
        }
    });
    info!(addr = %monitor_addr, "monitor server started");

    // Event pump.
    let pump = EventPump::new(event_rx, Arc::clone(&provider));
    let pump_handle = tokio::spawn(pump.run(shutdown_rx.clone()));

    // Scheduler.
    let scheduler = Scheduler::new(&config.knobs);
    let scheduler_runner = Arc::clone(&runner);
    let scheduler_shutdown = shutdown_rx.clone();
    let scheduler_handle = tokio::spawn(async move {
        scheduler.run(&scheduler_runner, scheduler_shutdown).await;
    });

    info!("init complete, entering main loop");
    wait_for_signal().await;
    info!("caught shutdown signal, shutting down");

    // Reverse of startup: scheduler first, then the pump; an in-progress
    // cycle runs to completion or its own timeouts.
    shutdown_tx.send(true).ok();
    scheduler_handle.await.ok();
    pump_handle.await.ok();
    drop(runner);
    drop(provider);

    info!("instance closed");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(signal) => signal,
        Err(e) => {
            error!(error = %e, "cannot install SIGTERM handler");
            tokio::signal::ctrl_c().await.ok();
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    tokio::signal::ctrl_c().await.ok();
}
