//! Presence daemon entry point.
//!
//! Wires the infrastructure services together and starts the Tokio runtime.
//!
//! # Architecture
//!
//! ```text
//! main()
//!  └─ load_config()          -- TOML config with defaults
//!  └─ start services
//!       ├─ Engine            -- radio/handshake dispatch loop (Tokio task)
//!       ├─ liveness sweeper  -- periodic stale/evict pass (Tokio task)
//!       └─ relay server      -- TCP push feed for front-ends
//! ```

use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use clap::Parser;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{error, info, trace, warn};
use tracing_subscriber::EnvFilter;

use presence_core::{now_ms, DeviceRegistry};

use presence_daemon::application::{ConnectionArbiter, Engine, HandshakeMachine, HandshakeTimeouts};
use presence_daemon::infrastructure::oracle::HttpOracle;
use presence_daemon::infrastructure::radio::mock::{spawn_mock_radio, MockWearable};
use presence_daemon::infrastructure::radio::{radio_channel, RadioEvent, RadioHandle};
use presence_daemon::infrastructure::relay::{run_relay, LoginTarget, RelaySettings};
use presence_daemon::infrastructure::storage::load_config;

#[derive(Debug, Parser)]
#[command(name = "presenced", about = "BLE wearable presence and login daemon")]
struct Args {
    /// Path to the config file (defaults to the platform config directory).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Serve canned mock users over the relay instead of live registry data.
    #[arg(long)]
    mock: bool,

    /// Run against a simulated radio with scripted wearables.
    #[arg(long)]
    simulate: bool,

    /// Log at debug level (RUST_LOG still takes precedence).
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialise structured logging.  Level is overridden by `RUST_LOG`.
    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_level.to_string())),
        )
        .init();

    info!("presence daemon starting");

    let config = match load_config(args.config.clone()) {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load config: {e}");
            return Err(e.into());
        }
    };

    // Shared state.
    let registry = Arc::new(Mutex::new(DeviceRegistry::new()));
    let login_target = LoginTarget::new();
    let (status_tx, _status_rx) = broadcast::channel(16);
    let running = Arc::new(AtomicBool::new(true));

    // ── Radio backend ─────────────────────────────────────────────────────────
    let (radio, radio_events) = if args.simulate {
        info!("using simulated radio backend");
        spawn_mock_radio(vec![
            MockWearable::cooperative("ABC123", "A1B2C3D4E5F60718"),
            MockWearable::cooperative("XYZ999", "F00DF00DF00DF00D"),
        ])
    } else {
        // No hardware backend on this build; the daemon runs with an idle
        // radio and serves the relay only.
        warn!("no radio hardware backend available, radio is idle");
        spawn_idle_radio()
    };

    // ── Oracle client ─────────────────────────────────────────────────────────
    // HTTP timeout sits above the handshake's oracle deadline so the state
    // machine decides when a round has failed.
    let oracle = Arc::new(HttpOracle::new(
        &config.oracle.base_url,
        config.handshake.oracle_timeout() + Duration::from_secs(2),
    )?);
    info!("oracle endpoint: {}", config.oracle.base_url);

    // ── Engine dispatch loop ──────────────────────────────────────────────────
    let arbiter = ConnectionArbiter::new(
        Arc::clone(&registry),
        login_target.clone(),
        radio.clone(),
    );
    let (machine, machine_events) = HandshakeMachine::new(
        radio,
        oracle,
        Arc::clone(&registry),
        login_target.clone(),
        status_tx.clone(),
        HandshakeTimeouts {
            device: config.handshake.device_timeout(),
            oracle: config.handshake.oracle_timeout(),
        },
    );
    let engine = Engine::new(arbiter, machine, radio_events, machine_events);
    let engine_running = Arc::clone(&running);
    tokio::spawn(engine.run(engine_running));

    // ── Liveness sweeper ──────────────────────────────────────────────────────
    // Mock-data mode serves canned users, so there is no live registry worth
    // aging out.
    if !args.mock {
        let sweep_registry = Arc::clone(&registry);
        let sweep_running = Arc::clone(&running);
        let liveness = config.liveness.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(liveness.sweep_interval());
            while sweep_running.load(Ordering::Relaxed) {
                ticker.tick().await;
                let mut registry = sweep_registry.lock().await;
                registry.sweep(now_ms(), liveness.stale_after_ms(), liveness.evict_after_ms());
            }
        });
    }

    // ── Relay server ──────────────────────────────────────────────────────────
    let relay_settings = RelaySettings {
        bind_address: config.relay.bind_address.clone(),
        port: config.relay.port,
        update_interval: config.relay.update_interval(),
        mock_data: args.mock,
    };
    let relay_registry = Arc::clone(&registry);
    let relay_running = Arc::clone(&running);
    let relay = tokio::spawn(async move {
        if let Err(e) = run_relay(
            relay_settings,
            relay_registry,
            login_target,
            status_tx,
            relay_running,
        )
        .await
        {
            error!("relay server failed: {e}");
        }
    });

    // ── Ctrl-C / SIGTERM handler ──────────────────────────────────────────────
    let running_clone = Arc::clone(&running);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            running_clone.store(false, Ordering::Relaxed);
        }
    });

    info!(
        "presence daemon ready on port {}.  Press Ctrl-C to exit.",
        config.relay.port
    );

    loop {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if !running.load(Ordering::Relaxed) {
            break;
        }
    }

    relay.abort();
    info!("presence daemon stopped");
    Ok(())
}

/// A radio backend that never produces events.  Commands are drained and
/// logged so the engine's sends always succeed.
fn spawn_idle_radio() -> (RadioHandle, mpsc::Receiver<RadioEvent>) {
    let (radio, mut commands) = radio_channel(32);
    let (events_tx, events_rx) = mpsc::channel(32);
    tokio::spawn(async move {
        // Holding the sender keeps the engine's event stream open.
        let _events_tx = events_tx;
        while let Some(command) = commands.recv().await {
            trace!("idle radio dropping command: {command:?}");
        }
    });
    (radio, events_rx)
}
