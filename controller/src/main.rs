#![deny(unused_must_use)]

use dawn_controller::bus;
use dawn_controller::config::Config;
use dawn_controller::events::EventBus;
use dawn_controller::hostapd::Bindings;
use dawn_controller::loops::ControlLoops;
use dawn_controller::macfile;
use dawn_controller::rpc::{ControlSurface, RPC_OBJECT};
use dawn_controller::store::Store;
use dawn_controller::transport;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::broadcast;

const EXIT_CONFIG: u8 = 1;
const EXIT_TRANSPORT: u8 = 2;
const EXIT_RPC: u8 = 3;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = match Config::load() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            tracing::error!("configuration error: {}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let store = Arc::new(Store::new());
    match macfile::load(Path::new(&config.maclist_path)) {
        Ok(macs) => {
            for mac in macs {
                store.permit_insert(mac);
            }
        }
        Err(e) => tracing::warn!("could not read permit list: {}", e),
    }

    let (shutdown_tx, _) = broadcast::channel(1);

    let transport = match transport::start(config.clone(), store.clone(), &shutdown_tx).await {
        Ok(transport) => transport,
        Err(e) => {
            tracing::error!("transport startup failed: {}", e);
            return ExitCode::from(EXIT_TRANSPORT);
        }
    };

    // The management-service adapter plugs in at this seam; without one
    // the controller still replicates and serves its store.
    let (bus_handle, bus_server, event_rx) = bus::channel(64);
    tokio::spawn(bus::serve_detached(bus_server));

    let bindings = Arc::new(Bindings::new());

    let event_bus = EventBus::new(
        store.clone(),
        config.clone(),
        bindings.clone(),
        transport.replicator.clone(),
    );
    let event_shutdown = shutdown_tx.subscribe();
    tokio::spawn(async move { event_bus.run(event_rx, event_shutdown).await });

    let loops = Arc::new(ControlLoops::new(
        config.clone(),
        store.clone(),
        bindings,
        bus_handle.clone(),
        transport.replicator.clone(),
        transport.mesh.clone(),
    ));
    let _loop_handles = loops.spawn_all(&shutdown_tx);

    let rpc_rx = match bus_handle.register_object(RPC_OBJECT).await {
        Ok(rx) => rx,
        Err(e) => {
            tracing::error!("failed to register control object: {}", e);
            return ExitCode::from(EXIT_RPC);
        }
    };
    let surface = ControlSurface::new(store, config, transport.replicator.clone());
    let rpc_shutdown = shutdown_tx.subscribe();
    tokio::spawn(async move { surface.run(rpc_rx, rpc_shutdown).await });

    tracing::info!("controller running");
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to wait for shutdown signal: {}", e);
    }
    tracing::info!("shutting down");
    let _ = shutdown_tx.send(());

    ExitCode::SUCCESS
}
