use std::net::SocketAddr;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;

use relay_realtime_service::bus::{create_bus, BusSubscriber};
use relay_realtime_service::config::Settings;
use relay_realtime_service::server::{create_app, AppState};
use relay_realtime_service::shutdown::GracefulShutdown;
use relay_realtime_service::tasks::{HeartbeatTask, StatsCollectorTask};
use relay_realtime_service::telemetry::init_telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::new()?;

    // Initialize tracing (guard must stay alive for the process lifetime)
    let _telemetry_guard = init_telemetry(&settings.otel)?;
    tracing::info!("Configuration loaded");

    // Create the message bus (Redis when enabled, in-process otherwise)
    let bus = create_bus(&settings.bus)?;
    tracing::info!(distributed = bus.is_distributed(), "Message bus created");

    // Create application state
    let state = AppState::new(settings.clone(), bus.clone())?;
    tracing::info!(process_id = %state.process_id, "Application state initialized");

    // Shutdown signal shared by all background tasks
    let (shutdown_tx, _) = broadcast::channel(4);

    // Start the bus subscriber when running distributed
    let subscriber_handle = if bus.is_distributed() {
        let subscriber = BusSubscriber::new(settings.bus.clone(), state.channels.clone());
        Some(subscriber.spawn(shutdown_tx.subscribe()))
    } else {
        None
    };

    // Start heartbeat task in background
    let heartbeat_task = HeartbeatTask::new(
        settings.realtime.clone(),
        state.registry.clone(),
        bus.clone(),
        state.admin.clone(),
        shutdown_tx.subscribe(),
    );
    let heartbeat_handle = tokio::spawn(async move {
        heartbeat_task.run().await;
    });

    // Start stats collector in background
    let collector_task = StatsCollectorTask::new(
        settings.realtime.stats_collection_interval_seconds,
        state.admin.clone(),
        shutdown_tx.subscribe(),
    );
    let collector_handle = tokio::spawn(async move {
        collector_task.run().await;
    });

    let registry = state.registry.clone();

    // Create Axum app
    let app = create_app(state);

    // Start server
    let addr = settings.server_addr();
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(wait_for_shutdown_signal())
    .await?;

    // Run the coordinated shutdown sequence
    let shutdown = GracefulShutdown::new(registry, shutdown_tx);
    shutdown.execute("server shutting down").await;

    // Wait for background tasks to finish
    tracing::info!("Waiting for background tasks to finish...");
    let _ = tokio::join!(heartbeat_handle, collector_handle);
    if let Some(handle) = subscriber_handle {
        let _ = handle.await;
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
