//! Main entry point for the Vesta configuration release engine server.

use std::sync::Arc;

use tracing::{error, info, warn};

use vesta_server::{
    metrics,
    model::{app_state::AppState, config::Configuration},
    startup::{self, Engine, ShutdownSignal},
};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let configuration = Configuration::new()?;
    let _logging_guard = startup::init_logging(&configuration.logging_config())?;

    let metrics_handle = match metrics::init_metrics() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "continuing without a metrics recorder");
            None
        }
    };

    let shutdown = ShutdownSignal::new();
    startup::listen_for_os_signals(shutdown.clone());

    let engine = Engine::from_configuration(&configuration, &shutdown).await?;
    let app_state = Arc::new(AppState::new(engine.center, metrics_handle));

    let address = configuration.server_address();
    let port = configuration.server_port();
    let server = startup::main_server(
        app_state,
        address.clone(),
        port,
        configuration.shutdown_timeout().as_secs(),
    )?;
    info!(%address, port, "vesta server listening");

    let server_handle = server.handle();
    let mut stop = shutdown.subscribe();
    tokio::spawn(async move {
        let _ = stop.recv().await;
        server_handle.stop(true).await;
    });

    if let Err(e) = server.await {
        error!(error = %e, "http server failed");
    }

    // stop background tasks if the server ended on its own
    shutdown.shutdown();
    let grace = configuration.shutdown_timeout();
    for task in engine.tasks {
        match tokio::time::timeout(grace, task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "background task ended abnormally"),
            Err(_) => warn!("background task did not stop in time"),
        }
    }
    info!("vesta server stopped");
    Ok(())
}
