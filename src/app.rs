use crate::config::Config;
use crate::file_store::FileStore;
use crate::intake::ImageIntake;
use crate::prediction::HttpPredictionClient;
use crate::server::HttpServer;
use crate::store::SqliteStore;

use std::{error::Error, sync::Arc};
use tokio::{signal, sync::broadcast};

pub async fn start_app(config: Config) -> Result<(), Box<dyn Error>> {
    let store = match SqliteStore::open(&config.database.path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::error!("Failed to open database {:?}: {:?}", config.database.path, e);
            return Err(Box::new(e));
        }
    };

    let predictor = match HttpPredictionClient::new(&config.prediction_service) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            tracing::error!("Failed to initialize prediction client: {:?}", e);
            return Err(Box::new(e));
        }
    };

    let file_store = FileStore::new(config.storage.temp_folder.clone());
    if let Err(e) = file_store.ensure_folder().await {
        tracing::error!(
            "Failed to create temp folder {:?}: {:?}",
            config.storage.temp_folder,
            e
        );
        return Err(Box::new(e));
    }

    let intake = Arc::new(ImageIntake::new(store, predictor, file_store));
    let server = HttpServer::new(intake, &config).await?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let server_handle = server.run(shutdown_tx.subscribe()).await?;

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, starting graceful shutdown.");

    let _ = shutdown_tx.send(());
    match server_handle.await {
        Ok(Err(e)) => tracing::error!("Server stopped with error: {:?}", e),
        Err(e) => tracing::error!("Server task panicked: {:?}", e),
        Ok(Ok(())) => tracing::info!("Server stopped"),
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
