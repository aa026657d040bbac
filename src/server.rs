use crate::{
    config::Config, correlation::correlate, intake::ImageIntake, routes::api_routes,
    telemetry::Metrics,
};
use axum::{extract::DefaultBodyLimit, middleware, Router};
use axum_otel_metrics::HttpMetricsLayerBuilder;
use std::sync::Arc;
use tokio::{net::TcpListener, sync::broadcast::Receiver, task::JoinHandle};

#[derive(Clone)]
pub struct SharedState {
    pub intake: Arc<ImageIntake>,
    pub metrics: Arc<Metrics>,
}

/// Application routes with correlation tagging and the upload size limit.
pub fn build_router(state: SharedState, body_limit_bytes: usize) -> Router {
    Router::new()
        .merge(api_routes())
        .layer(DefaultBodyLimit::max(body_limit_bytes))
        .layer(middleware::from_fn(correlate))
        .with_state(state)
}

pub struct HttpServer {
    router: Router,
    listener: TcpListener,
}

impl HttpServer {
    pub async fn new(intake: Arc<ImageIntake>, config: &Config) -> anyhow::Result<Self> {
        let addr = config.server.get_address();

        let metrics = Arc::new(Metrics::new()?);
        let metrics_layer = HttpMetricsLayerBuilder::new().build();

        let app_state = SharedState { intake, metrics };

        let router = build_router(app_state, config.server.get_body_limit_bytes())
            .layer(metrics_layer);

        let listener = TcpListener::bind(addr).await?;

        Ok(Self { router, listener })
    }

    pub async fn run(
        self,
        mut shutdown_rx: Receiver<()>,
    ) -> anyhow::Result<JoinHandle<anyhow::Result<()>>> {
        tracing::info!("Starting app on {}", self.listener.local_addr()?);

        let listener = self.listener;
        let router = self.router;
        let server_handle = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    shutdown_rx.recv().await.ok();
                })
                .await?;
            Ok(())
        });

        Ok(server_handle)
    }
}
