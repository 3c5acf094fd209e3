use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;

use crate::{
    config::ServerConfig,
    core::rate_limiter::ClientRegistry,
    metrics::RequestMetrics,
    ports::{mailer::Mailer, store::Models},
    utils::BackgroundTasks,
};

/// Everything a request handler or middleware stage may reach.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub models: Models,
    pub mailer: Arc<dyn Mailer>,
    pub registry: Arc<ClientRegistry>,
    pub metrics: Arc<RequestMetrics>,
    pub tasks: BackgroundTasks,
    /// Renders `/metrics`; absent unless a recorder was installed.
    pub exporter: Option<PrometheusHandle>,
}

impl AppState {
    /// Build the state and start the client registry sweeper. Must be called
    /// from within a Tokio runtime.
    pub fn new(
        config: ServerConfig,
        models: Models,
        mailer: Arc<dyn Mailer>,
        tasks: BackgroundTasks,
    ) -> Self {
        let registry = ClientRegistry::start(&config.limiter);
        Self {
            config: Arc::new(config),
            models,
            mailer,
            registry,
            metrics: Arc::new(RequestMetrics::new()),
            tasks,
            exporter: None,
        }
    }

    pub fn with_exporter(mut self, exporter: PrometheusHandle) -> Self {
        self.exporter = Some(exporter);
        self
    }
}
