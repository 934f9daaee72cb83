// Shared state handed to every HTTP handler

use metrics_exporter_prometheus::PrometheusHandle;

use vesta_config::ConfigCenter;

pub struct AppState {
    pub center: ConfigCenter,
    /// `None` when no Prometheus recorder is installed
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(center: ConfigCenter, metrics: Option<PrometheusHandle>) -> Self {
        Self { center, metrics }
    }
}
