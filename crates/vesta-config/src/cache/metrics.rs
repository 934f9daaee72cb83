// Cache statistics reporting

use metrics::{describe_gauge, gauge};

/// Receives per-group statistics computed by the release cache
pub trait CacheMetricsSink: Send + Sync {
    /// Number of active releases in a group after a delta batch
    fn group_release_count(&self, namespace: &str, group: &str, count: usize);
}

/// Records gauges through the `metrics` facade
#[derive(Clone, Copy, Debug, Default)]
pub struct GaugeMetricsSink;

impl GaugeMetricsSink {
    pub fn new() -> Self {
        describe_gauge!(
            "config_group_release_count",
            "Number of active releases per config group"
        );
        GaugeMetricsSink
    }
}

impl CacheMetricsSink for GaugeMetricsSink {
    fn group_release_count(&self, namespace: &str, group: &str, count: usize) {
        gauge!("config_group_release_count", "namespace" => namespace.to_string(), "group" => group.to_string())
            .set(count as f64);
    }
}
