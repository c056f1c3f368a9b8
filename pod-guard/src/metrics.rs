use std::sync::{LazyLock, PoisonError, RwLock};

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

pub static REGISTRY: LazyLock<RwLock<Registry>> =
    LazyLock::new(|| RwLock::new(Registry::with_prefix("pod_guard")));

fn with_registry<T>(f: impl FnOnce(&mut Registry) -> T) -> T {
    let mut guard = REGISTRY.write().unwrap_or_else(PoisonError::into_inner);
    f(&mut guard)
}

/// Text exposition of every registered metric.
pub fn encode() -> String {
    let mut buffer = String::new();
    let registry = REGISTRY.read().unwrap_or_else(PoisonError::into_inner);
    match prometheus_client::encoding::text::encode(&mut buffer, &registry) {
        Ok(()) => buffer,
        Err(_) => String::new(),
    }
}

#[derive(Clone, Default)]
pub struct SyncMetrics {
    pub cycles: Counter,
    pub failures: Counter,
    pub write_failures: Counter,
    pub monitored_pods: Gauge,
}

impl SyncMetrics {
    pub fn new() -> Self {
        let metrics = Self::default();
        with_registry(|registry| {
            registry.register(
                "sync_cycles",
                "Number of completed policy synchronizations",
                metrics.cycles.clone(),
            );
            registry.register(
                "sync_failures",
                "Number of synchronizations skipped because the pod query failed",
                metrics.failures.clone(),
            );
            registry.register(
                "table_write_failures",
                "Number of failed enforcement table writes",
                metrics.write_failures.clone(),
            );
            registry.register(
                "monitored_pods",
                "Pods in the current identity snapshot",
                metrics.monitored_pods.clone(),
            );
        });
        metrics
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum ActionLabel {
    Allowed,
    Blocked,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ObservationLabels {
    pub action: ActionLabel,
}

#[derive(Clone, Default)]
pub struct FlowMetrics {
    pub observations: Family<ObservationLabels, Counter>,
    pub unmonitored: Counter,
    pub decode_errors: Counter,
    pub read_errors: Counter,
}

impl FlowMetrics {
    pub fn new() -> Self {
        let metrics = Self::default();
        with_registry(|registry| {
            registry.register(
                "flow_observations",
                "Flows attributed to a monitored pod",
                metrics.observations.clone(),
            );
            registry.register(
                "flow_unmonitored",
                "Flows dropped because the source is not a monitored pod",
                metrics.unmonitored.clone(),
            );
            registry.register(
                "flow_decode_errors",
                "Malformed flow records",
                metrics.decode_errors.clone(),
            );
            registry.register(
                "flow_read_errors",
                "Failed reads from the event stream",
                metrics.read_errors.clone(),
            );
        });
        metrics
    }
}

#[derive(Clone, Default)]
pub struct AttachMetrics {
    pub attached: Gauge,
}

impl AttachMetrics {
    pub fn new() -> Self {
        let metrics = Self::default();
        with_registry(|registry| {
            registry.register(
                "attached_interfaces",
                "Interfaces the enforcement engine is attached to",
                metrics.attached.clone(),
            );
        });
        metrics
    }
}
