use std::sync::atomic::AtomicU64;
use std::time::Duration;

use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;

use super::node::Node;
use crate::component::HealthType;

type Labels = Vec<(String, String)>;

/// Metrics of the root controller.
#[derive(Clone)]
pub(crate) struct ControllerMetrics {
    evaluating: Gauge,
    evaluation_seconds: Histogram,
    dependencies_wait_seconds: Histogram,
    queue_size: Gauge,
    slow_seconds: Family<Labels, Counter<f64, AtomicU64>>,
    running_components: Gauge,
    health: Family<Labels, Gauge>,
}

impl ControllerMetrics {
    pub fn new() -> Self {
        Self {
            evaluating: Gauge::default(),
            evaluation_seconds: Histogram::new(exponential_buckets(0.001, 2.0, 16)),
            dependencies_wait_seconds: Histogram::new(exponential_buckets(0.001, 2.0, 16)),
            queue_size: Gauge::default(),
            slow_seconds: Family::default(),
            running_components: Gauge::default(),
            health: Family::default(),
        }
    }

    pub fn register(&self, registry: &mut Registry) {
        registry.register(
            "controller_evaluating",
            "Whether the controller is evaluating the graph",
            self.evaluating.clone(),
        );
        registry.register(
            "component_evaluation_seconds",
            "Time spent evaluating and applying the arguments of a component",
            self.evaluation_seconds.clone(),
        );
        registry.register(
            "component_dependencies_wait_seconds",
            "Time spent by a component waiting for its dependencies to be evaluated",
            self.dependencies_wait_seconds.clone(),
        );
        registry.register(
            "evaluation_queue_size",
            "Number of components waiting to be evaluated",
            self.queue_size.clone(),
        );
        registry.register(
            "component_evaluation_slow_seconds",
            "Time spent in evaluations that exceeded the slow evaluation threshold",
            self.slow_seconds.clone(),
        );
        registry.register(
            "controller_running_components",
            "Number of components that are running",
            self.running_components.clone(),
        );
        registry.register(
            "controller_health",
            "Health of the components, 1 for the current health type",
            self.health.clone(),
        );
    }

    pub fn set_evaluating(&self, evaluating: bool) {
        self.evaluating.set(i64::from(evaluating));
    }

    pub fn set_queue_size(&self, size: usize) {
        self.queue_size.set(i64::try_from(size).unwrap_or(i64::MAX));
    }

    pub fn observe_wait(&self, wait: Duration) {
        self.dependencies_wait_seconds.observe(wait.as_secs_f64());
    }

    pub fn observe_evaluation(&self, id: &str, duration: Duration, slow_threshold: Duration) {
        self.evaluation_seconds.observe(duration.as_secs_f64());
        if duration > slow_threshold {
            self.slow_seconds
                .get_or_create(&vec![(String::from("component_id"), id.to_owned())])
                .inc_by(duration.as_secs_f64());
        }
    }

    /// Refreshes the gauges that describe the state of the nodes.
    pub fn update_nodes<'a>(&self, nodes: impl IntoIterator<Item = &'a Node>) {
        let mut running = 0;
        for node in nodes {
            if node.is_alive() {
                running += 1;
            }
            let current = node.health().health;
            for health_type in HealthType::ALL {
                let labels = vec![
                    (String::from("health_type"), health_type.as_str().to_owned()),
                    (String::from("component_id"), node.id.clone()),
                ];
                self.health
                    .get_or_create(&labels)
                    .set(i64::from(health_type == current));
            }
        }
        self.running_components.set(running);
    }

    /// Forgets the health of a node that is not declared anymore.
    pub fn remove_node(&self, id: &str) {
        for health_type in HealthType::ALL {
            let labels = vec![
                (String::from("health_type"), health_type.as_str().to_owned()),
                (String::from("component_id"), id.to_owned()),
            ];
            self.health.remove(&labels);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use prometheus_client::encoding::text::encode;
    use prometheus_client::registry::Registry;

    use super::ControllerMetrics;

    #[test]
    fn slow_evaluations() {
        let metrics = ControllerMetrics::new();
        let mut registry = Registry::default();
        metrics.register(&mut registry);
        metrics.observe_evaluation("test.fast", Duration::from_millis(1), Duration::from_secs(1));
        metrics.observe_evaluation("test.slow", Duration::from_secs(2), Duration::from_secs(1));

        let mut buf = String::new();
        encode(&mut buf, &registry).unwrap();
        assert!(buf.contains("component_evaluation_slow_seconds_total{component_id=\"test.slow\"} 2"), "{buf}");
        assert!(!buf.contains("test.fast"), "{buf}");
        assert!(buf.contains("component_evaluation_seconds_count 2"), "{buf}");
    }
}
