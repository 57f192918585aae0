use std::borrow::Cow;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use prometheus_client::registry::{Metric, Registry};

use crate::service::{ServiceData, ServiceError, ServiceRegistry};
use crate::value::Value;

/// Callback invoked by a unit when its outputs change.
pub type PublishFn = Arc<dyn Fn(Value) + Send + Sync>;

/// Options given to the factory of every unit.
///
/// The options can be cloned and moved into the unit, which typically keeps
/// them to publish new outputs from its run method.
#[derive(Clone)]
pub struct Options {
    /// Global identifier of the unit, for instance `local.value.source`.
    pub id: String,
    /// Target to use with the `log` macros, for instance
    /// `log::info!(target: &opts.log_target, "...")`.
    pub log_target: String,
    /// Directory where the unit can store data. It is not created automatically.
    pub data_path: PathBuf,
    publish: PublishFn,
    metrics: MetricsRegisterer,
    services: Arc<ServiceRegistry>,
}

impl Options {
    pub(crate) fn new(
        id: String,
        data_path: PathBuf,
        publish: PublishFn,
        metrics: MetricsRegisterer,
        services: Arc<ServiceRegistry>,
    ) -> Self {
        let log_target = format!("flowd::component::{id}");
        Self {
            id,
            log_target,
            data_path,
            publish,
            metrics,
            services,
        }
    }

    /// Publishes new outputs.
    ///
    /// The controller compares them with the previous outputs: if they are equal,
    /// nothing happens. Otherwise, the dependents of the unit are re-evaluated.
    pub fn publish(&self, outputs: Value) {
        (self.publish)(outputs)
    }

    /// Encodes the outputs record and publishes it.
    pub fn publish_record<T: serde::Serialize>(&self, outputs: &T) -> anyhow::Result<()> {
        self.publish(Value::encode(outputs)?);
        Ok(())
    }

    /// Returns the metrics registerer of the unit.
    pub fn metrics(&self) -> &MetricsRegisterer {
        &self.metrics
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    /// Looks up a service by name.
    pub fn get_service_data(&self, name: &str) -> Result<ServiceData, ServiceError> {
        self.services.get_service_data(name)
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("id", &self.id)
            .field("data_path", &self.data_path)
            .finish_non_exhaustive()
    }
}

/// Registers metrics on behalf of a unit.
///
/// Every metric registered through it carries a `component_id` label.
#[derive(Clone)]
pub struct MetricsRegisterer {
    registry: Arc<Mutex<Registry>>,
    labels: Vec<(Cow<'static, str>, Cow<'static, str>)>,
}

impl MetricsRegisterer {
    pub(crate) fn new(registry: Arc<Mutex<Registry>>) -> Self {
        Self {
            registry,
            labels: Vec::new(),
        }
    }

    /// Returns a registerer that adds the given label to every metric.
    pub fn with_label(&self, name: impl Into<Cow<'static, str>>, value: impl Into<Cow<'static, str>>) -> Self {
        let mut labels = self.labels.clone();
        labels.push((name.into(), value.into()));
        Self {
            registry: Arc::clone(&self.registry),
            labels,
        }
    }

    pub fn register(&self, name: impl Into<String>, help: impl Into<String>, metric: impl Metric) {
        let mut registry = self.registry.lock().unwrap();
        let mut sub = &mut *registry;
        for label in &self.labels {
            sub = sub.sub_registry_with_label(label.clone());
        }
        sub.register(name, help, metric);
    }

    /// The registry that the metrics are written to.
    pub(crate) fn registry(&self) -> &Arc<Mutex<Registry>> {
        &self.registry
    }
}

impl fmt::Debug for MetricsRegisterer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsRegisterer").field("labels", &self.labels).finish()
    }
}
