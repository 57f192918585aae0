//! Runtime controller of a pipeline.
//!
//! The [`Controller`] loads a configuration into a dependency graph, builds the units,
//! and re-evaluates the dependents of a unit every time it publishes new outputs.
//! Everything that modifies the graph happens on a single control task, the units run
//! on their own tasks.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use prometheus_client::registry::Registry as MetricsRegistry;

use crate::config::Block;
use crate::registry::{Registry, Stability};
use crate::service::ServiceRegistry;

mod control;
mod error;
mod foreach;
mod load;
mod metrics;
mod node;
mod query;
mod resolve;
mod scheduler;
mod unit;

pub use control::Controller;
pub use error::{ControllerError, Diagnostic, DiagnosticKind, LoadError, QueryError, ReconfigureError};
pub use foreach::fingerprint;
pub use node::Lifecycle;
pub use query::{NodeDetail, NodeInfo};
pub use resolve::ArgumentError;
pub use scheduler::PassReport;

/// Runs the load-time checks on a configuration, without starting anything.
///
/// Only the variables in `variables` can be used by the expressions.
pub fn validate<'a>(
    blocks: &[Block],
    variables: impl IntoIterator<Item = &'a str>,
    registry: &Registry,
    min_stability: Stability,
) -> Result<(), LoadError> {
    let names = load::Names {
        variables: variables.into_iter().map(str::to_owned).collect(),
        ..Default::default()
    };
    load::analyze(blocks, &names, registry, min_stability).map(|_| ())
}

/// Settings of a [`Controller`].
#[derive(Clone)]
pub struct ControllerOptions {
    /// Unit types that the configuration can declare.
    pub registry: Arc<Registry>,
    /// Services available to the units.
    pub services: Arc<ServiceRegistry>,
    /// Parent directory of the data directories of the units.
    pub data_dir: PathBuf,
    /// Least stable unit types that the configuration may use.
    pub min_stability: Stability,
    /// Maximum number of evaluations that run at the same time.
    pub workers: usize,
    /// How long a unit has to return from its run method after being cancelled.
    pub shutdown_grace: Duration,
    /// How long a unit has to apply new arguments. After that, the reconfiguration fails.
    pub update_timeout: Duration,
    /// Constructions that take longer than this are reported.
    pub construction_warning: Duration,
    /// Evaluations that take longer than this are counted as slow.
    pub slow_evaluation: Duration,
    /// Capacity of the request queue of each unit.
    pub request_queue_size: usize,
    /// Registry of the controller metrics and of the unit metrics.
    pub metrics: Arc<Mutex<MetricsRegistry>>,
}

impl ControllerOptions {
    pub fn new(registry: Arc<Registry>) -> Self {
        let workers = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
        Self {
            registry,
            services: Arc::new(ServiceRegistry::new()),
            data_dir: PathBuf::from("data"),
            min_stability: Stability::GenerallyAvailable,
            workers,
            shutdown_grace: Duration::from_secs(5),
            update_timeout: Duration::from_secs(5),
            construction_warning: Duration::from_secs(1),
            slow_evaluation: Duration::from_secs(1),
            request_queue_size: 16,
            metrics: Arc::new(Mutex::new(MetricsRegistry::default())),
        }
    }
}

impl std::fmt::Debug for ControllerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerOptions")
            .field("registry", &self.registry.len())
            .field("data_dir", &self.data_dir)
            .field("min_stability", &self.min_stability)
            .field("workers", &self.workers)
            .field("shutdown_grace", &self.shutdown_grace)
            .field("update_timeout", &self.update_timeout)
            .field("construction_warning", &self.construction_warning)
            .field("slow_evaluation", &self.slow_evaluation)
            .field("request_queue_size", &self.request_queue_size)
            .finish_non_exhaustive()
    }
}
