//! Agent configuration options.
//!
//! We use `serde` to parse these options from the TOML config file.
//! Every option has a default value, so that the agent can run without a config file.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use flowd::config::Loader;
use flowd::controller::ControllerOptions;
use flowd::registry::{Registry, Stability};
use flowd::service::{ServiceRegistry, SingleNodeCluster};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    /// Path to the pipeline configuration.
    pub pipeline: PathBuf,
    /// Parent directory of the data directories of the components.
    pub data_dir: PathBuf,
    /// Least stable component types that the pipeline may use.
    pub min_stability: Stability,
    /// Maximum number of components evaluated at the same time. Defaults to the number of CPUs.
    pub workers: Option<usize>,
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
    /// How long a component has to apply new arguments.
    #[serde(with = "humantime_serde")]
    pub update_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub construction_warning: Duration,
    /// How long to wait for a component to report its health.
    #[serde(with = "humantime_serde")]
    pub query_timeout: Duration,
    /// Name of this agent in the cluster.
    pub node_name: String,
    /// Address of this agent in the cluster.
    pub node_address: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            pipeline: PathBuf::from("pipeline.toml"),
            data_dir: PathBuf::from("data"),
            min_stability: Stability::GenerallyAvailable,
            workers: None,
            shutdown_grace: Duration::from_secs(5),
            update_timeout: Duration::from_secs(5),
            construction_warning: Duration::from_secs(1),
            query_timeout: Duration::from_secs(1),
            node_name: String::from("local"),
            node_address: String::from("127.0.0.1"),
        }
    }
}

impl AgentConfig {
    /// Loads the config file, or returns the default config if it does not exist.
    ///
    /// `${VAR}` patterns are replaced by the value of the environment variable `VAR`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.try_exists()? {
            log::info!("Config file {path:?} not found, using the default config.");
            return Ok(Self::default());
        }
        let table = Loader::parse_file(path)
            .load_table()
            .with_context(|| format!("could not load config file {path:?}"))?;
        let config = table
            .try_into::<AgentConfig>()
            .with_context(|| format!("invalid config file {path:?}"))?;
        Ok(config)
    }

    /// Turns the config into the options of the controller.
    pub fn controller_options(&self, registry: Arc<Registry>) -> ControllerOptions {
        let mut services = ServiceRegistry::new();
        services.set_cluster(Arc::new(SingleNodeCluster {
            name: self.node_name.clone(),
            address: self.node_address.clone(),
        }));

        let mut options = ControllerOptions::new(registry);
        options.services = Arc::new(services);
        options.data_dir = self.data_dir.clone();
        options.min_stability = self.min_stability;
        if let Some(workers) = self.workers {
            options.workers = workers;
        }
        options.shutdown_grace = self.shutdown_grace;
        options.update_timeout = self.update_timeout;
        options.construction_warning = self.construction_warning;
        options
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use flowd::registry::Stability;
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    use super::AgentConfig;

    #[test]
    fn defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig::load(&dir.path().join("missing.toml")).unwrap();
        assert_eq!(config, AgentConfig::default());
    }

    #[test]
    fn partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.toml");
        std::fs::write(
            &path,
            indoc! {r#"
                pipeline = "/etc/flowd/pipeline.toml"
                min_stability = "experimental"
                shutdown_grace = "500ms"
                update_timeout = "2s"
            "#},
        )
        .unwrap();

        let config = AgentConfig::load(&path).unwrap();
        assert_eq!(config.pipeline.to_str(), Some("/etc/flowd/pipeline.toml"));
        assert_eq!(config.min_stability, Stability::Experimental);
        assert_eq!(config.shutdown_grace, Duration::from_millis(500));
        assert_eq!(config.update_timeout, Duration::from_secs(2));
        assert_eq!(config.query_timeout, AgentConfig::default().query_timeout);
    }

    #[test]
    fn unknown_option() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.toml");
        std::fs::write(&path, "pipelines = \"p.toml\"\n").unwrap();
        let err = AgentConfig::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("pipelines"), "{err:#}");
    }
}
