use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use flowd::config::Loader;
use flowd::controller::{self, Controller, PassReport};
use flowd::registry::Registry;
use flowd_agent::config::AgentConfig;
use flowd_agent::init_logger;

const BINARY: &str = env!("CARGO_BIN_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Main agent function.
///
/// The steps are:
/// - parse the CLI
/// - parse the config file and apply the CLI overrides
/// - run the command (by default: load the pipeline and run it until Ctrl+C)
///
/// About errors: we use `anyhow::Result` and `context` instead of `expect` to get
/// nicer error messages (`expect` prints errors with `Debug`).
fn main() -> anyhow::Result<()> {
    let args = cli::Cli::parse();
    init_logger(args.common.log_level.as_deref());
    let registry = flowd_agent::registry();

    match args.command.unwrap_or(cli::Command::Run) {
        cli::Command::Components => {
            print_components(&registry);
            Ok(())
        }
        cli::Command::Check => {
            let config = load_config(&args.common)?;
            check(&config, &registry)
        }
        cli::Command::Run => {
            log::info!("Starting flowd agent '{BINARY}' v{VERSION}");
            let config = load_config(&args.common)?;
            let rt = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("could not start the Tokio runtime")?;
            rt.block_on(run(config, registry))
        }
    }
}

/// Loads the agent config and applies the CLI overrides.
fn load_config(args: &cli::CommonArgs) -> anyhow::Result<AgentConfig> {
    let mut config = AgentConfig::load(&args.config)?;
    if let Some(pipeline) = &args.pipeline {
        config.pipeline = pipeline.clone();
    }
    if let Some(data_dir) = &args.data_dir {
        config.data_dir = data_dir.clone();
    }
    if let Some(min_stability) = args.min_stability {
        config.min_stability = min_stability;
    }
    Ok(config)
}

fn print_components(registry: &Registry) {
    println!("Available components:");
    for r in registry.iter() {
        println!("- {} ({})", r.name, r.stability);
        println!("    arguments: {}", r.arguments);
        println!("    exports: {}", r.exports);
    }
}

/// Checks the pipeline without running it.
fn check(config: &AgentConfig, registry: &Registry) -> anyhow::Result<()> {
    let blocks = Loader::parse_file(&config.pipeline)
        .load()
        .with_context(|| format!("could not load pipeline {:?}", config.pipeline))?;
    controller::validate(&blocks, [], registry, config.min_stability)?;
    println!("The pipeline {:?} is valid ({} blocks).", config.pipeline, blocks.len());
    Ok(())
}

async fn run(config: AgentConfig, registry: Registry) -> anyhow::Result<()> {
    let registry = Registry::install_global(registry)
        .map_err(|_| anyhow::anyhow!("the registry of components has already been installed"))?;
    let controller = Controller::new(config.controller_options(registry));

    if let Err(e) = load_pipeline(&controller, &config.pipeline).await {
        controller.shutdown().await;
        return Err(e.context("startup failure"));
    }
    log_status(&controller, config.query_timeout).await;
    log::info!("🔥 flowd agent is ready");

    let mut reload = signal::Reload::new().context("could not listen for the reload signal")?;
    loop {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res.context("could not listen for the termination signal")?;
                log::info!("Termination signal received, shutting down...");
                break;
            }
            _ = reload.recv() => {
                log::info!("Reload signal received, reloading {:?}...", config.pipeline);
                match load_pipeline(&controller, &config.pipeline).await {
                    Ok(()) => log_status(&controller, config.query_timeout).await,
                    Err(e) => log::error!("Reload failed, the previous pipeline keeps running: {e:#}"),
                }
            }
        }
    }

    controller.shutdown().await;
    log::info!("flowd agent stopped");
    Ok(())
}

async fn load_pipeline(controller: &Controller, path: &Path) -> anyhow::Result<()> {
    let blocks = Loader::parse_file(path)
        .load()
        .with_context(|| format!("could not load pipeline {path:?}"))?;
    let report = controller.apply(blocks).await?;
    print_report(&report);
    Ok(())
}

fn print_report(report: &PassReport) {
    log::info!(
        "Pipeline applied: {} built, {} reconfigured, {} removed, {} failed, {} blocked.",
        report.built.len(),
        report.reconfigured.len(),
        report.removed.len(),
        report.failed.len(),
        report.blocked.len()
    );
}

/// Logs the components that are not healthy.
async fn log_status(controller: &Controller, timeout: Duration) {
    for info in controller.list_nodes() {
        let health = match controller.node(&info.id, timeout).await {
            Ok(detail) => detail.info.health,
            Err(e) => {
                log::warn!("{e}");
                continue;
            }
        };
        if !health.is_healthy() {
            log::warn!("{} is {}: {}", info.id, health.health.as_str(), health.message);
        }
    }
}

mod signal {
    /// Reload signal: SIGHUP on Unix. Never received on the other platforms.
    pub struct Reload {
        #[cfg(unix)]
        inner: tokio::signal::unix::Signal,
    }

    impl Reload {
        pub fn new() -> std::io::Result<Self> {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{SignalKind, signal};
                Ok(Self {
                    inner: signal(SignalKind::hangup())?,
                })
            }
            #[cfg(not(unix))]
            {
                Ok(Self {})
            }
        }

        pub async fn recv(&mut self) {
            #[cfg(unix)]
            {
                if self.inner.recv().await.is_some() {
                    return;
                }
            }
            std::future::pending::<()>().await
        }
    }
}

/// Agent command-line interface (CLI).
///
/// We use `clap` to parse these options, therefore the structs
/// derive [`clap::Args`] or other clap trait implementations.
mod cli {
    use std::path::PathBuf;
    use std::str::FromStr;

    use clap::{Args, Parser, Subcommand};
    use flowd::registry::Stability;

    // NOTE: the doc comment attached to `Cli` is used by clap as the description of
    // the application. It is displayed at the start of the help message.

    /// flowd agent: run a telemetry pipeline.
    #[derive(Parser)]
    #[command(version)]
    pub struct Cli {
        #[command(subcommand)]
        pub command: Option<Command>,

        #[command(flatten)]
        pub common: CommonArgs,
    }

    #[derive(Subcommand)]
    pub enum Command {
        /// Run the pipeline until the agent is stopped.
        ///
        /// This is the default command. Send SIGHUP to reload the pipeline.
        Run,

        /// Check the pipeline configuration and stop.
        Check,

        /// Print the available component types.
        Components,
    }

    /// Common CLI arguments.
    #[derive(Args, Clone)]
    pub struct CommonArgs {
        /// Path to the config file of the agent.
        #[arg(long, global = true, env = "FLOWD_CONFIG", default_value = "agent.toml")]
        pub config: PathBuf,

        /// Path to the pipeline configuration. Overrides the config file.
        #[arg(long, global = true)]
        pub pipeline: Option<PathBuf>,

        /// Parent directory of the data directories of the components. Overrides the config file.
        #[arg(long, global = true)]
        pub data_dir: Option<PathBuf>,

        /// Least stable component types that the pipeline may use, ex. `public-preview`.
        #[arg(long, global = true, value_parser = Stability::from_str)]
        pub min_stability: Option<Stability>,

        /// Log filter, ex. `debug` or `flowd=trace`. Overrides `RUST_LOG`.
        #[arg(long, global = true)]
        pub log_level: Option<String>,
    }
}
