//! flowd: runtime controller of declarative telemetry pipelines.
//!
//! A pipeline is a set of named, typed blocks. The arguments of a block are expressions
//! that can refer to the outputs of other blocks, which forms a dependency graph.
//! The [`Controller`](controller::Controller) owns that graph: it builds one unit per
//! block, and when a unit publishes new outputs, it re-evaluates the blocks that depend
//! on them, in topological order.
//!
//! # This crate
//! - [`value`]: the dynamically-typed values that units exchange.
//! - [`syntax`]: the expression language of the arguments.
//! - [`config`]: the TOML configuration of a pipeline.
//! - [`registry`] and [`component`]: how unit types are declared and implemented.
//! - [`controller`]: loading, evaluation and lifecycle of the units, plus introspection.
//! - [`builtin`]: a few units that are always available.
//!
//! The controller and the units run on **Tokio** tasks.
//!
//! # Example
//! ```ignore
//! let mut builder = Registry::builder();
//! flowd::builtin::register_builtins(&mut builder);
//! let options = ControllerOptions::new(Arc::new(builder.build()));
//! let controller = Controller::new(options);
//! controller.apply(Loader::parse_file("pipeline.toml").load()?).await?;
//! ```

pub mod builtin;
pub mod component;
pub mod config;
pub mod controller;
pub mod graph;
pub mod registry;
pub mod service;
pub mod syntax;
pub mod value;
