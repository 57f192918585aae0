//! Building blocks of the flowd agent.

use env_logger::Env;
use flowd::builtin::register_builtins;
use flowd::registry::Registry;

pub mod config;

/// Initializes the global logger.
///
/// The filter comes from `level` if set, otherwise from `RUST_LOG`, otherwise it is `info`.
///
/// Call this first!
pub fn init_logger(level: Option<&str>) {
    let mut builder = env_logger::Builder::from_env(Env::default().default_filter_or("info"));
    if let Some(level) = level {
        builder.parse_filters(level);
    }
    builder.init();

    // Print a warning if we are running in debug mode.
    #[cfg(debug_assertions)]
    {
        log::warn!("DEBUG assertions are enabled, this build of flowd is fine for debugging, but not for production.");
    }
}

/// Returns the unit types that the agent provides.
pub fn registry() -> Registry {
    let mut builder = Registry::builder();
    register_builtins(&mut builder);
    builder.build()
}
