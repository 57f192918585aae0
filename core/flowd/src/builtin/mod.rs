//! Units that are always available.
//!
//! They are small on purpose: they are used to try pipelines out and in the tests.

mod logger;
mod ticker;
mod value;

pub use logger::{LogArguments, LogUnit};
pub use ticker::{TickerArguments, TickerExports, TickerUnit};
pub use value::{ValueArguments, ValueExports, ValueUnit};

use crate::registry::RegistryBuilder;

/// Registers the builtin unit types.
pub fn register_builtins(builder: &mut RegistryBuilder) {
    builder
        .register(value::registration())
        .register(logger::registration())
        .register(ticker::registration());
}

#[cfg(test)]
mod tests {
    use super::register_builtins;
    use crate::registry::{Registry, Stability};

    #[test]
    fn builtins() {
        let mut builder = Registry::builder();
        register_builtins(&mut builder);
        let registry = builder.build();
        let types: Vec<_> = registry.iter().map(|r| (r.name.as_str(), r.stability)).collect();
        assert_eq!(
            types,
            vec![
                ("local.value", Stability::GenerallyAvailable),
                ("local.log", Stability::PublicPreview),
                ("local.ticker", Stability::Experimental),
            ]
        );
    }
}
