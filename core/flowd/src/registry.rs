//! Registry of unit types.
//!
//! The registry maps a type name, such as `local.value`, to the factory that builds
//! units of this type. It is written once, while the process initializes, then frozen:
//! the controller only reads it.

use std::any::type_name;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};

use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::component::{Component, Options};
use crate::value::Value;

/// Stability tier of a unit type, from the least to the most stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stability {
    Experimental,
    PublicPreview,
    GenerallyAvailable,
    Stable,
}

impl Stability {
    pub fn as_str(self) -> &'static str {
        match self {
            Stability::Experimental => "experimental",
            Stability::PublicPreview => "public-preview",
            Stability::GenerallyAvailable => "generally-available",
            Stability::Stable => "stable",
        }
    }
}

impl fmt::Display for Stability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "experimental" => Ok(Stability::Experimental),
            "public-preview" => Ok(Stability::PublicPreview),
            "generally-available" => Ok(Stability::GenerallyAvailable),
            "stable" => Ok(Stability::Stable),
            _ => Err(format!(
                "invalid stability level {s:?}, expected one of experimental, public-preview, generally-available, stable"
            )),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{what} is at stability level {stability}, which is below the minimum allowed stability level {minimum}")]
pub struct StabilityError {
    pub what: String,
    pub stability: Stability,
    pub minimum: Stability,
}

/// Checks that something at the given `stability` level can be used when the
/// minimum level is `minimum`.
pub fn check_allowed(stability: Stability, minimum: Stability, what: &str) -> Result<(), StabilityError> {
    if stability >= minimum {
        Ok(())
    } else {
        Err(StabilityError {
            what: what.to_owned(),
            stability,
            minimum,
        })
    }
}

type FactoryFn = dyn Fn(Options, Value) -> anyhow::Result<Box<dyn Component>> + Send + Sync;

/// Definition of a unit type.
#[derive(Clone)]
pub struct Registration {
    pub name: String,
    pub stability: Stability,
    /// Rust type of the arguments record.
    pub arguments: &'static str,
    /// Rust type of the exports record.
    pub exports: &'static str,
    factory: Arc<FactoryFn>,
}

impl Registration {
    /// Creates a registration for a unit type.
    ///
    /// The factory receives the decoded arguments record `A`. `E` is the type of the
    /// outputs that the unit publishes, use `()` if it publishes nothing.
    pub fn new<A, E, C, F>(name: impl Into<String>, stability: Stability, factory: F) -> Self
    where
        A: DeserializeOwned + 'static,
        E: 'static,
        C: Component,
        F: Fn(Options, A) -> anyhow::Result<C> + Send + Sync + 'static,
    {
        let name = name.into();
        let factory_name = name.clone();
        let erased = move |opts: Options, args: Value| -> anyhow::Result<Box<dyn Component>> {
            let args: A = args
                .decode()
                .map_err(|e| anyhow::anyhow!("invalid arguments for {factory_name}: {e}"))?;
            let component = factory(opts, args)?;
            Ok(Box::new(component))
        };
        Self {
            name,
            stability,
            arguments: type_name::<A>(),
            exports: type_name::<E>(),
            factory: Arc::new(erased),
        }
    }

    /// Builds a unit with untyped arguments.
    pub fn build(&self, opts: Options, args: Value) -> anyhow::Result<Box<dyn Component>> {
        (self.factory)(opts, args)
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("name", &self.name)
            .field("stability", &self.stability)
            .field("arguments", &self.arguments)
            .field("exports", &self.exports)
            .finish_non_exhaustive()
    }
}

/// Frozen set of unit types.
#[derive(Debug, Default)]
pub struct Registry {
    types: IndexMap<String, Registration>,
}

/// Builds a [`Registry`].
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    types: IndexMap<String, Registration>,
}

static GLOBAL: OnceLock<Arc<Registry>> = OnceLock::new();

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<&Registration> {
        self.types.get(name)
    }

    /// Iterates on the registered types, in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Registration> {
        self.types.values()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Installs the process-wide registry.
    ///
    /// Returns the registry back if a global registry has already been installed.
    pub fn install_global(registry: Registry) -> Result<Arc<Registry>, Registry> {
        let mut registry = Some(registry);
        let installed = GLOBAL.get_or_init(|| Arc::new(registry.take().unwrap_or_default()));
        match registry {
            None => Ok(Arc::clone(installed)),
            Some(rejected) => Err(rejected),
        }
    }

    /// Returns the process-wide registry, if it has been installed.
    pub fn global() -> Option<Arc<Registry>> {
        GLOBAL.get().cloned()
    }
}

impl RegistryBuilder {
    /// Registers a unit type.
    ///
    /// # Panics
    /// If a type with the same name has already been registered.
    pub fn register(&mut self, registration: Registration) -> &mut Self {
        let name = registration.name.clone();
        if self.types.insert(name.clone(), registration).is_some() {
            panic!("unit type {name:?} registered twice");
        }
        self
    }

    pub fn build(self) -> Registry {
        Registry { types: self.types }
    }
}
