//! Services: collaborators that live outside of the graph.
//!
//! Units access services by name through [`Options::get_service_data`](crate::component::Options::get_service_data).
//! The agent registers the services before the controller is created.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::Serialize;
use thiserror::Error;

/// Name of the clustering service, see [`Cluster`].
pub const CLUSTER: &str = "cluster";

pub type ServiceData = Arc<dyn Any + Send + Sync>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ServiceError {
    #[error("service {0:?} does not exist")]
    NotFound(String),
    #[error("service {name:?} exists but does not have the expected type {expected}")]
    WrongType { name: String, expected: &'static str },
}

/// A set of services, indexed by name.
#[derive(Default, Clone)]
pub struct ServiceRegistry {
    services: FxHashMap<String, ServiceData>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a service. A service with the same name is replaced.
    pub fn insert<T: Any + Send + Sync>(&mut self, name: impl Into<String>, data: Arc<T>) {
        self.services.insert(name.into(), data);
    }

    pub fn get_service_data(&self, name: &str) -> Result<ServiceData, ServiceError> {
        self.services
            .get(name)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(name.to_owned()))
    }

    /// Gets a service and downcasts it to its concrete type.
    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> Result<Arc<T>, ServiceError> {
        self.get_service_data(name)?
            .downcast::<T>()
            .map_err(|_| ServiceError::WrongType {
                name: name.to_owned(),
                expected: std::any::type_name::<T>(),
            })
    }

    /// Gets the clustering service, if any.
    pub fn cluster(&self) -> Option<Arc<dyn Cluster>> {
        self.get::<Arc<dyn Cluster>>(CLUSTER).ok().map(|c| Arc::clone(&*c))
    }

    /// Registers the clustering service under the name [`CLUSTER`].
    pub fn set_cluster(&mut self, cluster: Arc<dyn Cluster>) {
        self.insert(CLUSTER, Arc::new(cluster));
    }
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.services.keys().collect();
        names.sort();
        f.debug_struct("ServiceRegistry").field("services", &names).finish()
    }
}

/// Part of the work that a peer of the cluster owns.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerOwnership {
    pub peer: String,
    pub address: String,
    /// Whether this peer is the local agent.
    pub is_self: bool,
    pub state: String,
    /// Share of the hash ring owned by the peer, in percent.
    pub ownership_percent: f32,
}

/// Clustering collaborator: reports which peer owns which part of the work.
pub trait Cluster: Send + Sync {
    fn ownership(&self) -> Vec<PeerOwnership>;
}

/// A cluster made of the local agent only, which owns all the work.
#[derive(Debug, Clone)]
pub struct SingleNodeCluster {
    pub name: String,
    pub address: String,
}

impl Cluster for SingleNodeCluster {
    fn ownership(&self) -> Vec<PeerOwnership> {
        vec![PeerOwnership {
            peer: self.name.clone(),
            address: self.address.clone(),
            is_self: true,
            state: String::from("participant"),
            ownership_percent: 100.0,
        }]
    }
}
