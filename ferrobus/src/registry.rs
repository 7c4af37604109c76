//! In-process service registry.
//!
//! Maps service agent UIDs to their descriptors and factories. The
//! discovery of installed services from a packaging system is an
//! external concern; embedders populate the registry with the
//! services they want to make available to controllers and bundles.

use std::sync::Arc;

use hashbrown::HashMap;
use uuid::Uuid;

use ferrobus_core::error::{Error, Result};
use ferrobus_core::types::ServiceDescriptor;

use crate::config::ConfigTable;
use crate::micro::ComponentFactory;

/// Configuration check run before a component is started.
pub type ConfigCheck = Arc<dyn Fn(&ConfigTable) -> Result<()> + Send + Sync>;

/// One registered service: descriptor plus the factories its
/// descriptor locator strings point at.
#[derive(Clone)]
pub struct RegisteredService {
    /// Service descriptor.
    pub descriptor: ServiceDescriptor,
    /// Component factory, run inside the worker thread.
    pub factory: ComponentFactory,
    /// Configuration factory: load-and-validate check, run by the
    /// controller before start (fail early).
    pub config_check: ConfigCheck,
}

/// Registry of services that can be run by controllers.
#[derive(Default)]
pub struct ServiceRegistry {
    services: HashMap<Uuid, RegisteredService>,
}

impl ServiceRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service under its agent UID.
    ///
    /// # Errors
    ///
    /// Returns a service error when the agent UID is already taken.
    pub fn register(&mut self, service: RegisteredService) -> Result<()> {
        let uid = service.descriptor.agent.uid;
        if self.services.contains_key(&uid) {
            return Err(Error::service(format!("agent {uid} already registered")));
        }
        self.services.insert(uid, service);
        Ok(())
    }

    /// The service registered under `uid`.
    pub fn get(&self, uid: &Uuid) -> Option<&RegisteredService> {
        self.services.get(uid)
    }

    /// All registered services.
    pub fn iter(&self) -> impl Iterator<Item = &RegisteredService> {
        self.services.values()
    }

    /// Number of registered services.
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Returns true when no service is registered.
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
