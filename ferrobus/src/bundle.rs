//! Bundle controller: ordered startup of a collection of components.
//!
//! A bundle is configured from a TOML document: the `[bundle]` section
//! lists instance names, each with its own section carrying the agent
//! UID and the component options. Components start in declaration
//! order; after each start the bundle writes the bound endpoints into
//! the `local_address`/`node_address`/`net_address` namespaces under
//! `<name>.<channel>`, so later sections can reference them through
//! `${namespace:key}` interpolation. Teardown runs in reverse order.

use uuid::Uuid;

use ferrobus_core::error::{Error, Result};

use crate::config::{
    ensure_known, get_str_list, require_str, AddressBook, ConfigTable, SECTION_PEER_UID,
    SECTION_SERVICE_UID,
};
use crate::controller::ThreadController;
use crate::registry::ServiceRegistry;

/// Default configuration section with the bundle definition.
pub const SECTION_BUNDLE: &str = "bundle";

struct BundleEntry {
    name: String,
    config: ConfigTable,
    controller: ThreadController,
    started: bool,
}

/// Controller managing a collection of services in worker threads.
pub struct BundleController {
    zmq: zmq::Context,
    addresses: AddressBook,
    entries: Vec<BundleEntry>,
}

impl BundleController {
    /// Bundle controller over a shared ZMQ context.
    pub fn new(zmq: zmq::Context) -> Self {
        Self { zmq, addresses: AddressBook::new(), entries: Vec::new() }
    }

    /// The bundle's address namespaces.
    pub fn addresses(&self) -> &AddressBook {
        &self.addresses
    }

    /// Instance names in declaration order.
    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.name.clone()).collect()
    }

    /// The controller of one instance.
    pub fn controller(&self, name: &str) -> Option<&ThreadController> {
        self.entries
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| &entry.controller)
    }

    /// Build the bundle from configuration.
    ///
    /// Reads the instance list from `config[section]` (default
    /// `[bundle]`), resolves each instance's agent through the service
    /// registry and assigns it a fresh peer UID.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for malformed sections and a
    /// service error for unknown agents.
    pub fn configure(
        &mut self,
        registry: &ServiceRegistry,
        config: &ConfigTable,
        section: Option<&str>,
    ) -> Result<()> {
        let section = section.unwrap_or(SECTION_BUNDLE);
        let bundle = match config.get(section) {
            Some(toml::Value::Table(table)) => table,
            _ => return Err(Error::config(format!("missing bundle section '{section}'"))),
        };
        ensure_known(bundle, &["agents"])?;
        let agents = get_str_list(bundle, "agents")?;
        if agents.is_empty() {
            return Err(Error::config("bundle lists no agents"));
        }
        // Announce the registered agents for interpolation.
        for service in registry.iter() {
            self.addresses.insert(
                SECTION_SERVICE_UID,
                &service.descriptor.agent.name,
                &service.descriptor.agent.uid.simple().to_string(),
            );
        }
        for name in agents {
            let instance = match config.get(&name) {
                Some(toml::Value::Table(table)) => table.clone(),
                _ => {
                    self.entries.clear();
                    return Err(Error::config(format!("missing section '{name}'")));
                }
            };
            let agent_value = self.addresses.interpolate(&require_str(&instance, "agent")?)?;
            let agent_uid: Uuid = agent_value
                .parse()
                .map_err(|_| Error::config(format!("bad agent UID in section '{name}'")))?;
            let Some(service) = registry.get(&agent_uid) else {
                self.entries.clear();
                return Err(Error::service(format!("unknown agent in section '{name}'")));
            };
            let peer_uid = Uuid::new_v4();
            self.addresses
                .insert(SECTION_PEER_UID, &name, &peer_uid.simple().to_string());
            let controller =
                ThreadController::new(self.zmq.clone(), service, Some(&name), Some(peer_uid));
            let mut config = instance;
            config.remove("agent");
            self.entries.push(BundleEntry { name, config, controller, started: false });
        }
        Ok(())
    }

    /// Start all services in declaration order.
    ///
    /// After each successful start the bound endpoints are written
    /// into the address namespaces; later components are configured
    /// with their references interpolated.
    ///
    /// If any service fails to start, all previously started services
    /// are stopped (in reverse order) and the failure is returned.
    pub fn start(&mut self, timeout_ms: i64) -> Result<()> {
        for index in 0..self.entries.len() {
            let result = self.start_entry(index, timeout_ms);
            if let Err(err) = result {
                tracing::error!(
                    service = self.entries[index].name.as_str(),
                    error = %err,
                    "bundle start failed"
                );
                self.stop(Some(timeout_ms));
                return Err(err);
            }
        }
        Ok(())
    }

    fn start_entry(&mut self, index: usize, timeout_ms: i64) -> Result<()> {
        let config = self.addresses.interpolate_table(&self.entries[index].config)?;
        let entry = &mut self.entries[index];
        entry.controller.configure(config)?;
        entry.controller.start(timeout_ms)?;
        entry.started = true;
        for (channel, addresses) in &entry.controller.state.endpoints {
            let key = format!("{}.{}", entry.name, channel);
            for address in addresses {
                self.addresses.insert_endpoint(&key, address);
            }
        }
        Ok(())
    }

    /// Stop all running services, in reverse start order.
    ///
    /// A failure to stop one service is logged; its worker is
    /// terminated best-effort and the teardown continues with the
    /// remaining services.
    pub fn stop(&mut self, timeout_ms: Option<i64>) {
        for entry in self.entries.iter_mut().rev() {
            if !entry.started {
                continue;
            }
            if let Err(err) = entry.controller.stop(timeout_ms) {
                tracing::error!(
                    service = entry.name.as_str(),
                    error = %err,
                    "error while stopping the service"
                );
                if entry.controller.is_running() {
                    tracing::warn!(
                        service = entry.name.as_str(),
                        "stopping failed, terminating service worker"
                    );
                    if let Err(err) = entry.controller.terminate() {
                        tracing::error!(service = entry.name.as_str(), error = %err, "terminate failed");
                    }
                }
            }
            entry.started = false;
        }
    }

    /// Wait until all service workers stop.
    pub fn join(&mut self, timeout_ms: Option<i64>) -> Result<()> {
        for entry in &mut self.entries {
            entry.controller.join(timeout_ms)?;
        }
        Ok(())
    }
}
