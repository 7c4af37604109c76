//! Component configuration tables and address interpolation.
//!
//! Components are configured from TOML tables. This module provides
//! typed accessors over [`ConfigTable`] (with unknown-option
//! rejection) and the [`AddressBook`]: the namespace store the bundle
//! controller fills with bound endpoint addresses so later components
//! can reference them through `${namespace:key}` interpolation.

use hashbrown::HashMap;

use ferrobus_core::endpoint::{Domain, ZmqAddress};
use ferrobus_core::error::{Error, Result};

/// Raw component configuration: one TOML table.
pub type ConfigTable = toml::value::Table;

/// Namespace for bound inproc addresses.
pub const SECTION_LOCAL_ADDRESS: &str = "local_address";
/// Namespace for bound ipc addresses.
pub const SECTION_NODE_ADDRESS: &str = "node_address";
/// Namespace for bound tcp addresses.
pub const SECTION_NET_ADDRESS: &str = "net_address";
/// Namespace for service agent UIDs.
pub const SECTION_SERVICE_UID: &str = "service_uid";
/// Namespace for component peer UIDs.
pub const SECTION_PEER_UID: &str = "peer_uid";

/// String option from a table.
pub fn get_str(table: &ConfigTable, key: &str) -> Result<Option<String>> {
    match table.get(key) {
        None => Ok(None),
        Some(toml::Value::String(value)) => Ok(Some(value.clone())),
        Some(other) => Err(Error::config(format!(
            "option '{key}' must be a string, got {}",
            other.type_str()
        ))),
    }
}

/// Required string option from a table.
pub fn require_str(table: &ConfigTable, key: &str) -> Result<String> {
    get_str(table, key)?.ok_or_else(|| Error::config(format!("missing required option '{key}'")))
}

/// Boolean option with a default.
pub fn get_bool(table: &ConfigTable, key: &str, default: bool) -> Result<bool> {
    match table.get(key) {
        None => Ok(default),
        Some(toml::Value::Boolean(value)) => Ok(*value),
        Some(other) => Err(Error::config(format!(
            "option '{key}' must be a boolean, got {}",
            other.type_str()
        ))),
    }
}

/// Integer option with a default.
pub fn get_int(table: &ConfigTable, key: &str, default: i64) -> Result<i64> {
    match table.get(key) {
        None => Ok(default),
        Some(toml::Value::Integer(value)) => Ok(*value),
        Some(other) => Err(Error::config(format!(
            "option '{key}' must be an integer, got {}",
            other.type_str()
        ))),
    }
}

/// String-list option from a table.
pub fn get_str_list(table: &ConfigTable, key: &str) -> Result<Vec<String>> {
    match table.get(key) {
        None => Ok(Vec::new()),
        Some(toml::Value::Array(values)) => values
            .iter()
            .map(|value| match value {
                toml::Value::String(s) => Ok(s.clone()),
                other => Err(Error::config(format!(
                    "option '{key}' must be a list of strings, got {}",
                    other.type_str()
                ))),
            })
            .collect(),
        Some(other) => Err(Error::config(format!(
            "option '{key}' must be a list, got {}",
            other.type_str()
        ))),
    }
}

/// Endpoint address option from a table.
pub fn get_address(table: &ConfigTable, key: &str) -> Result<Option<ZmqAddress>> {
    match get_str(table, key)? {
        None => Ok(None),
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|err| Error::config(format!("option '{key}': {err}"))),
    }
}

/// Required endpoint address option from a table.
pub fn require_address(table: &ConfigTable, key: &str) -> Result<ZmqAddress> {
    get_address(table, key)?
        .ok_or_else(|| Error::config(format!("missing required option '{key}'")))
}

/// Reject options outside the known set.
pub fn ensure_known(table: &ConfigTable, known: &[&str]) -> Result<()> {
    for key in table.keys() {
        if !known.contains(&key.as_str()) {
            return Err(Error::config(format!("unknown option '{key}'")));
        }
    }
    Ok(())
}

/// Namespace store for bundle-level configuration interpolation.
///
/// The bundle controller writes each bound endpoint under
/// `<component>.<channel>` into the namespace matching its address
/// domain; component sections may then reference the values as
/// `${namespace:key}`.
#[derive(Debug, Default)]
pub struct AddressBook {
    namespaces: HashMap<String, HashMap<String, String>>,
}

impl AddressBook {
    /// Empty book with the standard namespaces.
    pub fn new() -> Self {
        let mut namespaces = HashMap::new();
        for section in [
            SECTION_LOCAL_ADDRESS,
            SECTION_NODE_ADDRESS,
            SECTION_NET_ADDRESS,
            SECTION_SERVICE_UID,
            SECTION_PEER_UID,
        ] {
            namespaces.insert(section.to_string(), HashMap::new());
        }
        Self { namespaces }
    }

    /// Record a value under `namespace:key`.
    pub fn insert(&mut self, namespace: &str, key: &str, value: &str) {
        self.namespaces
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
    }

    /// Record a bound endpoint under the namespace of its domain.
    pub fn insert_endpoint(&mut self, key: &str, address: &ZmqAddress) {
        let namespace = match address.domain() {
            Domain::Local => SECTION_LOCAL_ADDRESS,
            Domain::Node => SECTION_NODE_ADDRESS,
            Domain::Network => SECTION_NET_ADDRESS,
        };
        self.insert(namespace, key, address.as_str());
    }

    /// Look up `namespace:key`.
    pub fn resolve(&self, namespace: &str, key: &str) -> Option<&str> {
        self.namespaces
            .get(namespace)
            .and_then(|ns| ns.get(key))
            .map(String::as_str)
    }

    /// Interpolate every `${namespace:key}` reference in `value`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for unterminated or unknown
    /// references.
    pub fn interpolate(&self, value: &str) -> Result<String> {
        let mut result = String::with_capacity(value.len());
        let mut rest = value;
        while let Some(start) = rest.find("${") {
            result.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after
                .find('}')
                .ok_or_else(|| Error::config(format!("unterminated reference in '{value}'")))?;
            let reference = &after[..end];
            let (namespace, key) = reference.split_once(':').ok_or_else(|| {
                Error::config(format!("malformed reference '${{{reference}}}'"))
            })?;
            let resolved = self.resolve(namespace, key).ok_or_else(|| {
                Error::config(format!("unresolved reference '${{{reference}}}'"))
            })?;
            result.push_str(resolved);
            rest = &after[end + 1..];
        }
        result.push_str(rest);
        Ok(result)
    }

    /// Interpolate all string values of a configuration table.
    pub fn interpolate_table(&self, table: &ConfigTable) -> Result<ConfigTable> {
        let mut result = ConfigTable::new();
        for (key, value) in table {
            let value = match value {
                toml::Value::String(s) => toml::Value::String(self.interpolate(s)?),
                other => other.clone(),
            };
            result.insert(key.clone(), value);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(source: &str) -> ConfigTable {
        toml::from_str(source).unwrap()
    }

    #[test]
    fn test_typed_getters() {
        let cfg = table(
            r#"
            pipe = "data-1"
            batch_size = 25
            stop_on_close = false
            tags = ["a", "b"]
            "#,
        );
        assert_eq!(require_str(&cfg, "pipe").unwrap(), "data-1");
        assert_eq!(get_int(&cfg, "batch_size", 50).unwrap(), 25);
        assert_eq!(get_int(&cfg, "missing", 50).unwrap(), 50);
        assert!(!get_bool(&cfg, "stop_on_close", true).unwrap());
        assert_eq!(get_str_list(&cfg, "tags").unwrap(), vec!["a", "b"]);
        assert!(require_str(&cfg, "missing").is_err());
        assert!(get_bool(&cfg, "pipe", true).is_err());
    }

    #[test]
    fn test_ensure_known_rejects_strangers() {
        let cfg = table("pipe = \"x\"\ntypo_option = 1\n");
        assert!(ensure_known(&cfg, &["pipe"]).is_err());
        assert!(ensure_known(&cfg, &["pipe", "typo_option"]).is_ok());
    }

    #[test]
    fn test_address_option() {
        let cfg = table("pipe_address = \"tcp://127.0.0.1:*\"\nbad = \"nope\"\n");
        let addr = require_address(&cfg, "pipe_address").unwrap();
        assert_eq!(addr.as_str(), "tcp://127.0.0.1:*");
        assert!(get_address(&cfg, "bad").is_err());
    }

    #[test]
    fn test_endpoint_namespaces() {
        let mut book = AddressBook::new();
        book.insert_endpoint("a.service", &"ipc:///tmp/a".parse().unwrap());
        book.insert_endpoint("a.ctrl", &"inproc://a-ctrl".parse().unwrap());
        book.insert_endpoint("a.api", &"tcp://127.0.0.1:5001".parse().unwrap());
        assert_eq!(book.resolve(SECTION_NODE_ADDRESS, "a.service"), Some("ipc:///tmp/a"));
        assert_eq!(book.resolve(SECTION_LOCAL_ADDRESS, "a.ctrl"), Some("inproc://a-ctrl"));
        assert_eq!(book.resolve(SECTION_NET_ADDRESS, "a.api"), Some("tcp://127.0.0.1:5001"));
    }

    #[test]
    fn test_interpolation() {
        let mut book = AddressBook::new();
        book.insert_endpoint("a.service", &"ipc:///tmp/a".parse().unwrap());
        assert_eq!(
            book.interpolate("${node_address:a.service}").unwrap(),
            "ipc:///tmp/a"
        );
        assert_eq!(
            book.interpolate("pre ${node_address:a.service} post").unwrap(),
            "pre ipc:///tmp/a post"
        );
        assert_eq!(book.interpolate("no refs").unwrap(), "no refs");
        assert!(book.interpolate("${node_address:missing}").is_err());
        assert!(book.interpolate("${broken").is_err());
        assert!(book.interpolate("${noseparator}").is_err());
    }

    #[test]
    fn test_interpolate_table() {
        let mut book = AddressBook::new();
        book.insert_endpoint("a.pipe", &"tcp://127.0.0.1:5002".parse().unwrap());
        let cfg = table("pipe_address = \"${net_address:a.pipe}\"\nbatch_size = 10\n");
        let resolved = book.interpolate_table(&cfg).unwrap();
        assert_eq!(
            require_str(&resolved, "pipe_address").unwrap(),
            "tcp://127.0.0.1:5002"
        );
        assert_eq!(get_int(&resolved, "batch_size", 0).unwrap(), 10);
    }
}
