//! Endpoint addresses for channel binding and connecting.
//!
//! A [`ZmqAddress`] keeps the textual ZMQ endpoint form (so wildcard
//! specifications such as `tcp://127.0.0.1:*` survive round-trips) and
//! classifies the transport into an address [`Domain`] used by the
//! bundle controller's address namespaces.

use std::fmt;
use std::str::FromStr;

/// Address domain of a ZMQ endpoint, derived from its transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Domain {
    /// In-process transport (`inproc://`), visible within one process.
    Local,
    /// Inter-process transport (`ipc://`), visible within one node.
    Node,
    /// Network transport (`tcp://`), visible across nodes.
    Network,
}

impl Domain {
    /// Get the domain as a string name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Local => "local",
            Domain::Node => "node",
            Domain::Network => "network",
        }
    }
}

/// Transport endpoint address.
///
/// Supported formats:
/// - `tcp://host:port` (port may be `*` for wildcard bind)
/// - `ipc://path` (Unix domain socket)
/// - `inproc://name`
///
/// # Examples
///
/// ```
/// use ferrobus_core::endpoint::{Domain, ZmqAddress};
///
/// let addr: ZmqAddress = "tcp://127.0.0.1:5555".parse().unwrap();
/// assert_eq!(addr.domain(), Domain::Network);
///
/// let addr: ZmqAddress = "inproc://control".parse().unwrap();
/// assert_eq!(addr.domain(), Domain::Local);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ZmqAddress {
    address: String,
    domain: Domain,
}

impl ZmqAddress {
    /// Parse an endpoint address from a string.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown schemes or an empty endpoint part.
    pub fn parse(s: &str) -> Result<Self, AddressError> {
        s.parse()
    }

    /// The full address string, e.g. `tcp://127.0.0.1:5555`.
    pub fn as_str(&self) -> &str {
        &self.address
    }

    /// Address domain derived from the transport scheme.
    pub fn domain(&self) -> Domain {
        self.domain
    }

    /// Returns true for in-process endpoints.
    pub fn is_inproc(&self) -> bool {
        self.domain == Domain::Local
    }
}

impl FromStr for ZmqAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| AddressError::InvalidScheme(s.to_string()))?;
        if rest.is_empty() {
            return Err(AddressError::EmptyEndpoint(s.to_string()));
        }
        let domain = match scheme {
            "tcp" => Domain::Network,
            "ipc" => Domain::Node,
            "inproc" => Domain::Local,
            _ => return Err(AddressError::InvalidScheme(s.to_string())),
        };
        Ok(ZmqAddress { address: s.to_string(), domain })
    }
}

impl fmt::Display for ZmqAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)
    }
}

/// Errors that can occur when parsing endpoint addresses.
#[derive(Debug, thiserror::Error)]
pub enum AddressError {
    #[error("invalid scheme in endpoint: {0} (expected tcp://, ipc://, or inproc://)")]
    InvalidScheme(String),

    #[error("empty endpoint part in address: {0}")]
    EmptyEndpoint(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp() {
        let addr = ZmqAddress::parse("tcp://127.0.0.1:5555").unwrap();
        assert_eq!(addr.domain(), Domain::Network);
        assert_eq!(addr.to_string(), "tcp://127.0.0.1:5555");
    }

    #[test]
    fn test_parse_tcp_wildcard_port() {
        let addr = ZmqAddress::parse("tcp://127.0.0.1:*").unwrap();
        assert_eq!(addr.domain(), Domain::Network);
        assert_eq!(addr.as_str(), "tcp://127.0.0.1:*");
    }

    #[test]
    fn test_parse_ipc() {
        let addr = ZmqAddress::parse("ipc:///tmp/test.sock").unwrap();
        assert_eq!(addr.domain(), Domain::Node);
    }

    #[test]
    fn test_parse_inproc() {
        let addr = ZmqAddress::parse("inproc://my-endpoint").unwrap();
        assert_eq!(addr.domain(), Domain::Local);
        assert!(addr.is_inproc());
    }

    #[test]
    fn test_invalid_scheme() {
        assert!(matches!(
            ZmqAddress::parse("http://127.0.0.1:80"),
            Err(AddressError::InvalidScheme(_))
        ));
        assert!(matches!(
            ZmqAddress::parse("garbage"),
            Err(AddressError::InvalidScheme(_))
        ));
    }

    #[test]
    fn test_empty_endpoint() {
        assert!(matches!(
            ZmqAddress::parse("inproc://"),
            Err(AddressError::EmptyEndpoint(_))
        ));
    }
}
