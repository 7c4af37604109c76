//! Dataframe payloads carried inside protocol message frames.
//!
//! The wire protocols treat these as opaque payload frames; the
//! structures here define their content: peer/agent identification for
//! the FBSP handshake, the FBDP open request, error descriptions, and
//! the ICCP endpoints map. Frames are encoded with MessagePack.

use bytes::Bytes;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use ferrobus_core::endpoint::ZmqAddress;
use ferrobus_core::error::{Error, Result};
use ferrobus_core::types::{
    AgentDescriptor, EndpointMap, PeerDescriptor, Supplement,
};

/// Encode a dataframe into a payload frame.
///
/// Serialization of these plain structures cannot fail in practice;
/// a failure is logged and yields an empty frame.
pub fn encode<T: Serialize>(value: &T) -> Bytes {
    match rmp_serde::to_vec(value) {
        Ok(data) => Bytes::from(data),
        Err(err) => {
            tracing::error!(error = %err, "dataframe serialization failed");
            Bytes::new()
        }
    }
}

/// Decode a payload frame into a dataframe.
///
/// # Errors
///
/// Returns an invalid-message error when the frame does not decode.
pub fn decode<'a, T: Deserialize<'a>>(data: &'a [u8]) -> Result<T> {
    rmp_serde::from_slice(data).map_err(|err| Error::invalid(format!("bad dataframe: {err}")))
}

/// Peer identification part of handshake dataframes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Peer ID.
    pub uid: Uuid,
    /// Peer process ID.
    pub pid: u32,
    /// Host name.
    pub host: String,
    /// Optional supplemental information.
    #[serde(default)]
    pub supplement: Option<Supplement>,
}

impl From<&PeerDescriptor> for PeerInfo {
    fn from(peer: &PeerDescriptor) -> Self {
        Self {
            uid: peer.uid,
            pid: peer.pid,
            host: peer.host.clone(),
            supplement: peer.supplement.clone(),
        }
    }
}

impl From<PeerInfo> for PeerDescriptor {
    fn from(info: PeerInfo) -> Self {
        PeerDescriptor {
            uid: info.uid,
            pid: info.pid,
            host: info.host,
            supplement: info.supplement,
        }
    }
}

/// Agent identification part of handshake dataframes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    /// Agent ID.
    pub uid: Uuid,
    /// Agent name.
    pub name: String,
    /// Agent version string.
    pub version: String,
    /// Vendor ID.
    pub vendor_uid: Uuid,
    /// Agent classification string.
    pub classification: String,
    /// Platform ID.
    pub platform_uid: Uuid,
    /// Platform version string.
    pub platform_version: String,
}

impl From<&AgentDescriptor> for AgentInfo {
    fn from(agent: &AgentDescriptor) -> Self {
        Self {
            uid: agent.uid,
            name: agent.name.clone(),
            version: agent.version.clone(),
            vendor_uid: agent.vendor_uid,
            classification: agent.classification.clone(),
            platform_uid: agent.platform_uid,
            platform_version: agent.platform_version.clone(),
        }
    }
}

/// One advertised service API interface.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InterfaceSpec {
    /// Position of the interface in the service's interface list; the
    /// high byte of API request codes.
    pub number: u16,
    /// Interface ID.
    pub uid: Uuid,
}

/// Dataframe of the FBSP `HELLO` message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HelloDataframe {
    /// Client instance identification.
    pub instance: PeerInfo,
    /// Client agent identification.
    pub client: AgentInfo,
}

/// Dataframe of the FBSP `WELCOME` message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WelcomeDataframe {
    /// Service instance identification.
    pub instance: PeerInfo,
    /// Service agent identification.
    pub service: AgentInfo,
    /// Advertised API interfaces.
    pub api: Vec<InterfaceSpec>,
}

/// Dataframe of the FBSP `CANCEL` message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CancelRequests {
    /// Token of the request to cancel.
    pub token: Vec<u8>,
}

/// Dataframe of the FBSP `STATE` message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateInformation {
    /// Reported service state (wire value of
    /// [`State`](ferrobus_core::types::State)).
    pub state: u16,
}

/// Dataframe of the FBDP `OPEN` message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpenDataframe {
    /// Data pipe identification; must not be empty.
    pub data_pipe: String,
    /// Requested pipe socket (wire value of
    /// [`PipeSocket`](ferrobus_core::types::PipeSocket)).
    pub pipe_socket: u8,
    /// MIME data format specification; must not be empty.
    pub data_format: String,
    /// Data pipe parameters.
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

/// Error description carried in FBSP `ERROR` and FBDP `CLOSE` payloads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorDescription {
    /// Numeric error code, when one applies.
    pub code: Option<u32>,
    /// Human-readable description; must not be empty.
    pub description: String,
    /// Additional annotations (e.g. an error chain rendering).
    #[serde(default)]
    pub annotation: HashMap<String, String>,
}

impl ErrorDescription {
    /// Description of one error, with the stop code when present and a
    /// chain annotation for unexpected errors.
    pub fn from_error(err: &Error) -> Self {
        let mut desc = ErrorDescription {
            code: err.stop_code().map(u32::from),
            description: err.to_string(),
            annotation: HashMap::new(),
        };
        if !matches!(err, Error::Stop { .. }) {
            desc.annotation.insert("error".to_string(), format!("{err:?}"));
        }
        desc
    }

    /// Descriptions for an error and its source chain, outermost
    /// first.
    pub fn from_error_chain(err: &Error) -> Vec<Self> {
        let mut descriptions = vec![Self::from_error(err)];
        let mut source = std::error::Error::source(err);
        while let Some(cause) = source {
            descriptions.push(ErrorDescription {
                code: None,
                description: cause.to_string(),
                annotation: HashMap::new(),
            });
            source = cause.source();
        }
        descriptions
    }
}

/// Wire form of the ICCP endpoints map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointsFrame {
    /// Channel name to bound address strings.
    pub channels: HashMap<String, Vec<String>>,
}

impl EndpointsFrame {
    /// Build the wire form from an endpoint map.
    pub fn from_map(endpoints: &EndpointMap) -> Self {
        let channels = endpoints
            .iter()
            .map(|(name, addrs)| {
                (name.clone(), addrs.iter().map(|a| a.as_str().to_string()).collect())
            })
            .collect();
        Self { channels }
    }

    /// Convert back into an endpoint map.
    ///
    /// # Errors
    ///
    /// Returns an invalid-message error when an address does not parse.
    pub fn into_map(self) -> Result<EndpointMap> {
        let mut map = EndpointMap::new();
        for (name, addrs) in self.channels {
            let mut parsed = Vec::with_capacity(addrs.len());
            for addr in addrs {
                parsed.push(
                    addr.parse::<ZmqAddress>()
                        .map_err(|err| Error::invalid(err.to_string()))?,
                );
            }
            map.insert(name, parsed);
        }
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_info_roundtrip() {
        let peer = PeerDescriptor::new(Uuid::new_v4());
        let frame = encode(&PeerInfo::from(&peer));
        let decoded: PeerInfo = decode(&frame).unwrap();
        assert_eq!(PeerDescriptor::from(decoded), peer);
    }

    #[test]
    fn test_open_dataframe_roundtrip() {
        let mut open = OpenDataframe {
            data_pipe: "pipe-1".to_string(),
            pipe_socket: 2,
            data_format: "text/plain".to_string(),
            parameters: HashMap::new(),
        };
        open.parameters.insert("key".to_string(), "value".to_string());
        let frame = encode(&open);
        let decoded: OpenDataframe = decode(&frame).unwrap();
        assert_eq!(decoded, open);
    }

    #[test]
    fn test_decode_garbage_fails() {
        let result: Result<OpenDataframe> = decode(b"\xff\xff\xff");
        assert!(result.is_err());
    }

    #[test]
    fn test_error_chain_descriptions() {
        let err = Error::stop(3, "pipe trouble");
        let descs = ErrorDescription::from_error_chain(&err);
        assert_eq!(descs.len(), 1);
        assert_eq!(descs[0].code, Some(3));
        assert_eq!(descs[0].description, "pipe trouble");
        assert!(descs[0].annotation.is_empty());
    }

    #[test]
    fn test_unexpected_error_annotated() {
        let err = Error::service("boom");
        let descs = ErrorDescription::from_error_chain(&err);
        assert!(descs[0].annotation.contains_key("error"));
    }

    #[test]
    fn test_zmq_error_has_chain() {
        let err = Error::from(zmq::Error::EHOSTUNREACH);
        let descs = ErrorDescription::from_error_chain(&err);
        assert_eq!(descs.len(), 2);
    }

    #[test]
    fn test_endpoints_frame_roundtrip() {
        let mut map = EndpointMap::new();
        map.insert(
            "service".to_string(),
            vec!["tcp://127.0.0.1:5555".parse().unwrap()],
        );
        let frame = EndpointsFrame::from_map(&map);
        let decoded = decode::<EndpointsFrame>(&encode(&frame)).unwrap().into_map().unwrap();
        assert_eq!(decoded, map);
    }
}
