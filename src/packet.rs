//! Structured in-memory model of a client message.
//!
//! Wire-format encoding and decoding live outside this core: the transport
//! layer parses UDP payloads into [`ClientMessage`] values and serializes
//! [`Reply`](crate::reply::Reply) values back out. This module only defines
//! the fields the allocation engine needs to classify a message and identify
//! its sender.
//!
//! # References
//!
//! - RFC 2131: Dynamic Host Configuration Protocol
//! - RFC 3046: DHCP Relay Agent Information Option (Option 82)
//! - RFC 4361: Node-specific Client Identifiers (DUID in DHCPv4)

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

/// Maximum accepted hostname length after sanitization.
const MAX_HOSTNAME_LENGTH: usize = 63;

/// Inbound message types the allocation engine processes.
///
/// Server-to-client types (OFFER, ACK, NAK) are produced by the
/// [`reply`](crate::reply) boundary and never appear on the inbound path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Client broadcast to locate servers and solicit an address.
    Discover,
    /// Client request to commit, confirm, or extend an address.
    Request,
    /// Client returns its address to the pool.
    Release,
    /// Client reports the offered address is already in use.
    Decline,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Discover => write!(f, "DISCOVER"),
            Self::Request => write!(f, "REQUEST"),
            Self::Release => write!(f, "RELEASE"),
            Self::Decline => write!(f, "DECLINE"),
        }
    }
}

/// A link-layer hardware address with its ARP hardware type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HwAddr {
    /// ARP hardware type (1 = Ethernet).
    pub htype: u8,
    /// Address bytes; 6 for Ethernet.
    pub bytes: Vec<u8>,
}

impl HwAddr {
    /// Creates an Ethernet hardware address.
    pub fn ethernet(mac: [u8; 6]) -> Self {
        Self {
            htype: 1,
            bytes: mac.to_vec(),
        }
    }

    /// Formats the address as colon-separated hex for logging.
    pub fn to_hex(&self) -> String {
        hex_id(&self.bytes)
    }
}

/// DUID type codes per RFC 8415 §11.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuidKind {
    /// Link-layer address plus time.
    Llt,
    /// Vendor-assigned, based on enterprise number.
    En,
    /// Link-layer address.
    Ll,
    /// Unrecognized type code, carried opaquely.
    Other(u16),
}

/// A DHCP Unique Identifier.
///
/// The `bytes` field holds the complete DUID including the two type-code
/// octets; reservation matching compares the full byte string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Duid {
    pub kind: DuidKind,
    pub bytes: Vec<u8>,
}

impl Duid {
    /// Classifies a raw DUID byte string by its leading type code.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let kind = match bytes.first().map(|b| u16::from(*b) << 8).zip(bytes.get(1)) {
            Some((high, low)) => match high | u16::from(*low) {
                1 => DuidKind::Llt,
                2 => DuidKind::En,
                3 => DuidKind::Ll,
                other => DuidKind::Other(other),
            },
            None => DuidKind::Other(0),
        };
        Self { kind, bytes }
    }
}

/// The client-identifier option, either an opaque byte string or a
/// structured DUID (RFC 4361 form).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientId {
    Raw(Vec<u8>),
    Duid(Duid),
}

impl ClientId {
    /// The raw bytes used for lease binding and reservation matching.
    pub fn bytes(&self) -> &[u8] {
        match self {
            Self::Raw(bytes) => bytes,
            Self::Duid(duid) => &duid.bytes,
        }
    }

    /// The DUID payload, if this identifier carries one.
    pub fn duid(&self) -> Option<&Duid> {
        match self {
            Self::Duid(duid) => Some(duid),
            Self::Raw(_) => None,
        }
    }
}

/// Relay agent information (Option 82 sub-options) inserted by a relay.
///
/// Persisted with the lease when the owning subnet stashes agent options,
/// so derives serde for the extended-info blob.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayAgentInfo {
    /// Circuit identifier (sub-option 1).
    pub circuit_id: Option<Vec<u8>>,
    /// Remote identifier (sub-option 2).
    pub remote_id: Option<Vec<u8>>,
}

impl RelayAgentInfo {
    /// Builds relay info carrying only a circuit id.
    pub fn with_circuit_id(circuit_id: Vec<u8>) -> Self {
        Self {
            circuit_id: Some(circuit_id),
            remote_id: None,
        }
    }
}

/// A parsed, structured client message.
///
/// Produced by the out-of-scope wire codec; consumed by
/// [`AllocationEngine::process`](crate::engine::AllocationEngine::process).
#[derive(Debug, Clone)]
pub struct ClientMessage {
    /// Which protocol message this is.
    pub kind: MessageKind,

    /// Transaction id chosen by the client, echoed in replies.
    pub xid: u32,

    /// Link-layer hardware address from the chaddr field.
    pub hw_addr: Option<HwAddr>,

    /// Client-identifier option (Option 61), raw or DUID-structured.
    pub client_id: Option<ClientId>,

    /// Flexible identifier computed by the (external) classification layer.
    pub flex_id: Option<Vec<u8>>,

    /// Requested-address option (Option 50).
    pub requested_addr: Option<Ipv4Addr>,

    /// Client's current address field; non-zero only when the client
    /// believes it holds a binding (renew/rebind, release).
    pub ciaddr: Ipv4Addr,

    /// Relay gateway address; non-zero when the message was relayed.
    pub giaddr: Ipv4Addr,

    /// Server-identifier option (Option 54).
    pub server_id: Option<Ipv4Addr>,

    /// Relay agent information, present on relayed messages.
    pub relay_info: Option<RelayAgentInfo>,

    /// Client-supplied hostname (Option 12), unsanitized.
    pub hostname: Option<String>,

    /// Client-suggested lease duration in seconds (Option 51).
    pub requested_lease_time: Option<u32>,
}

impl ClientMessage {
    /// Creates a message with the given type and transaction id; all
    /// optional fields start empty and ciaddr/giaddr zeroed.
    pub fn new(kind: MessageKind, xid: u32) -> Self {
        Self {
            kind,
            xid,
            hw_addr: None,
            client_id: None,
            flex_id: None,
            requested_addr: None,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            server_id: None,
            relay_info: None,
            hostname: None,
            requested_lease_time: None,
        }
    }

    /// Hardware address bytes, if the message carries any.
    pub fn hw_bytes(&self) -> Option<&[u8]> {
        self.hw_addr.as_ref().map(|hw| hw.bytes.as_slice())
    }

    /// Client-identifier bytes, if the option was present.
    pub fn client_id_bytes(&self) -> Option<&[u8]> {
        self.client_id.as_ref().map(|id| id.bytes())
    }

    /// Circuit id from relay agent information, if present.
    pub fn circuit_id(&self) -> Option<&[u8]> {
        self.relay_info
            .as_ref()
            .and_then(|info| info.circuit_id.as_deref())
    }

    /// True when the message arrived through a relay agent.
    pub fn is_relayed(&self) -> bool {
        self.giaddr != Ipv4Addr::UNSPECIFIED
    }

    /// Sanitized hostname suitable for lease storage and DDNS.
    pub fn sanitized_hostname(&self) -> Option<String> {
        self.hostname.as_deref().map(sanitize_hostname)
    }
}

/// Encodes an identifier as a colon-separated hex string for logging.
pub fn hex_id(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|byte| format!("{:02x}", byte))
        .collect::<Vec<_>>()
        .join(":")
}

/// Strips a client-supplied hostname down to safe DNS label characters.
///
/// Keeps alphanumerics, hyphens, and dots; truncates to 63 characters.
pub fn sanitize_hostname(hostname: &str) -> String {
    hostname
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '.')
        .take(MAX_HOSTNAME_LENGTH)
        .collect()
}
