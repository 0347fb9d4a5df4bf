//! Client identifier resolution.
//!
//! A client can be recognized by several kinds of key: its hardware address,
//! a DUID, an opaque client identifier, a relay-inserted circuit id, or a
//! flexible id computed by the classification layer. Which kinds apply, and
//! in what order, is subnet configuration; this module turns a message plus
//! that ordering into the ordered identifier list the reservation resolver
//! consumes.
//!
//! Resolution is a pure function: identifier kinds absent from the message
//! are skipped, and an empty result is valid (the engine still locates
//! leases through the link-layer hardware address in that case).

use serde::{Deserialize, Serialize};

use crate::packet::ClientMessage;

/// The kinds of key a host reservation or lease can be bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IdentifierKind {
    /// Link-layer hardware address.
    HwAddress,
    /// DHCP Unique Identifier, from a structured client-identifier option.
    Duid,
    /// Relay agent circuit id (Option 82 sub-option 1).
    CircuitId,
    /// Client-identifier option bytes, whatever their structure.
    ClientId,
    /// Externally computed flexible identifier.
    FlexId,
}

impl std::fmt::Display for IdentifierKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HwAddress => write!(f, "hw-address"),
            Self::Duid => write!(f, "duid"),
            Self::CircuitId => write!(f, "circuit-id"),
            Self::ClientId => write!(f, "client-id"),
            Self::FlexId => write!(f, "flex-id"),
        }
    }
}

/// One resolved identification key for a client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientIdentifier {
    pub kind: IdentifierKind,
    pub value: Vec<u8>,
}

impl ClientIdentifier {
    pub fn new(kind: IdentifierKind, value: Vec<u8>) -> Self {
        Self { kind, value }
    }
}

/// Default precedence used when a subnet does not configure its own.
pub const DEFAULT_IDENTIFIER_ORDER: [IdentifierKind; 5] = [
    IdentifierKind::HwAddress,
    IdentifierKind::Duid,
    IdentifierKind::CircuitId,
    IdentifierKind::ClientId,
    IdentifierKind::FlexId,
];

/// Extracts the identifier of the given kind from a message, if present.
fn extract(msg: &ClientMessage, kind: IdentifierKind) -> Option<Vec<u8>> {
    match kind {
        IdentifierKind::HwAddress => msg.hw_bytes().map(<[u8]>::to_vec),
        IdentifierKind::Duid => msg
            .client_id
            .as_ref()
            .and_then(|id| id.duid())
            .map(|duid| duid.bytes.clone()),
        IdentifierKind::CircuitId => msg.circuit_id().map(<[u8]>::to_vec),
        IdentifierKind::ClientId => msg.client_id_bytes().map(<[u8]>::to_vec),
        IdentifierKind::FlexId => msg.flex_id.clone(),
    }
}

/// Resolves the ordered identifier list for a message.
///
/// The order of `precedence` is authoritative: the reservation resolver
/// tries identifiers strictly in the returned order. Kinds the message does
/// not carry are omitted; empty values are treated as absent.
pub fn resolve(msg: &ClientMessage, precedence: &[IdentifierKind]) -> Vec<ClientIdentifier> {
    precedence
        .iter()
        .filter_map(|&kind| {
            extract(msg, kind)
                .filter(|value| !value.is_empty())
                .map(|value| ClientIdentifier::new(kind, value))
        })
        .collect()
}

/// Rejects duplicate or empty identifier orderings at snapshot-build time.
pub fn validate_order(precedence: &[IdentifierKind]) -> Result<(), String> {
    if precedence.is_empty() {
        return Err("host-reservation-identifiers must not be empty".to_string());
    }
    let mut seen = std::collections::HashSet::new();
    for kind in precedence {
        if !seen.insert(*kind) {
            return Err(format!("duplicate identifier type {kind}"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{ClientId, Duid, HwAddr, MessageKind, RelayAgentInfo};

    fn message_with_everything() -> ClientMessage {
        let mut msg = ClientMessage::new(MessageKind::Discover, 1);
        msg.hw_addr = Some(HwAddr::ethernet([1, 2, 3, 4, 5, 6]));
        msg.client_id = Some(ClientId::Duid(Duid::from_bytes(vec![0, 1, 0xaa])));
        msg.relay_info = Some(RelayAgentInfo::with_circuit_id(vec![9, 9]));
        msg.flex_id = Some(vec![0xfe]);
        msg
    }

    #[test]
    fn test_resolve_follows_configured_order() {
        let msg = message_with_everything();
        let order = [
            IdentifierKind::CircuitId,
            IdentifierKind::HwAddress,
            IdentifierKind::FlexId,
        ];

        let resolved = resolve(&msg, &order);
        let kinds: Vec<_> = resolved.iter().map(|id| id.kind).collect();
        assert_eq!(
            kinds,
            vec![
                IdentifierKind::CircuitId,
                IdentifierKind::HwAddress,
                IdentifierKind::FlexId
            ]
        );
        assert_eq!(resolved[0].value, vec![9, 9]);
    }

    #[test]
    fn test_resolve_skips_absent_kinds() {
        let mut msg = ClientMessage::new(MessageKind::Discover, 1);
        msg.hw_addr = Some(HwAddr::ethernet([1, 2, 3, 4, 5, 6]));

        let resolved = resolve(&msg, &DEFAULT_IDENTIFIER_ORDER);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].kind, IdentifierKind::HwAddress);
    }

    #[test]
    fn test_resolve_empty_when_nothing_present() {
        let msg = ClientMessage::new(MessageKind::Discover, 1);
        assert!(resolve(&msg, &DEFAULT_IDENTIFIER_ORDER).is_empty());
    }

    #[test]
    fn test_duid_and_client_id_both_resolve_from_option() {
        let msg = message_with_everything();
        let resolved = resolve(&msg, &[IdentifierKind::Duid, IdentifierKind::ClientId]);
        assert_eq!(resolved.len(), 2);
        // same option bytes under both kinds
        assert_eq!(resolved[0].value, resolved[1].value);
    }

    #[test]
    fn test_raw_client_id_is_not_a_duid() {
        let mut msg = ClientMessage::new(MessageKind::Discover, 1);
        msg.client_id = Some(ClientId::Raw(vec![1, 2, 3]));

        let resolved = resolve(&msg, &[IdentifierKind::Duid, IdentifierKind::ClientId]);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].kind, IdentifierKind::ClientId);
    }

    #[test]
    fn test_validate_order() {
        assert!(validate_order(&DEFAULT_IDENTIFIER_ORDER).is_ok());
        assert!(validate_order(&[]).is_err());
        assert!(
            validate_order(&[IdentifierKind::HwAddress, IdentifierKind::HwAddress]).is_err()
        );
    }
}
