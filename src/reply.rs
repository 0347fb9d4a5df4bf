//! Reply-builder boundary.
//!
//! Turns an [`AllocationResult`] into the fields of a protocol reply; the
//! out-of-scope wire codec serializes the rest. The ciaddr rules live here
//! and nowhere else:
//!
//! - OFFER never echoes ciaddr (always zero),
//! - ACK echoes the ciaddr from the client's request verbatim, even when it
//!   is logically redundant,
//! - NAK zeroes ciaddr and yiaddr regardless of what the client sent.
//!
//! `NoReply` outcomes build nothing; silence is the reply.

use std::net::Ipv4Addr;

use crate::engine::{AllocationResult, Outcome};
use crate::packet::{ClientMessage, MessageKind};

/// Protocol reply types this server emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    Offer,
    Ack,
    Nak,
}

impl std::fmt::Display for ReplyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Offer => write!(f, "OFFER"),
            Self::Ack => write!(f, "ACK"),
            Self::Nak => write!(f, "NAK"),
        }
    }
}

/// Structured reply fields for the wire codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub kind: ReplyKind,
    /// Transaction id echoed from the request.
    pub xid: u32,
    /// Address being offered or confirmed; zero on NAK.
    pub yiaddr: Ipv4Addr,
    /// Client address field, per the ciaddr rules above.
    pub ciaddr: Ipv4Addr,
    /// Relay gateway echoed from the request.
    pub giaddr: Ipv4Addr,
    /// Boot server address (siaddr), when a reservation pins one.
    pub siaddr: Ipv4Addr,
    /// This server's identifier.
    pub server_id: Ipv4Addr,
    /// Hardware address echoed from the request.
    pub chaddr: Option<Vec<u8>>,
    /// Granted lease duration; absent on NAK.
    pub lease_time: Option<u32>,
    /// Boot file name from a reservation.
    pub boot_file_name: Option<String>,
    /// Server hostname from a reservation.
    pub server_hostname: Option<String>,
    /// Hostname to hand back to the client.
    pub hostname: Option<String>,
}

/// Builds the reply for an allocation result, or `None` when the decision
/// was to stay silent.
pub fn build_reply(
    request: &ClientMessage,
    result: &AllocationResult,
    server_id: Ipv4Addr,
) -> Option<Reply> {
    let kind = match result.outcome {
        Outcome::Allocated | Outcome::Renewed | Outcome::ReusedCached => {
            if request.kind == MessageKind::Discover {
                ReplyKind::Offer
            } else {
                ReplyKind::Ack
            }
        }
        Outcome::Nak => ReplyKind::Nak,
        Outcome::NoReply => return None,
    };

    let chaddr = request.hw_bytes().map(<[u8]>::to_vec);
    let boot = result.boot.as_ref();

    let reply = match kind {
        ReplyKind::Nak => Reply {
            kind,
            xid: request.xid,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: request.giaddr,
            siaddr: Ipv4Addr::UNSPECIFIED,
            server_id,
            chaddr,
            lease_time: None,
            boot_file_name: None,
            server_hostname: None,
            hostname: None,
        },
        ReplyKind::Offer | ReplyKind::Ack => {
            let lease = result
                .lease
                .as_ref()
                .expect("granted outcome always carries a lease");
            Reply {
                kind,
                xid: request.xid,
                yiaddr: lease.address,
                ciaddr: if kind == ReplyKind::Ack {
                    request.ciaddr
                } else {
                    Ipv4Addr::UNSPECIFIED
                },
                giaddr: request.giaddr,
                siaddr: boot
                    .and_then(|info| info.next_server)
                    .unwrap_or(Ipv4Addr::UNSPECIFIED),
                server_id,
                chaddr,
                lease_time: Some(lease.valid_lifetime),
                boot_file_name: boot.and_then(|info| info.boot_file_name.clone()),
                server_hostname: boot.and_then(|info| info.server_hostname.clone()),
                hostname: boot
                    .and_then(|info| info.hostname.clone())
                    .or_else(|| lease.hostname.clone()),
            }
        }
    };
    Some(reply)
}
