//! DNS update dispatch.
//!
//! The engine produces [`NameChangeRequest`]s as a side effect of lease
//! commits and removals; whatever performs the actual DNS updates consumes
//! them from the other end of the queue. The queue is fire-and-forget and
//! bounded: a full queue drops the request (the DDNS component owns that
//! policy, not the allocation core).

use std::net::Ipv4Addr;

use tokio::sync::mpsc;
use tracing::warn;

/// Whether a name mapping should be added or removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameChangeKind {
    Add,
    Remove,
}

/// One requested forward/reverse DNS change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameChangeRequest {
    pub kind: NameChangeKind,
    pub hostname: String,
    pub address: Ipv4Addr,
}

impl NameChangeRequest {
    pub fn add(hostname: String, address: Ipv4Addr) -> Self {
        Self {
            kind: NameChangeKind::Add,
            hostname,
            address,
        }
    }

    pub fn remove(hostname: String, address: Ipv4Addr) -> Self {
        Self {
            kind: NameChangeKind::Remove,
            hostname,
            address,
        }
    }
}

/// Producer side of the DDNS pipeline.
pub trait DdnsQueue: Send + Sync {
    /// Hands a request to the DDNS component. Never blocks and never fails
    /// from the engine's perspective.
    fn enqueue(&self, request: NameChangeRequest);
}

/// Queue backed by a bounded tokio channel.
#[derive(Debug)]
pub struct ChannelDdnsQueue {
    tx: mpsc::Sender<NameChangeRequest>,
}

impl ChannelDdnsQueue {
    /// Creates the queue and the receiver the DDNS worker drains.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<NameChangeRequest>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl DdnsQueue for ChannelDdnsQueue {
    fn enqueue(&self, request: NameChangeRequest) {
        if let Err(err) = self.tx.try_send(request) {
            warn!("DDNS queue full, dropping name change: {}", err);
        }
    }
}

/// Queue that discards every request; for deployments without DDNS.
#[derive(Debug, Default)]
pub struct NullDdnsQueue;

impl DdnsQueue for NullDdnsQueue {
    fn enqueue(&self, _request: NameChangeRequest) {}
}
