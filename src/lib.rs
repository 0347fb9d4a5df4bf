//! # dhcpallot
//!
//! The lease-allocation core of a DHCP server: the state machine that takes
//! parsed client messages (DISCOVER, REQUEST, RELEASE, DECLINE), decides
//! which address to offer or confirm under reservation and pool policy, and
//! produces structured reply decisions (OFFER/ACK/NAK or deliberate
//! silence) per RFC 2131 semantics.
//!
//! ## Features
//!
//! - Full DORA decision table: reservations first, address stability next,
//!   requested addresses when free, dynamic pools last
//! - Host reservations with configurable identifier precedence
//!   (hw-address, DUID, circuit-id, client-id, flex-id)
//! - Iterative and random pool allocation strategies
//! - Claim-then-commit concurrency: atomic insert-if-absent claims with
//!   retry-on-conflict, safe across worker threads
//! - Authoritative NAK-vs-silence policy, per subnet and globally
//! - Lease caching (threshold/max-age reuse without a repository write)
//! - Relay agent option stashing for direct renewals
//! - Shared networks pooling sibling subnets' address space
//! - Pluggable lease repository, reservation backend, statistics sink,
//!   DDNS queue, and hook points
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::net::Ipv4Addr;
//! use std::sync::Arc;
//!
//! use dhcpallot::{
//!     AllocationEngine, ConfigHandle, ConfigSnapshot, GlobalPolicy,
//!     MemoryHostBackend, MemoryLeaseStore, Pool, RequestContext, Subnet,
//! };
//!
//! # async fn example() -> dhcpallot::Result<()> {
//! let subnet = Subnet {
//!     id: 1,
//!     prefix: Ipv4Addr::new(10, 0, 0, 0),
//!     prefix_len: 24,
//!     pools: vec![Pool::new(
//!         Ipv4Addr::new(10, 0, 0, 10),
//!         Ipv4Addr::new(10, 0, 0, 100),
//!     )],
//!     ..Subnet::default()
//! };
//! let config = Arc::new(ConfigHandle::new(ConfigSnapshot::new(
//!     vec![subnet],
//!     GlobalPolicy::default(),
//! )?));
//!
//! let engine = AllocationEngine::new(
//!     Ipv4Addr::new(10, 0, 0, 1),
//!     config,
//!     Arc::new(MemoryLeaseStore::new()),
//!     Arc::new(MemoryHostBackend::new(true)),
//! );
//!
//! # let message = todo!();
//! let result = engine
//!     .process(&message, &RequestContext::broadcast(Ipv4Addr::new(10, 0, 0, 1)))
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`ClientMessage`] - structured inbound message (wire codec external)
//! - [`ConfigSnapshot`] / [`ConfigHandle`] - immutable policy generations
//! - [`AllocationEngine`] - the state machine, with injected collaborators
//! - [`LeaseRepository`] / [`MemoryLeaseStore`] - lease storage boundary
//! - [`ReservationBackend`] / [`MemoryHostBackend`] - host reservations
//! - [`build_reply`] - allocation result to reply fields (ciaddr rules)

pub mod alloc;
pub mod config;
pub mod ddns;
pub mod engine;
pub mod error;
pub mod hooks;
pub mod ident;
pub mod lease;
pub mod packet;
pub mod reply;
pub mod reservation;
pub mod stats;

pub use alloc::{Allocator, PoolSet};
pub use config::{
    AllocatorKind, ConfigHandle, ConfigSnapshot, GlobalPolicy, Pool, Subnet, SubnetId,
};
pub use ddns::{ChannelDdnsQueue, DdnsQueue, NameChangeKind, NameChangeRequest, NullDdnsQueue};
pub use engine::{
    AllocationEngine, AllocationResult, BootInfo, ClientState, Outcome, ReasonCode,
    RequestContext,
};
pub use error::{Error, Result};
pub use hooks::{HookAction, HookContext, Hooks, NoopHooks};
pub use ident::{ClientIdentifier, IdentifierKind};
pub use lease::{Lease, LeaseRepository, LeaseState, MemoryLeaseStore};
pub use packet::{ClientId, ClientMessage, Duid, DuidKind, HwAddr, MessageKind, RelayAgentInfo};
pub use reply::{build_reply, Reply, ReplyKind};
pub use reservation::{MemoryHostBackend, Reservation, ReservationBackend, ReservationScope};
pub use stats::{NullStatsSink, StatsRegistry, StatsSink};
