//! Immutable configuration snapshots.
//!
//! The allocation core never parses configuration itself; it receives a
//! resolved object tree of subnets, pools, and policy flags, validated and
//! frozen into a [`ConfigSnapshot`]. Reconfiguration publishes a whole new
//! snapshot through [`ConfigHandle`]; in-flight message processing keeps the
//! `Arc` it started with, so a swap never tears the view a worker sees.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::alloc::Allocator;
use crate::error::{Error, Result};
use crate::ident::{self, IdentifierKind, DEFAULT_IDENTIFIER_ORDER};

/// Unique numeric subnet identifier, stable across snapshots.
pub type SubnetId = u32;

/// A contiguous range of addresses available for dynamic allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool {
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
}

impl Pool {
    pub fn new(start: Ipv4Addr, end: Ipv4Addr) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let addr = u32::from(addr);
        addr >= u32::from(self.start) && addr <= u32::from(self.end)
    }

    pub fn size(&self) -> u64 {
        u64::from(u32::from(self.end)) - u64::from(u32::from(self.start)) + 1
    }
}

/// Which candidate-selection strategy a subnet's allocator uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AllocatorKind {
    Iterative,
    Random,
}

/// One subnet's address space and allocation policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Subnet {
    /// Unique id referenced by leases and reservations.
    pub id: SubnetId,

    /// Network prefix address.
    pub prefix: Ipv4Addr,

    /// Prefix length in bits.
    pub prefix_len: u8,

    /// Dynamic pools, in allocation order.
    pub pools: Vec<Pool>,

    /// NAK rather than stay silent when a client's binding cannot be
    /// confirmed on this subnet.
    pub authoritative: bool,

    /// Include the client-identifier option in lease identity. When false,
    /// the hardware address alone is the lookup key and client-id drift is
    /// ignored.
    pub match_client_id: bool,

    /// Consult globally scoped reservations for clients on this subnet.
    pub reservations_global: bool,

    /// Consult subnet-scoped reservations.
    pub reservations_in_subnet: bool,

    /// Only honor reservations whose address lies outside the dynamic
    /// pools; an in-pool reservation is ignored for allocation.
    pub reservations_out_of_pool: bool,

    /// Ordered identifier kinds used for reservation lookup.
    pub host_reservation_identifiers: Vec<IdentifierKind>,

    /// Candidate-selection strategy for the dynamic pools.
    pub allocator: AllocatorKind,

    /// Reuse an unexpired lease without a repository write while its age is
    /// below this fraction of the valid lifetime.
    pub cache_threshold: Option<f64>,

    /// Reuse an unexpired lease without a repository write while its age is
    /// below this many seconds.
    pub cache_max_age: Option<u32>,

    /// Persist relay agent options with the lease and replay them on a
    /// direct (non-relayed) renewal.
    pub stash_agent_options: bool,

    /// Full lease duration granted on commit, in seconds.
    pub valid_lifetime: u32,

    /// Lower clamp for client-suggested lease durations.
    pub min_valid_lifetime: u32,

    /// Duration of the tentative claim backing an OFFER, in seconds.
    pub offer_lifetime: u32,

    /// Name of the shared network pooling this subnet's address space with
    /// its siblings, if any.
    pub shared_network: Option<String>,
}

impl Default for Subnet {
    fn default() -> Self {
        Self {
            id: 1,
            prefix: Ipv4Addr::new(192, 168, 1, 0),
            prefix_len: 24,
            pools: Vec::new(),
            authoritative: false,
            match_client_id: true,
            reservations_global: false,
            reservations_in_subnet: true,
            reservations_out_of_pool: false,
            host_reservation_identifiers: DEFAULT_IDENTIFIER_ORDER.to_vec(),
            allocator: AllocatorKind::Iterative,
            cache_threshold: None,
            cache_max_age: None,
            stash_agent_options: false,
            valid_lifetime: 86400,
            min_valid_lifetime: 60,
            offer_lifetime: 60,
            shared_network: None,
        }
    }
}

impl Subnet {
    fn netmask(&self) -> u32 {
        if self.prefix_len == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(self.prefix_len))
        }
    }

    /// True if the address falls inside this subnet's prefix.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let mask = self.netmask();
        u32::from(addr) & mask == u32::from(self.prefix) & mask
    }

    /// True if the address falls inside any dynamic pool.
    pub fn in_pool(&self, addr: Ipv4Addr) -> bool {
        self.pools.iter().any(|pool| pool.contains(addr))
    }

    /// Clamps a client-suggested lease duration into configured bounds.
    pub fn negotiate_lifetime(&self, requested: Option<u32>) -> u32 {
        match requested {
            Some(seconds) => seconds.clamp(self.min_valid_lifetime, self.valid_lifetime),
            None => self.valid_lifetime,
        }
    }

    /// Whether any reservation scope is enabled at all; when false the
    /// engine skips reservation lookups entirely.
    pub fn reservations_enabled(&self) -> bool {
        self.reservations_global || self.reservations_in_subnet
    }

    fn validate(&self) -> Result<()> {
        if self.prefix_len > 32 {
            return Err(Error::InvalidConfig(format!(
                "subnet {}: prefix length {} exceeds 32",
                self.id, self.prefix_len
            )));
        }
        if self.valid_lifetime == 0 {
            return Err(Error::InvalidConfig(format!(
                "subnet {}: valid-lifetime must be greater than 0",
                self.id
            )));
        }
        if self.min_valid_lifetime > self.valid_lifetime {
            return Err(Error::InvalidConfig(format!(
                "subnet {}: min-valid-lifetime exceeds valid-lifetime",
                self.id
            )));
        }
        if self.offer_lifetime == 0 {
            return Err(Error::InvalidConfig(format!(
                "subnet {}: offer-lifetime must be greater than 0",
                self.id
            )));
        }
        if let Some(threshold) = self.cache_threshold
            && !(threshold > 0.0 && threshold <= 1.0)
        {
            return Err(Error::InvalidConfig(format!(
                "subnet {}: cache-threshold must be within (0, 1]",
                self.id
            )));
        }
        ident::validate_order(&self.host_reservation_identifiers)
            .map_err(|msg| Error::InvalidConfig(format!("subnet {}: {}", self.id, msg)))?;

        for pool in &self.pools {
            if u32::from(pool.start) > u32::from(pool.end) {
                return Err(Error::InvalidConfig(format!(
                    "subnet {}: pool start {} is after end {}",
                    self.id, pool.start, pool.end
                )));
            }
            if !self.contains(pool.start) || !self.contains(pool.end) {
                return Err(Error::InvalidConfig(format!(
                    "subnet {}: pool {}-{} is outside {}/{}",
                    self.id, pool.start, pool.end, self.prefix, self.prefix_len
                )));
            }
        }
        for (index, pool) in self.pools.iter().enumerate() {
            for other in &self.pools[index + 1..] {
                if pool.contains(other.start) || other.contains(pool.start) {
                    return Err(Error::InvalidConfig(format!(
                        "subnet {}: pools {}-{} and {}-{} overlap",
                        self.id, pool.start, pool.end, other.start, other.end
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Snapshot-wide policy knobs that are not per-subnet.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalPolicy {
    /// Authority consulted when no subnet matched a REQUEST-class message
    /// (the per-subnet flag is unreachable then): true NAKs, false drops.
    pub authoritative: bool,

    /// Reject reservation sets binding one address to several identities.
    pub ip_reservations_unique: bool,
}

impl Default for GlobalPolicy {
    fn default() -> Self {
        Self {
            authoritative: false,
            ip_reservations_unique: true,
        }
    }
}

/// A validated, immutable view of all subnets plus their runtime allocator
/// state. Always handled through an `Arc`.
#[derive(Debug)]
pub struct ConfigSnapshot {
    subnets: Vec<Arc<Subnet>>,
    allocators: HashMap<SubnetId, Arc<Allocator>>,
    by_id: HashMap<SubnetId, usize>,
    pub policy: GlobalPolicy,
}

impl ConfigSnapshot {
    /// Validates the subnet list and freezes it, building one allocator per
    /// subnet. Allocator cursors start fresh on every snapshot.
    pub fn new(subnets: Vec<Subnet>, policy: GlobalPolicy) -> Result<Self> {
        let mut by_id = HashMap::new();
        let mut allocators = HashMap::new();

        for (index, subnet) in subnets.iter().enumerate() {
            subnet.validate()?;
            if by_id.insert(subnet.id, index).is_some() {
                return Err(Error::InvalidConfig(format!(
                    "duplicate subnet id {}",
                    subnet.id
                )));
            }
            allocators.insert(
                subnet.id,
                Arc::new(Allocator::new(subnet.allocator, subnet.pools.clone())),
            );
        }

        Ok(Self {
            subnets: subnets.into_iter().map(Arc::new).collect(),
            allocators,
            by_id,
            policy,
        })
    }

    /// Looks a subnet up by id.
    pub fn subnet(&self, id: SubnetId) -> Option<&Arc<Subnet>> {
        self.by_id.get(&id).map(|&index| &self.subnets[index])
    }

    /// All subnets in declaration order.
    pub fn subnets(&self) -> &[Arc<Subnet>] {
        &self.subnets
    }

    /// The shared allocator for a subnet.
    pub fn allocator(&self, id: SubnetId) -> Option<&Arc<Allocator>> {
        self.allocators.get(&id)
    }

    /// Selects the subnet a message belongs to.
    ///
    /// A relayed message selects by the relay's gateway address; a direct
    /// one by the address of the receiving interface.
    pub fn select_subnet(&self, giaddr: Ipv4Addr, local_addr: Ipv4Addr) -> Option<&Arc<Subnet>> {
        let anchor = if giaddr != Ipv4Addr::UNSPECIFIED {
            giaddr
        } else {
            local_addr
        };
        self.subnets.iter().find(|subnet| subnet.contains(anchor))
    }

    /// Subnets eligible for allocation for a client landing on `subnet`:
    /// the subnet itself, then its shared-network siblings in declaration
    /// order. A subnet outside any shared network stands alone.
    pub fn allocation_subnets(&self, subnet: &Arc<Subnet>) -> Vec<Arc<Subnet>> {
        let Some(network) = subnet.shared_network.as_deref() else {
            return vec![Arc::clone(subnet)];
        };
        let mut members = vec![Arc::clone(subnet)];
        members.extend(
            self.subnets
                .iter()
                .filter(|other| {
                    other.id != subnet.id && other.shared_network.as_deref() == Some(network)
                })
                .cloned(),
        );
        members
    }

    /// Finds which allocation subnet's pools contain an address, if any.
    pub fn pool_subnet_for(
        &self,
        subnet: &Arc<Subnet>,
        addr: Ipv4Addr,
    ) -> Option<Arc<Subnet>> {
        self.allocation_subnets(subnet)
            .into_iter()
            .find(|member| member.in_pool(addr))
    }
}

/// Publication point for configuration snapshots.
///
/// Readers take a cheap `Arc` clone per message and keep it for the whole
/// pipeline; [`publish`](Self::publish) swaps the pointer atomically for
/// subsequent messages.
#[derive(Debug)]
pub struct ConfigHandle {
    current: RwLock<Arc<ConfigSnapshot>>,
}

impl ConfigHandle {
    pub fn new(snapshot: ConfigSnapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(snapshot)),
        }
    }

    /// The snapshot new messages should process against.
    pub fn current(&self) -> Arc<ConfigSnapshot> {
        Arc::clone(&self.current.read().expect("config lock poisoned"))
    }

    /// Replaces the active snapshot. In-flight messages finish on the
    /// generation they started with.
    pub fn publish(&self, snapshot: ConfigSnapshot) {
        *self.current.write().expect("config lock poisoned") = Arc::new(snapshot);
    }
}
