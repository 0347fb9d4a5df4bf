//! Host reservations and their lookup.
//!
//! A reservation statically binds one or more client identifiers to an
//! address and/or fixed reply fields. The backend storing them is external
//! to this core and reached through [`ReservationBackend`]; a
//! configuration-fed in-memory implementation is bundled for composition
//! and tests.
//!
//! Reservations are re-read on every relevant lookup rather than cached
//! here, so edits made through the backend are visible to the next message.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::config::{Subnet, SubnetId};
use crate::error::{Error, Result};
use crate::ident::{ClientIdentifier, IdentifierKind};

/// Which scope a reservation lookup targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReservationScope {
    /// Reservations not tied to any subnet.
    Global,
    /// Reservations belonging to one subnet.
    Subnet(SubnetId),
}

/// A static binding of client identity to an address and reply fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    /// Keys this reservation can be found by. A lookup matches on any one
    /// of them; they are alternatives, not a conjunction.
    pub identifiers: Vec<ClientIdentifier>,

    /// Owning subnet, or `None` for a globally scoped reservation.
    pub subnet_id: Option<SubnetId>,

    /// Reserved address, if the reservation pins one.
    pub address: Option<Ipv4Addr>,

    /// Reserved hostname.
    pub hostname: Option<String>,

    /// Boot server address for the siaddr field.
    pub next_server: Option<Ipv4Addr>,

    /// Boot file name for the file field.
    pub boot_file_name: Option<String>,

    /// Server hostname for the sname field.
    pub server_hostname: Option<String>,

    /// Client classes granted by this reservation.
    pub client_classes: Vec<String>,
}

impl Reservation {
    /// Starts an address reservation in the given scope.
    pub fn for_address(subnet_id: Option<SubnetId>, address: Ipv4Addr) -> Self {
        Self {
            identifiers: Vec::new(),
            subnet_id,
            address: Some(address),
            hostname: None,
            next_server: None,
            boot_file_name: None,
            server_hostname: None,
            client_classes: Vec::new(),
        }
    }

    /// Adds a lookup key.
    pub fn with_identifier(mut self, kind: IdentifierKind, value: Vec<u8>) -> Self {
        self.identifiers.push(ClientIdentifier::new(kind, value));
        self
    }

    /// Adds a reserved hostname.
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// True if any key of this reservation equals the given identifier.
    pub fn matches(&self, kind: IdentifierKind, value: &[u8]) -> bool {
        self.identifiers
            .iter()
            .any(|id| id.kind == kind && id.value == value)
    }

    /// True if any key matches any identifier in the resolved list.
    pub fn matches_any(&self, identifiers: &[ClientIdentifier]) -> bool {
        identifiers.iter().any(|id| self.matches(id.kind, &id.value))
    }

    fn scope(&self) -> ReservationScope {
        match self.subnet_id {
            Some(id) => ReservationScope::Subnet(id),
            None => ReservationScope::Global,
        }
    }
}

/// Lookup interface over whatever stores reservations.
///
/// Implementations map I/O failures to [`Error::ReservationLookup`]; the
/// engine fails open on that variant.
#[async_trait]
pub trait ReservationBackend: Send + Sync {
    /// Finds a reservation by one identifier within one scope.
    async fn find(
        &self,
        kind: IdentifierKind,
        value: &[u8],
        scope: ReservationScope,
    ) -> Result<Option<Reservation>>;

    /// Finds the reservation pinning an address within one scope.
    async fn find_by_address(
        &self,
        scope: ReservationScope,
        addr: Ipv4Addr,
    ) -> Result<Option<Reservation>>;
}

#[derive(Debug, Default)]
struct HostInner {
    reservations: Vec<Arc<Reservation>>,
    by_key: HashMap<(IdentifierKind, Vec<u8>), Vec<usize>>,
    by_address: HashMap<(ReservationScope, Ipv4Addr), usize>,
}

/// In-memory reservation backend fed from configuration.
#[derive(Debug)]
pub struct MemoryHostBackend {
    inner: RwLock<HostInner>,
    unique_addresses: bool,
}

impl MemoryHostBackend {
    /// Creates an empty backend. With `unique_addresses` set, one address
    /// may appear in at most one reservation across all scopes; otherwise
    /// uniqueness is enforced per scope only.
    pub fn new(unique_addresses: bool) -> Self {
        Self {
            inner: RwLock::new(HostInner::default()),
            unique_addresses,
        }
    }

    /// Adds a reservation, rejecting address conflicts.
    pub async fn add(&self, reservation: Reservation) -> Result<()> {
        let mut inner = self.inner.write().await;

        if let Some(addr) = reservation.address {
            let scope = reservation.scope();
            let conflict = if self.unique_addresses {
                inner
                    .by_address
                    .keys()
                    .any(|(_, existing)| *existing == addr)
            } else {
                inner.by_address.contains_key(&(scope, addr))
            };
            if conflict {
                return Err(Error::InvalidConfig(format!(
                    "address {addr} is already reserved"
                )));
            }
        }

        let index = inner.reservations.len();
        let reservation = Arc::new(reservation);
        for id in &reservation.identifiers {
            inner
                .by_key
                .entry((id.kind, id.value.clone()))
                .or_default()
                .push(index);
        }
        if let Some(addr) = reservation.address {
            let scope = reservation.scope();
            inner.by_address.insert((scope, addr), index);
        }
        inner.reservations.push(reservation);
        Ok(())
    }

    /// Deletes the reservation pinning an address in a scope, if present.
    /// Returns true when something was removed.
    pub async fn remove_by_address(&self, scope: ReservationScope, addr: Ipv4Addr) -> bool {
        let mut inner = self.inner.write().await;
        let Some(index) = inner.by_address.remove(&(scope, addr)) else {
            return false;
        };
        let keys: Vec<_> = inner.reservations[index]
            .identifiers
            .iter()
            .map(|id| (id.kind, id.value.clone()))
            .collect();
        for key in keys {
            if let Some(indexes) = inner.by_key.get_mut(&key) {
                indexes.retain(|&slot| slot != index);
            }
        }
        // slot stays allocated so other indexes remain valid; it is simply
        // unreachable from the lookup maps now
        true
    }
}

#[async_trait]
impl ReservationBackend for MemoryHostBackend {
    async fn find(
        &self,
        kind: IdentifierKind,
        value: &[u8],
        scope: ReservationScope,
    ) -> Result<Option<Reservation>> {
        let inner = self.inner.read().await;
        let Some(indexes) = inner.by_key.get(&(kind, value.to_vec())) else {
            return Ok(None);
        };
        Ok(indexes
            .iter()
            .map(|&index| &inner.reservations[index])
            .find(|reservation| reservation.scope() == scope)
            .map(|reservation| reservation.as_ref().clone()))
    }

    async fn find_by_address(
        &self,
        scope: ReservationScope,
        addr: Ipv4Addr,
    ) -> Result<Option<Reservation>> {
        let inner = self.inner.read().await;
        Ok(inner
            .by_address
            .get(&(scope, addr))
            .map(|&index| inner.reservations[index].as_ref().clone()))
    }
}

/// Resolves the reservation for a client on a subnet.
///
/// Walks the ordered identifier list; for each identifier the global scope
/// is consulted first (when enabled), then the subnet scope (when enabled).
/// The first hit wins outright; partial matches across identifier kinds are
/// never merged. Backend errors propagate for the engine's fail-open
/// handling.
pub async fn find_for_client(
    backend: &dyn ReservationBackend,
    identifiers: &[ClientIdentifier],
    subnet: &Subnet,
) -> Result<Option<Reservation>> {
    for id in identifiers {
        if subnet.reservations_global
            && let Some(found) = backend
                .find(id.kind, &id.value, ReservationScope::Global)
                .await?
        {
            return Ok(Some(found));
        }
        if subnet.reservations_in_subnet
            && let Some(found) = backend
                .find(id.kind, &id.value, ReservationScope::Subnet(subnet.id))
                .await?
        {
            return Ok(Some(found));
        }
    }
    Ok(None)
}
