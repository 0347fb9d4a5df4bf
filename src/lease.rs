//! Lease records and the repository interface.
//!
//! A [`Lease`] is the one mutable, persisted artifact of the allocation
//! core. Storage backends live outside this crate and are reached through
//! [`LeaseRepository`]; the bundled [`MemoryLeaseStore`] backs tests and
//! single-process deployments.
//!
//! # Concurrency contract
//!
//! The repository is the only cross-worker shared mutable state. Two
//! operations carry the burden:
//!
//! - [`try_claim`](LeaseRepository::try_claim) is an atomic
//!   insert-if-absent: at most one of several racing claims for an address
//!   succeeds, and the losers retry allocation with that address excluded.
//! - [`update`](LeaseRepository::update) is optimistic: it fails when the
//!   stored record's version no longer matches the one the caller read.
//!
//! Expired or absent leases are normal: an out-of-scope reclamation job may
//! delete or rewrite records at any time, and every caller tolerates that.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::config::SubnetId;
use crate::error::Result;
use crate::ident::IdentifierKind;
use crate::packet::RelayAgentInfo;

/// Key under which stashed relay options ride in the extended-info blob.
const RELAY_INFO_KEY: &str = "relay-agent-info";

/// Lifecycle state of a lease record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LeaseState {
    /// Ordinary assigned lease.
    Default,
    /// The client reported an address conflict; the address sits out a
    /// probation period before returning to the pool.
    Declined,
    /// The reclamation job has processed expiry; the address is free.
    ExpiredReclaimed,
}

/// A dynamic, time-bounded address assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    /// The assigned address.
    pub address: Ipv4Addr,

    /// Subnet the address was allocated from.
    pub subnet_id: SubnetId,

    /// Hardware address of the owning client.
    pub hw_address: Option<Vec<u8>>,

    /// Client-identifier bytes of the owning client.
    pub client_id: Option<Vec<u8>>,

    /// Sanitized client hostname.
    pub hostname: Option<String>,

    /// Lifecycle state.
    pub state: LeaseState,

    /// Granted lease duration in seconds.
    pub valid_lifetime: u32,

    /// When the lease stops being valid (UTC).
    pub expires_at: DateTime<Utc>,

    /// When this record was first created (UTC).
    pub created_at: DateTime<Utc>,

    /// When the client last obtained or extended the lease (UTC).
    pub last_seen: DateTime<Utc>,

    /// Optimistic-concurrency version, bumped on every committed update.
    #[serde(default)]
    pub version: u64,

    /// Free-form persisted context, e.g. stashed relay agent options.
    #[serde(default)]
    pub extended_info: Option<serde_json::Value>,
}

impl Lease {
    /// Creates a fresh lease starting now.
    pub fn new(address: Ipv4Addr, subnet_id: SubnetId, valid_lifetime: u32) -> Self {
        let now = Utc::now();
        Self {
            address,
            subnet_id,
            hw_address: None,
            client_id: None,
            hostname: None,
            state: LeaseState::Default,
            valid_lifetime,
            expires_at: now + TimeDelta::seconds(i64::from(valid_lifetime)),
            created_at: now,
            last_seen: now,
            version: 0,
            extended_info: None,
        }
    }

    /// Returns true if the lease's validity window has passed.
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Returns true for an ordinary, unexpired assignment.
    pub fn is_active(&self) -> bool {
        self.state == LeaseState::Default && !self.is_expired()
    }

    /// Returns true while this record keeps its address out of the pool:
    /// active assignments and declined addresses still in probation.
    pub fn precludes_allocation(&self) -> bool {
        match self.state {
            LeaseState::Default | LeaseState::Declined => !self.is_expired(),
            LeaseState::ExpiredReclaimed => false,
        }
    }

    /// Seconds remaining until expiry, or 0 if expired.
    pub fn remaining_seconds(&self) -> i64 {
        (self.expires_at - Utc::now()).num_seconds().max(0)
    }

    /// Seconds since the client last obtained or extended the lease.
    pub fn age_seconds(&self) -> i64 {
        (Utc::now() - self.last_seen).num_seconds().max(0)
    }

    /// Extends the lease for `valid_lifetime` seconds from now and returns
    /// it to the `Default` state.
    pub fn extend(&mut self, valid_lifetime: u32) {
        let now = Utc::now();
        self.state = LeaseState::Default;
        self.valid_lifetime = valid_lifetime;
        self.expires_at = now + TimeDelta::seconds(i64::from(valid_lifetime));
        self.last_seen = now;
    }

    /// Puts the lease into decline probation for the given duration.
    pub fn decline(&mut self, probation_seconds: u32) {
        let now = Utc::now();
        self.state = LeaseState::Declined;
        self.expires_at = now + TimeDelta::seconds(i64::from(probation_seconds));
        self.last_seen = now;
    }

    /// Persists relay agent options into the extended-info blob.
    pub fn stash_relay_info(&mut self, info: &RelayAgentInfo) -> Result<()> {
        let encoded = serde_json::to_value(info)?;
        match self.extended_info.as_mut() {
            Some(serde_json::Value::Object(map)) => {
                map.insert(RELAY_INFO_KEY.to_string(), encoded);
            }
            _ => {
                let mut map = serde_json::Map::new();
                map.insert(RELAY_INFO_KEY.to_string(), encoded);
                self.extended_info = Some(serde_json::Value::Object(map));
            }
        }
        Ok(())
    }

    /// Recovers stashed relay agent options, if any were persisted.
    pub fn stashed_relay_info(&self) -> Option<RelayAgentInfo> {
        self.extended_info
            .as_ref()
            .and_then(|value| value.get(RELAY_INFO_KEY))
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }
}

/// CRUD interface over lease storage.
///
/// Implementations map storage failures to
/// [`Error::Repository`](crate::error::Error::Repository); the engine
/// treats those as hard errors and sends nothing.
#[async_trait]
pub trait LeaseRepository: Send + Sync {
    /// The lease recorded for an address, in any state.
    async fn find_by_address(&self, addr: Ipv4Addr) -> Result<Option<Lease>>;

    /// The active lease bound to an identifier within a subnet. Only
    /// hardware-address and client-id kinds key leases; other kinds
    /// resolve to nothing.
    async fn find_active_by_identifier(
        &self,
        subnet_id: SubnetId,
        kind: IdentifierKind,
        value: &[u8],
    ) -> Result<Option<Lease>>;

    /// All active leases in a subnet.
    async fn find_active_in_subnet(&self, subnet_id: SubnetId) -> Result<Vec<Lease>>;

    /// Atomically inserts the lease unless its address is already taken by
    /// a record that still precludes allocation. Returns whether the claim
    /// won.
    async fn try_claim(&self, lease: Lease) -> Result<bool>;

    /// Commits a modified lease if the stored version still matches the
    /// version the caller read. Returns false on a lost race or a missing
    /// record.
    async fn update(&self, lease: Lease) -> Result<bool>;

    /// Removes the record for an address. Returns whether one existed.
    async fn delete(&self, addr: Ipv4Addr) -> Result<bool>;
}

/// Secondary-index key: which identity field a lease is findable by.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum KeySource {
    Hw,
    ClientId,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct LeaseKey {
    subnet_id: SubnetId,
    source: KeySource,
    value: Vec<u8>,
}

fn key_source(kind: IdentifierKind) -> Option<KeySource> {
    match kind {
        IdentifierKind::HwAddress => Some(KeySource::Hw),
        IdentifierKind::ClientId | IdentifierKind::Duid => Some(KeySource::ClientId),
        IdentifierKind::CircuitId | IdentifierKind::FlexId => None,
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    by_address: HashMap<Ipv4Addr, Lease>,
    by_key: HashMap<LeaseKey, Ipv4Addr>,
}

impl StoreInner {
    fn keys_of(lease: &Lease) -> Vec<LeaseKey> {
        let mut keys = Vec::with_capacity(2);
        if let Some(hw) = &lease.hw_address {
            keys.push(LeaseKey {
                subnet_id: lease.subnet_id,
                source: KeySource::Hw,
                value: hw.clone(),
            });
        }
        if let Some(cid) = &lease.client_id {
            keys.push(LeaseKey {
                subnet_id: lease.subnet_id,
                source: KeySource::ClientId,
                value: cid.clone(),
            });
        }
        keys
    }

    fn unindex(&mut self, lease: &Lease) {
        for key in Self::keys_of(lease) {
            if self.by_key.get(&key) == Some(&lease.address) {
                self.by_key.remove(&key);
            }
        }
    }

    fn index(&mut self, lease: &Lease) {
        for key in Self::keys_of(lease) {
            self.by_key.insert(key, lease.address);
        }
    }
}

/// Thread-safe in-memory lease repository.
#[derive(Debug, Default)]
pub struct MemoryLeaseStore {
    state: RwLock<StoreInner>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LeaseRepository for MemoryLeaseStore {
    async fn find_by_address(&self, addr: Ipv4Addr) -> Result<Option<Lease>> {
        let state = self.state.read().await;
        Ok(state.by_address.get(&addr).cloned())
    }

    async fn find_active_by_identifier(
        &self,
        subnet_id: SubnetId,
        kind: IdentifierKind,
        value: &[u8],
    ) -> Result<Option<Lease>> {
        let Some(source) = key_source(kind) else {
            return Ok(None);
        };
        let key = LeaseKey {
            subnet_id,
            source,
            value: value.to_vec(),
        };
        let state = self.state.read().await;
        Ok(state
            .by_key
            .get(&key)
            .and_then(|addr| state.by_address.get(addr))
            .filter(|lease| lease.is_active())
            .cloned())
    }

    async fn find_active_in_subnet(&self, subnet_id: SubnetId) -> Result<Vec<Lease>> {
        let state = self.state.read().await;
        Ok(state
            .by_address
            .values()
            .filter(|lease| lease.subnet_id == subnet_id && lease.is_active())
            .cloned()
            .collect())
    }

    async fn try_claim(&self, lease: Lease) -> Result<bool> {
        let mut state = self.state.write().await;

        if let Some(existing) = state.by_address.get(&lease.address) {
            if existing.precludes_allocation() {
                return Ok(false);
            }
            let stale = existing.clone();
            state.unindex(&stale);
        }

        state.index(&lease);
        state.by_address.insert(lease.address, lease);
        Ok(true)
    }

    async fn update(&self, lease: Lease) -> Result<bool> {
        let mut state = self.state.write().await;

        let Some(stored) = state.by_address.get(&lease.address) else {
            return Ok(false);
        };
        if stored.version != lease.version {
            return Ok(false);
        }

        let stale = stored.clone();
        state.unindex(&stale);

        let mut committed = lease;
        committed.version += 1;
        state.index(&committed);
        state.by_address.insert(committed.address, committed);
        Ok(true)
    }

    async fn delete(&self, addr: Ipv4Addr) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.by_address.remove(&addr) {
            Some(removed) => {
                state.unindex(&removed);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease_for(addr: [u8; 4], hw: &[u8]) -> Lease {
        let mut lease = Lease::new(Ipv4Addr::from(addr), 1, 3600);
        lease.hw_address = Some(hw.to_vec());
        lease
    }

    #[test]
    fn test_lease_lifetime_accounting() {
        let lease = Lease::new(Ipv4Addr::new(10, 0, 0, 10), 1, 3600);
        assert!(lease.is_active());
        assert!(lease.remaining_seconds() > 3500);
        assert_eq!(lease.age_seconds(), 0);

        let mut expired = Lease::new(Ipv4Addr::new(10, 0, 0, 10), 1, 3600);
        expired.expires_at = Utc::now() - TimeDelta::seconds(1);
        assert!(expired.is_expired());
        assert!(!expired.is_active());
        assert!(!expired.precludes_allocation());
        assert_eq!(expired.remaining_seconds(), 0);

        let mut renewed = expired.clone();
        renewed.extend(7200);
        assert!(renewed.is_active());
        assert!(renewed.remaining_seconds() > 7100);
    }

    #[test]
    fn test_declined_lease_precludes_allocation_until_probation_ends() {
        let mut lease = Lease::new(Ipv4Addr::new(10, 0, 0, 10), 1, 3600);
        lease.decline(3600);
        assert_eq!(lease.state, LeaseState::Declined);
        assert!(!lease.is_active());
        assert!(lease.precludes_allocation());

        lease.expires_at = Utc::now() - TimeDelta::seconds(1);
        assert!(!lease.precludes_allocation());
    }

    #[test]
    fn test_relay_info_stash_roundtrip() {
        let mut lease = Lease::new(Ipv4Addr::new(10, 0, 0, 10), 1, 3600);
        assert!(lease.stashed_relay_info().is_none());

        let info = RelayAgentInfo {
            circuit_id: Some(vec![1, 2]),
            remote_id: Some(vec![3]),
        };
        lease.stash_relay_info(&info).unwrap();
        assert_eq!(lease.stashed_relay_info(), Some(info));
    }

    #[tokio::test]
    async fn test_claim_then_lookup() {
        let store = MemoryLeaseStore::new();
        let lease = lease_for([10, 0, 0, 10], &[1; 6]);

        assert!(store.try_claim(lease.clone()).await.unwrap());

        let by_addr = store
            .find_by_address(Ipv4Addr::new(10, 0, 0, 10))
            .await
            .unwrap();
        assert!(by_addr.is_some());

        let by_hw = store
            .find_active_by_identifier(1, IdentifierKind::HwAddress, &[1; 6])
            .await
            .unwrap();
        assert_eq!(by_hw.unwrap().address, Ipv4Addr::new(10, 0, 0, 10));

        // circuit ids never key leases
        let by_circuit = store
            .find_active_by_identifier(1, IdentifierKind::CircuitId, &[1; 6])
            .await
            .unwrap();
        assert!(by_circuit.is_none());
    }

    #[tokio::test]
    async fn test_second_claim_for_same_address_loses() {
        let store = MemoryLeaseStore::new();
        assert!(store
            .try_claim(lease_for([10, 0, 0, 10], &[1; 6]))
            .await
            .unwrap());
        assert!(!store
            .try_claim(lease_for([10, 0, 0, 10], &[2; 6]))
            .await
            .unwrap());

        // still owned by the winner
        let stored = store
            .find_by_address(Ipv4Addr::new(10, 0, 0, 10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.hw_address, Some(vec![1; 6]));
    }

    #[tokio::test]
    async fn test_expired_record_can_be_reclaimed_by_claim() {
        let store = MemoryLeaseStore::new();
        let mut stale = lease_for([10, 0, 0, 10], &[1; 6]);
        stale.expires_at = Utc::now() - TimeDelta::seconds(1);
        assert!(store.try_claim(stale).await.unwrap());

        assert!(store
            .try_claim(lease_for([10, 0, 0, 10], &[2; 6]))
            .await
            .unwrap());

        // the stale owner's identifier index no longer resolves
        let old = store
            .find_active_by_identifier(1, IdentifierKind::HwAddress, &[1; 6])
            .await
            .unwrap();
        assert!(old.is_none());
    }

    #[tokio::test]
    async fn test_optimistic_update_detects_concurrent_commit() {
        let store = MemoryLeaseStore::new();
        store
            .try_claim(lease_for([10, 0, 0, 10], &[1; 6]))
            .await
            .unwrap();

        let reader_a = store
            .find_by_address(Ipv4Addr::new(10, 0, 0, 10))
            .await
            .unwrap()
            .unwrap();
        let reader_b = reader_a.clone();

        let mut first = reader_a;
        first.extend(7200);
        assert!(store.update(first).await.unwrap());

        // second writer read version 0, which is gone now
        let mut second = reader_b;
        second.extend(1800);
        assert!(!store.update(second).await.unwrap());

        let stored = store
            .find_by_address(Ipv4Addr::new(10, 0, 0, 10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.valid_lifetime, 7200);
    }

    #[tokio::test]
    async fn test_delete_frees_address_and_keys() {
        let store = MemoryLeaseStore::new();
        store
            .try_claim(lease_for([10, 0, 0, 10], &[1; 6]))
            .await
            .unwrap();

        assert!(store.delete(Ipv4Addr::new(10, 0, 0, 10)).await.unwrap());
        assert!(!store.delete(Ipv4Addr::new(10, 0, 0, 10)).await.unwrap());

        assert!(store
            .find_by_address(Ipv4Addr::new(10, 0, 0, 10))
            .await
            .unwrap()
            .is_none());
        assert!(store
            .find_active_by_identifier(1, IdentifierKind::HwAddress, &[1; 6])
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_find_active_in_subnet_filters_state() {
        let store = MemoryLeaseStore::new();
        store
            .try_claim(lease_for([10, 0, 0, 10], &[1; 6]))
            .await
            .unwrap();

        let mut declined = lease_for([10, 0, 0, 11], &[2; 6]);
        declined.decline(3600);
        store.try_claim(declined).await.unwrap();

        let mut other_subnet = lease_for([10, 0, 1, 10], &[3; 6]);
        other_subnet.subnet_id = 2;
        store.try_claim(other_subnet).await.unwrap();

        let active = store.find_active_in_subnet(1).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].address, Ipv4Addr::new(10, 0, 0, 10));
    }
}
