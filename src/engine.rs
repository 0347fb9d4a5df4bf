//! The allocation engine: the state machine that turns client messages into
//! allocation decisions.
//!
//! Each inbound message is classified into a client-visible protocol state
//! (selecting, requesting, init-reboot, renewing, rebinding, releasing,
//! declining) and run through a fixed decision order for address selection:
//!
//! 1. an applicable host reservation,
//! 2. the client's existing active lease (address stability),
//! 3. the specific address the client asked for, when free,
//! 4. a fresh candidate from the dynamic pools,
//! 5. NAK or silence, depending on subnet authority.
//!
//! Claims go through the repository's atomic insert-if-absent, so two
//! workers racing for the same address resolve deterministically: the loser
//! re-invokes the allocator with the contended address excluded.
//!
//! Every outcome a client can observe (ACK-equivalent allocations, NAKs,
//! deliberate silence) is a value in [`AllocationResult`]; only a
//! repository that cannot be read or written surfaces as an error, and then
//! no reply is sent at all.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::{ConfigHandle, ConfigSnapshot, Subnet, SubnetId};
use crate::ddns::{DdnsQueue, NameChangeRequest, NullDdnsQueue};
use crate::error::{Error, Result};
use crate::hooks::{HookAction, HookContext, Hooks, NoopHooks};
use crate::ident::{self, ClientIdentifier};
use crate::lease::{Lease, LeaseRepository};
use crate::packet::{hex_id, ClientMessage, MessageKind};
use crate::reservation::{self, Reservation, ReservationBackend, ReservationScope};
use crate::stats::{self, NullStatsSink, StatsSink};

/// Seconds a declined address sits out before it may be offered again.
const DECLINE_PROBATION_SECONDS: u32 = 3600;

/// Attempts at an optimistic lease update before giving up on the message.
const UPDATE_RETRY_LIMIT: u32 = 3;

/// Client-visible protocol states, classified per message; never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// DISCOVER: the client is soliciting offers.
    Selecting,
    /// REQUEST naming this server, following an offer.
    Requesting,
    /// REQUEST without a server id, remembering an address from before.
    InitReboot,
    /// Unicast REQUEST with a non-zero ciaddr: lease extension.
    Renewing,
    /// Broadcast REQUEST with a non-zero ciaddr: any-server extension.
    Rebinding,
    /// RELEASE: the client is returning its address.
    Releasing,
    /// DECLINE: the client found the address in use elsewhere.
    Declining,
}

impl std::fmt::Display for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Selecting => write!(f, "SELECTING"),
            Self::Requesting => write!(f, "REQUESTING"),
            Self::InitReboot => write!(f, "INIT-REBOOT"),
            Self::Renewing => write!(f, "RENEWING"),
            Self::Rebinding => write!(f, "REBINDING"),
            Self::Releasing => write!(f, "RELEASING"),
            Self::Declining => write!(f, "DECLINING"),
        }
    }
}

/// How the engine disposed of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// A lease was newly claimed (offer or fresh commit).
    Allocated,
    /// An existing lease was extended and written back.
    Renewed,
    /// An existing lease was returned without a repository write.
    ReusedCached,
    /// Explicit rejection; the client must restart discovery.
    Nak,
    /// Deliberate silence; the client's own timers take over.
    NoReply,
}

/// Diagnostic detail accompanying an outcome, for logs and operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasonCode {
    /// A host reservation pinned the address.
    ReservedAddress,
    /// The client's existing lease was kept for address stability.
    ExistingLease,
    /// The client's requested address was free and granted.
    RequestedAddress,
    /// The dynamic allocator chose the address.
    DynamicPool,
    /// Cache policy allowed reuse without persistence.
    CachedLease,
    /// No candidate satisfied the constraints.
    PoolExhausted,
    /// No configured subnet matched the message.
    UnknownSubnet,
    /// No binding known for this client.
    UnknownClient,
    /// The message named a different server.
    NotOurServer,
    /// The message lacked fields its type requires.
    Malformed,
    /// The client must move to its reserved address.
    ReservedElsewhere,
    /// The address is reserved for a different identity.
    ReservationConflict,
    /// The address is actively bound to a different client.
    AddressInUse,
    /// The address lies outside every eligible pool.
    AddressOutOfPool,
    /// The sender does not own the lease it named.
    IdentifierMismatch,
    /// A hook vetoed the default action.
    HookSkip,
    /// A lease was released and removed.
    Released,
    /// An address entered decline probation.
    Declined,
}

/// Fixed reply fields sourced from a reservation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootInfo {
    pub next_server: Option<Ipv4Addr>,
    pub boot_file_name: Option<String>,
    pub server_hostname: Option<String>,
    pub hostname: Option<String>,
}

/// The engine's decision for one message.
#[derive(Debug, Clone)]
pub struct AllocationResult {
    pub outcome: Outcome,
    pub lease: Option<Lease>,
    pub subnet_id: Option<SubnetId>,
    pub reason: ReasonCode,
    pub boot: Option<BootInfo>,
}

impl AllocationResult {
    fn granted(outcome: Outcome, lease: Lease, reason: ReasonCode, boot: Option<BootInfo>) -> Self {
        Self {
            outcome,
            subnet_id: Some(lease.subnet_id),
            lease: Some(lease),
            reason,
            boot,
        }
    }

    fn nak(subnet_id: Option<SubnetId>, reason: ReasonCode) -> Self {
        Self {
            outcome: Outcome::Nak,
            lease: None,
            subnet_id,
            reason,
            boot: None,
        }
    }

    fn no_reply(subnet_id: Option<SubnetId>, reason: ReasonCode) -> Self {
        Self {
            outcome: Outcome::NoReply,
            lease: None,
            subnet_id,
            reason,
            boot: None,
        }
    }
}

/// Transport-level facts about how a message arrived.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext {
    /// Address of the interface the message arrived on; anchors subnet
    /// selection for non-relayed messages.
    pub local_addr: Ipv4Addr,
    /// Whether the message was unicast to this server (renew) rather than
    /// broadcast (rebind).
    pub unicast: bool,
}

impl RequestContext {
    pub fn broadcast(local_addr: Ipv4Addr) -> Self {
        Self {
            local_addr,
            unicast: false,
        }
    }

    pub fn unicast(local_addr: Ipv4Addr) -> Self {
        Self {
            local_addr,
            unicast: true,
        }
    }
}

/// The identity fields that bind leases, extracted once per message.
#[derive(Debug, Clone)]
struct Identity {
    hw: Option<Vec<u8>>,
    client_id: Option<Vec<u8>>,
}

impl Identity {
    fn of(msg: &ClientMessage) -> Self {
        Self {
            hw: msg.hw_bytes().map(<[u8]>::to_vec),
            client_id: msg.client_id_bytes().map(<[u8]>::to_vec),
        }
    }

    fn label(&self) -> String {
        match (&self.hw, &self.client_id) {
            (Some(hw), _) => hex_id(hw),
            (None, Some(cid)) => hex_id(cid),
            (None, None) => "<anonymous>".to_string(),
        }
    }
}

/// Ownership test for a lease against a message's identity.
///
/// The hardware address must match; a changed hardware address is a
/// different client no matter what. With `match_client_id` the
/// client-identifier must match too, so client-id drift on a stable MAC
/// (multi-stage boot loaders) yields a distinct logical client instead of
/// hijacking the existing lease. Without it the hardware address alone is
/// authoritative and client-id drift is ignored.
fn lease_owned_by(lease: &Lease, identity: &Identity, match_client_id: bool) -> bool {
    let hw_matches = match (&lease.hw_address, &identity.hw) {
        (Some(ours), Some(theirs)) => ours == theirs,
        (None, None) => true,
        _ => false,
    };
    if !hw_matches {
        return false;
    }
    if match_client_id {
        lease.client_id == identity.client_id
    } else {
        true
    }
}

/// Whether cache policy lets an existing lease answer without persistence.
///
/// Reuse must be invisible to the client, so the stored lifetime has to
/// equal what this exchange would grant, on top of the age limits.
fn cache_permits(subnet: &Subnet, lease: &Lease, negotiated_lifetime: u32) -> bool {
    if !lease.is_active() || lease.valid_lifetime != negotiated_lifetime {
        return false;
    }
    let age = lease.age_seconds();
    if let Some(threshold) = subnet.cache_threshold
        && (age as f64) < threshold * f64::from(lease.valid_lifetime)
    {
        return true;
    }
    if let Some(max_age) = subnet.cache_max_age
        && age < i64::from(max_age)
    {
        return true;
    }
    false
}

/// The allocation state machine with its injected collaborators.
///
/// One engine instance is shared by all worker threads; per-message state
/// lives on the stack of [`process`](Self::process).
pub struct AllocationEngine {
    server_id: Ipv4Addr,
    config: Arc<ConfigHandle>,
    leases: Arc<dyn LeaseRepository>,
    reservations: Arc<dyn ReservationBackend>,
    stats: Arc<dyn StatsSink>,
    ddns: Arc<dyn DdnsQueue>,
    hooks: Arc<dyn Hooks>,
}

impl AllocationEngine {
    /// Creates an engine with no-op statistics, DDNS, and hooks.
    pub fn new(
        server_id: Ipv4Addr,
        config: Arc<ConfigHandle>,
        leases: Arc<dyn LeaseRepository>,
        reservations: Arc<dyn ReservationBackend>,
    ) -> Self {
        Self {
            server_id,
            config,
            leases,
            reservations,
            stats: Arc::new(NullStatsSink),
            ddns: Arc::new(NullDdnsQueue),
            hooks: Arc::new(NoopHooks),
        }
    }

    pub fn with_stats(mut self, stats: Arc<dyn StatsSink>) -> Self {
        self.stats = stats;
        self
    }

    pub fn with_ddns(mut self, ddns: Arc<dyn DdnsQueue>) -> Self {
        self.ddns = ddns;
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn Hooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// The server identifier clients name when accepting our offers.
    pub fn server_id(&self) -> Ipv4Addr {
        self.server_id
    }

    /// Runs one message through the state machine to completion.
    pub async fn process(
        &self,
        msg: &ClientMessage,
        ctx: &RequestContext,
    ) -> Result<AllocationResult> {
        let snapshot = self.config.current();
        match msg.kind {
            MessageKind::Discover => self.process_discover(&snapshot, msg, ctx).await,
            MessageKind::Request => self.process_request(&snapshot, msg, ctx).await,
            MessageKind::Release => self.process_release(&snapshot, msg, ctx).await,
            MessageKind::Decline => self.process_decline(&snapshot, msg, ctx).await,
        }
    }

    // ---- selecting -----------------------------------------------------

    async fn process_discover(
        &self,
        snapshot: &ConfigSnapshot,
        msg: &ClientMessage,
        ctx: &RequestContext,
    ) -> Result<AllocationResult> {
        let identity = Identity::of(msg);
        let Some(subnet) = snapshot.select_subnet(msg.giaddr, ctx.local_addr) else {
            debug!("DISCOVER from {}: no matching subnet", identity.label());
            return Ok(AllocationResult::no_reply(None, ReasonCode::UnknownSubnet));
        };
        let subnet = Arc::clone(subnet);

        let identifiers = ident::resolve(msg, &subnet.host_reservation_identifiers);
        let reservation = self.applicable_reservation(&subnet, &identifiers).await;
        let current = self
            .find_owned_lease(snapshot, &subnet, &identity)
            .await?;

        let mut pinned: Option<(Ipv4Addr, SubnetId, ReasonCode)> = None;

        // 1. reservation precedence
        if let Some(res) = &reservation
            && let Some(reserved) = res.address
        {
            let usable = match self.leases.find_by_address(reserved).await? {
                Some(holder) => {
                    !holder.precludes_allocation()
                        || lease_owned_by(&holder, &identity, subnet.match_client_id)
                }
                None => true,
            };
            if usable {
                pinned = Some((reserved, subnet.id, ReasonCode::ReservedAddress));
            } else {
                // transient: a still-active lease holds the reserved
                // address; the reservation owner gets a dynamic one for now
                debug!(
                    "reserved address {} still held elsewhere, {} falls back to the pool",
                    reserved,
                    identity.label()
                );
            }
        }

        // 2. address stability: keep the lease the client already holds
        if pinned.is_none()
            && let Some(lease) = &current
        {
            let conflicting = match self.reservation_on_address(&subnet, lease.address).await {
                Some(res) => !res.matches_any(&identifiers),
                None => false,
            };
            if conflicting {
                self.count_conflict(&subnet);
                info!(
                    "address {} held by {} is reserved for another identity",
                    lease.address,
                    identity.label()
                );
            } else {
                let negotiated = subnet.negotiate_lifetime(msg.requested_lease_time);
                if cache_permits(&subnet, lease, negotiated) {
                    self.count_reuse(&subnet);
                    return Ok(AllocationResult::granted(
                        Outcome::ReusedCached,
                        lease.clone(),
                        ReasonCode::CachedLease,
                        boot_info(reservation.as_ref()),
                    ));
                }
                pinned = Some((lease.address, lease.subnet_id, ReasonCode::ExistingLease));
            }
        }

        // 3. requested address, honored when free
        if pinned.is_none()
            && let Some(wanted) = msg.requested_addr
            && let Some(pool_subnet) = snapshot.pool_subnet_for(&subnet, wanted)
            && self
                .address_free_for(&pool_subnet, wanted, &identity, &identifiers, &subnet)
                .await?
        {
            pinned = Some((wanted, pool_subnet.id, ReasonCode::RequestedAddress));
        }

        self.commit_offer(snapshot, &subnet, msg, &identity, &identifiers, &reservation, &current, pinned)
            .await
    }

    /// Claims the selected candidate, falling back to dynamic allocation
    /// when the pinned choice is unavailable or loses its claim race.
    #[allow(clippy::too_many_arguments)]
    async fn commit_offer(
        &self,
        snapshot: &ConfigSnapshot,
        subnet: &Arc<Subnet>,
        msg: &ClientMessage,
        identity: &Identity,
        identifiers: &[ClientIdentifier],
        reservation: &Option<Reservation>,
        current: &Option<Lease>,
        mut pinned: Option<(Ipv4Addr, SubnetId, ReasonCode)>,
    ) -> Result<AllocationResult> {
        let mut exclude: HashSet<Ipv4Addr> = HashSet::new();

        loop {
            let (addr, pool_subnet_id, reason) = match pinned.take() {
                Some(choice) => choice,
                None => match self
                    .dynamic_candidate(snapshot, subnet, identity, identifiers, &mut exclude)
                    .await?
                {
                    Some((addr, id)) => (addr, id, ReasonCode::DynamicPool),
                    None => {
                        self.stats.increment(
                            stats::POOL_EXHAUSTED,
                            Some(&stats::subnet_counter(subnet.id, stats::POOL_EXHAUSTED)),
                        );
                        warn!(
                            "no address available for {} in subnet {}",
                            identity.label(),
                            subnet.id
                        );
                        // a DISCOVER is never NAKed
                        return Ok(AllocationResult::no_reply(
                            Some(subnet.id),
                            ReasonCode::PoolExhausted,
                        ));
                    }
                },
            };

            let hook_ctx = HookContext {
                message: msg,
                subnet_id: Some(subnet.id),
                candidate: Some(addr),
                lease: current.as_ref(),
            };
            let addr = match self.hooks.lease_select(&hook_ctx).await {
                HookAction::Continue => addr,
                HookAction::Skip => {
                    return Ok(AllocationResult::no_reply(
                        Some(subnet.id),
                        ReasonCode::HookSkip,
                    ));
                }
                HookAction::ReplaceAddress(replacement) => replacement,
            };

            // re-offering the lease the client already holds needs no claim
            if let Some(lease) = current
                && lease.address == addr
            {
                let mut touched = lease.clone();
                touched.last_seen = Utc::now();
                if self.leases.update(touched.clone()).await? {
                    touched.version += 1;
                } else {
                    // someone refreshed it concurrently; the offer stands
                    touched = lease.clone();
                }
                info!("offering {} back to {}", addr, identity.label());
                return Ok(AllocationResult::granted(
                    Outcome::Allocated,
                    touched,
                    reason,
                    boot_info(reservation.as_ref()),
                ));
            }

            let mut lease = Lease::new(addr, pool_subnet_id, subnet.offer_lifetime);
            lease.hw_address = identity.hw.clone();
            lease.client_id = identity.client_id.clone();
            lease.hostname = msg.sanitized_hostname();
            if subnet.stash_agent_options
                && let Some(info) = &msg.relay_info
            {
                lease.stash_relay_info(info)?;
            }

            if self.leases.try_claim(lease.clone()).await? {
                info!("offering {} to {}", addr, identity.label());
                return Ok(AllocationResult::granted(
                    Outcome::Allocated,
                    lease,
                    reason,
                    boot_info(reservation.as_ref()),
                ));
            }

            // lost the race; exclude the contended address and go again
            self.stats.increment(
                stats::ALLOCATION_COLLISIONS,
                Some(&stats::subnet_counter(
                    subnet.id,
                    stats::ALLOCATION_COLLISIONS,
                )),
            );
            exclude.insert(addr);
        }
    }

    /// Pulls allocator candidates across the shared network, skipping
    /// addresses reserved for other identities or still bound by a lease.
    async fn dynamic_candidate(
        &self,
        snapshot: &ConfigSnapshot,
        subnet: &Arc<Subnet>,
        identity: &Identity,
        identifiers: &[ClientIdentifier],
        exclude: &mut HashSet<Ipv4Addr>,
    ) -> Result<Option<(Ipv4Addr, SubnetId)>> {
        for member in snapshot.allocation_subnets(subnet) {
            let Some(allocator) = snapshot.allocator(member.id) else {
                continue;
            };
            while let Some(candidate) = allocator.allocate(exclude, None) {
                if let Some(res) = self.reservation_on_address(&member, candidate).await
                    && !res.matches_any(identifiers)
                {
                    exclude.insert(candidate);
                    continue;
                }
                if let Some(lease) = self.leases.find_by_address(candidate).await?
                    && lease.precludes_allocation()
                    && !lease_owned_by(&lease, identity, subnet.match_client_id)
                {
                    exclude.insert(candidate);
                    continue;
                }
                return Ok(Some((candidate, member.id)));
            }
        }
        Ok(None)
    }

    // ---- request-class states ------------------------------------------

    async fn process_request(
        &self,
        snapshot: &ConfigSnapshot,
        msg: &ClientMessage,
        ctx: &RequestContext,
    ) -> Result<AllocationResult> {
        let identity = Identity::of(msg);

        let state = if let Some(server_id) = msg.server_id {
            if server_id != self.server_id {
                debug!(
                    "{} chose another server {}, staying out of it",
                    identity.label(),
                    server_id
                );
                return Ok(AllocationResult::no_reply(None, ReasonCode::NotOurServer));
            }
            ClientState::Requesting
        } else if msg.ciaddr == Ipv4Addr::UNSPECIFIED {
            ClientState::InitReboot
        } else if ctx.unicast {
            ClientState::Renewing
        } else {
            ClientState::Rebinding
        };

        let target = match state {
            ClientState::Requesting | ClientState::InitReboot => match msg.requested_addr {
                Some(addr) => addr,
                None => {
                    debug!("REQUEST from {} names no address", identity.label());
                    return Ok(AllocationResult::no_reply(None, ReasonCode::Malformed));
                }
            },
            _ => msg.ciaddr,
        };

        let Some(subnet) = snapshot.select_subnet(msg.giaddr, ctx.local_addr) else {
            // the subnet may have been removed between offer and request;
            // only the global default can answer for authority here
            debug!("{} REQUEST for {}: no matching subnet", state, target);
            return Ok(if snapshot.policy.authoritative {
                AllocationResult::nak(None, ReasonCode::UnknownSubnet)
            } else {
                AllocationResult::no_reply(None, ReasonCode::UnknownSubnet)
            });
        };
        let subnet = Arc::clone(subnet);

        info!(
            "{} from {} for {} on subnet {}",
            state,
            identity.label(),
            target,
            subnet.id
        );

        let identifiers = self
            .effective_identifiers(&subnet, msg, &identity, state, target)
            .await?;
        let reservation = self.applicable_reservation(&subnet, &identifiers).await;

        // the reservation owner must end up on the reserved address; an
        // in-place switch is impossible mid-request, so reject and let
        // discovery substitute it, unless the reserved address is still
        // actively held elsewhere (transient), which suspends the rule
        if let Some(res) = &reservation
            && let Some(reserved) = res.address
            && reserved != target
        {
            let held_elsewhere = match self.leases.find_by_address(reserved).await? {
                Some(holder) => {
                    holder.precludes_allocation()
                        && !lease_owned_by(&holder, &identity, subnet.match_client_id)
                }
                None => false,
            };
            if !held_elsewhere {
                info!(
                    "{} must move to reserved address {}, rejecting {}",
                    identity.label(),
                    reserved,
                    target
                );
                return Ok(AllocationResult::nak(
                    Some(subnet.id),
                    ReasonCode::ReservedElsewhere,
                ));
            }
        }

        // never hand a client an address reserved for somebody else
        let scope_subnet = snapshot
            .allocation_subnets(&subnet)
            .into_iter()
            .find(|member| member.contains(target))
            .unwrap_or_else(|| Arc::clone(&subnet));
        if let Some(res) = self.reservation_on_address(&scope_subnet, target).await
            && !res.matches_any(&identifiers)
        {
            self.count_conflict(&subnet);
            warn!(
                "{} asked for {}, which is reserved for another identity",
                identity.label(),
                target
            );
            return Ok(AllocationResult::nak(
                Some(subnet.id),
                ReasonCode::ReservationConflict,
            ));
        }

        match self.leases.find_by_address(target).await? {
            Some(lease)
                if lease.is_active()
                    && lease_owned_by(&lease, &identity, subnet.match_client_id) =>
            {
                self.renew_existing(snapshot, &subnet, msg, &identity, &reservation, lease, target)
                    .await
            }
            Some(lease) if lease.precludes_allocation() => {
                info!(
                    "{} asked for {}, which is bound to another client",
                    identity.label(),
                    target
                );
                Ok(self.refuse(&subnet, ReasonCode::AddressInUse))
            }
            _ => {
                // no usable record for the target address
                match state {
                    ClientState::Requesting => {
                        self.claim_requested(
                            snapshot,
                            &subnet,
                            msg,
                            &identity,
                            &reservation,
                            target,
                        )
                        .await
                    }
                    _ => {
                        info!(
                            "{} client {} unknown for {}",
                            state,
                            identity.label(),
                            target
                        );
                        Ok(self.refuse(&subnet, ReasonCode::UnknownClient))
                    }
                }
            }
        }
    }

    /// Extends a lease the client verifiably owns.
    #[allow(clippy::too_many_arguments)]
    async fn renew_existing(
        &self,
        snapshot: &ConfigSnapshot,
        subnet: &Arc<Subnet>,
        msg: &ClientMessage,
        identity: &Identity,
        reservation: &Option<Reservation>,
        lease: Lease,
        target: Ipv4Addr,
    ) -> Result<AllocationResult> {
        // an out-of-pool address stays renewable only while a reservation
        // justifies it; once the reservation is gone the binding dies here
        let reserved_for_us = reservation
            .as_ref()
            .and_then(|res| res.address)
            == Some(target);
        if snapshot.pool_subnet_for(subnet, target).is_none() && !reserved_for_us {
            info!(
                "{} renewing {} which is neither poolable nor reserved",
                identity.label(),
                target
            );
            return Ok(self.refuse(subnet, ReasonCode::AddressOutOfPool));
        }

        let hook_ctx = HookContext {
            message: msg,
            subnet_id: Some(subnet.id),
            candidate: Some(target),
            lease: Some(&lease),
        };
        if self.hooks.lease_renew(&hook_ctx).await == HookAction::Skip {
            return Ok(AllocationResult::no_reply(
                Some(subnet.id),
                ReasonCode::HookSkip,
            ));
        }

        let negotiated = subnet.negotiate_lifetime(msg.requested_lease_time);
        if cache_permits(subnet, &lease, negotiated) {
            self.count_reuse(subnet);
            debug!("reusing cached lease {} for {}", target, identity.label());
            return Ok(AllocationResult::granted(
                Outcome::ReusedCached,
                lease,
                ReasonCode::CachedLease,
                boot_info(reservation.as_ref()),
            ));
        }

        let mut attempt = lease;
        for _ in 0..UPDATE_RETRY_LIMIT {
            attempt.extend(negotiated);
            if let Some(hostname) = msg.sanitized_hostname() {
                attempt.hostname = Some(hostname);
            }
            if subnet.stash_agent_options
                && let Some(info) = &msg.relay_info
            {
                attempt.stash_relay_info(info)?;
            }

            if self.leases.update(attempt.clone()).await? {
                attempt.version += 1;
                if let Some(hostname) = attempt.hostname.clone().filter(|h| !h.is_empty()) {
                    self.ddns.enqueue(NameChangeRequest::add(hostname, target));
                }
                info!(
                    "renewed {} for {} ({} seconds)",
                    target,
                    identity.label(),
                    negotiated
                );
                return Ok(AllocationResult::granted(
                    Outcome::Renewed,
                    attempt,
                    ReasonCode::ExistingLease,
                    boot_info(reservation.as_ref()),
                ));
            }

            // the record moved under us; re-read and try again
            match self.leases.find_by_address(target).await? {
                Some(fresh)
                    if fresh.is_active()
                        && lease_owned_by(&fresh, identity, subnet.match_client_id) =>
                {
                    attempt = fresh;
                }
                _ => return Ok(self.refuse(subnet, ReasonCode::AddressInUse)),
            }
        }
        Err(Error::Repository(
            "lease update kept losing optimistic races".to_string(),
        ))
    }

    /// Grants a specifically requested address with no current record,
    /// e.g. when the backing offer expired before the REQUEST arrived.
    async fn claim_requested(
        &self,
        snapshot: &ConfigSnapshot,
        subnet: &Arc<Subnet>,
        msg: &ClientMessage,
        identity: &Identity,
        reservation: &Option<Reservation>,
        target: Ipv4Addr,
    ) -> Result<AllocationResult> {
        let reserved_for_us = reservation
            .as_ref()
            .and_then(|res| res.address)
            == Some(target);
        let claim_subnet_id = match snapshot.pool_subnet_for(subnet, target) {
            Some(pool_subnet) => pool_subnet.id,
            None if reserved_for_us => subnet.id,
            None => {
                info!(
                    "{} requested {}, outside every eligible pool",
                    identity.label(),
                    target
                );
                return Ok(self.refuse(subnet, ReasonCode::AddressOutOfPool));
            }
        };

        let hook_ctx = HookContext {
            message: msg,
            subnet_id: Some(subnet.id),
            candidate: Some(target),
            lease: None,
        };
        let target = match self.hooks.lease_select(&hook_ctx).await {
            HookAction::Continue => target,
            HookAction::Skip => {
                return Ok(AllocationResult::no_reply(
                    Some(subnet.id),
                    ReasonCode::HookSkip,
                ));
            }
            HookAction::ReplaceAddress(replacement) => replacement,
        };

        let mut lease = Lease::new(
            target,
            claim_subnet_id,
            subnet.negotiate_lifetime(msg.requested_lease_time),
        );
        lease.hw_address = identity.hw.clone();
        lease.client_id = identity.client_id.clone();
        lease.hostname = msg.sanitized_hostname();
        if subnet.stash_agent_options
            && let Some(info) = &msg.relay_info
        {
            lease.stash_relay_info(info)?;
        }

        if !self.leases.try_claim(lease.clone()).await? {
            // a specifically requested address cannot be substituted
            self.stats.increment(
                stats::ALLOCATION_COLLISIONS,
                Some(&stats::subnet_counter(
                    subnet.id,
                    stats::ALLOCATION_COLLISIONS,
                )),
            );
            info!(
                "{} lost the claim race for {}",
                identity.label(),
                target
            );
            return Ok(self.refuse(subnet, ReasonCode::AddressInUse));
        }

        // retire any previous binding the client abandoned by moving here
        if let Some(old) = self.find_owned_lease(snapshot, subnet, identity).await?
            && old.address != target
        {
            self.leases.delete(old.address).await?;
            if let Some(hostname) = old.hostname.clone().filter(|h| !h.is_empty()) {
                self.ddns
                    .enqueue(NameChangeRequest::remove(hostname, old.address));
            }
            debug!(
                "dropped superseded lease {} for {}",
                old.address,
                identity.label()
            );
        }

        if let Some(hostname) = lease.hostname.clone().filter(|h| !h.is_empty()) {
            self.ddns.enqueue(NameChangeRequest::add(hostname, target));
        }
        info!("committed {} to {}", target, identity.label());
        Ok(AllocationResult::granted(
            Outcome::Allocated,
            lease,
            if reserved_for_us {
                ReasonCode::ReservedAddress
            } else {
                ReasonCode::RequestedAddress
            },
            boot_info(reservation.as_ref()),
        ))
    }

    // ---- release and decline -------------------------------------------

    async fn process_release(
        &self,
        snapshot: &ConfigSnapshot,
        msg: &ClientMessage,
        ctx: &RequestContext,
    ) -> Result<AllocationResult> {
        let identity = Identity::of(msg);
        if msg.ciaddr == Ipv4Addr::UNSPECIFIED {
            warn!("RELEASE from {} with no ciaddr", identity.label());
            return Ok(AllocationResult::no_reply(None, ReasonCode::Malformed));
        }

        let match_client_id = snapshot
            .select_subnet(msg.giaddr, ctx.local_addr)
            .map(|subnet| subnet.match_client_id)
            .unwrap_or(true);

        match self.leases.find_by_address(msg.ciaddr).await? {
            Some(lease) if lease_owned_by(&lease, &identity, match_client_id) => {
                let hook_ctx = HookContext {
                    message: msg,
                    subnet_id: Some(lease.subnet_id),
                    candidate: Some(msg.ciaddr),
                    lease: Some(&lease),
                };
                if self.hooks.lease_release(&hook_ctx).await == HookAction::Skip {
                    return Ok(AllocationResult::no_reply(
                        Some(lease.subnet_id),
                        ReasonCode::HookSkip,
                    ));
                }

                self.leases.delete(msg.ciaddr).await?;
                if let Some(hostname) = lease.hostname.clone().filter(|h| !h.is_empty()) {
                    self.ddns
                        .enqueue(NameChangeRequest::remove(hostname, msg.ciaddr));
                }
                info!("released {} from {}", msg.ciaddr, identity.label());
                Ok(AllocationResult::no_reply(
                    Some(lease.subnet_id),
                    ReasonCode::Released,
                ))
            }
            Some(_) => {
                warn!(
                    "RELEASE for {} from {}, who does not own it",
                    msg.ciaddr,
                    identity.label()
                );
                Ok(AllocationResult::no_reply(
                    None,
                    ReasonCode::IdentifierMismatch,
                ))
            }
            None => {
                debug!("RELEASE for unknown lease {}", msg.ciaddr);
                Ok(AllocationResult::no_reply(None, ReasonCode::UnknownClient))
            }
        }
    }

    async fn process_decline(
        &self,
        snapshot: &ConfigSnapshot,
        msg: &ClientMessage,
        ctx: &RequestContext,
    ) -> Result<AllocationResult> {
        let identity = Identity::of(msg);
        let Some(declined_addr) = msg.requested_addr else {
            warn!("DECLINE from {} names no address", identity.label());
            return Ok(AllocationResult::no_reply(None, ReasonCode::Malformed));
        };

        let subnet = snapshot
            .select_subnet(msg.giaddr, ctx.local_addr)
            .cloned();
        let match_client_id = subnet
            .as_ref()
            .map(|s| s.match_client_id)
            .unwrap_or(true);

        let declined_subnet = {
            let existing = self.leases.find_by_address(declined_addr).await?;
            match existing {
                Some(lease) if lease_owned_by(&lease, &identity, match_client_id) => {
                    let hook_ctx = HookContext {
                        message: msg,
                        subnet_id: Some(lease.subnet_id),
                        candidate: Some(declined_addr),
                        lease: Some(&lease),
                    };
                    if self.hooks.lease_decline(&hook_ctx).await == HookAction::Skip {
                        return Ok(AllocationResult::no_reply(
                            Some(lease.subnet_id),
                            ReasonCode::HookSkip,
                        ));
                    }
                    let mut declined = lease;
                    declined.decline(DECLINE_PROBATION_SECONDS);
                    if !self.leases.update(declined.clone()).await? {
                        warn!(
                            "concurrent update while declining {}, probation skipped",
                            declined_addr
                        );
                    }
                    Some(declined.subnet_id)
                }
                Some(_) => {
                    warn!(
                        "DECLINE for {} from {}, who does not own it",
                        declined_addr,
                        identity.label()
                    );
                    return Ok(AllocationResult::no_reply(
                        None,
                        ReasonCode::IdentifierMismatch,
                    ));
                }
                None => {
                    // nothing recorded; still quarantine an in-pool address
                    let Some(subnet) = subnet
                        .as_ref()
                        .and_then(|s| snapshot.pool_subnet_for(s, declined_addr))
                    else {
                        return Ok(AllocationResult::no_reply(
                            None,
                            ReasonCode::AddressOutOfPool,
                        ));
                    };
                    let mut placeholder =
                        Lease::new(declined_addr, subnet.id, DECLINE_PROBATION_SECONDS);
                    placeholder.decline(DECLINE_PROBATION_SECONDS);
                    self.leases.try_claim(placeholder).await?;
                    Some(subnet.id)
                }
            }
        };

        if let Some(subnet_id) = declined_subnet {
            self.stats.increment(
                stats::DECLINED_ADDRESSES,
                Some(&stats::subnet_counter(subnet_id, stats::DECLINED_ADDRESSES)),
            );
            warn!(
                "{} declined {}, sidelined for {} seconds",
                identity.label(),
                declined_addr,
                DECLINE_PROBATION_SECONDS
            );
        }
        Ok(AllocationResult::no_reply(declined_subnet, ReasonCode::Declined))
    }

    // ---- shared plumbing -----------------------------------------------

    /// NAK or silence according to the subnet's authority flag.
    fn refuse(&self, subnet: &Subnet, reason: ReasonCode) -> AllocationResult {
        if subnet.authoritative {
            AllocationResult::nak(Some(subnet.id), reason)
        } else {
            AllocationResult::no_reply(Some(subnet.id), reason)
        }
    }

    /// The reservation applicable to this client on this subnet, with
    /// fail-open error handling and the out-of-pool policy applied.
    async fn applicable_reservation(
        &self,
        subnet: &Subnet,
        identifiers: &[ClientIdentifier],
    ) -> Option<Reservation> {
        if !subnet.reservations_enabled() || identifiers.is_empty() {
            return None;
        }
        match reservation::find_for_client(self.reservations.as_ref(), identifiers, subnet).await
        {
            Ok(found) => found.filter(|res| match res.address {
                Some(addr) => !(subnet.reservations_out_of_pool && subnet.in_pool(addr)),
                None => true,
            }),
            Err(err) => {
                // keep leasing while reservation storage is degraded
                warn!("reservation lookup failed, proceeding unreserved: {}", err);
                self.stats
                    .increment(stats::RESERVATION_LOOKUP_ERRORS, None);
                None
            }
        }
    }

    /// The reservation pinning an address, if one exists and is visible
    /// under the subnet's reservation policy. Fails open like
    /// [`applicable_reservation`](Self::applicable_reservation).
    async fn reservation_on_address(
        &self,
        subnet: &Subnet,
        addr: Ipv4Addr,
    ) -> Option<Reservation> {
        if !subnet.reservations_enabled() {
            return None;
        }
        let lookup = async {
            if subnet.reservations_in_subnet
                && let Some(found) = self
                    .reservations
                    .find_by_address(ReservationScope::Subnet(subnet.id), addr)
                    .await?
            {
                return Ok::<_, Error>(Some(found));
            }
            if subnet.reservations_global
                && let Some(found) = self
                    .reservations
                    .find_by_address(ReservationScope::Global, addr)
                    .await?
            {
                return Ok(Some(found));
            }
            Ok(None)
        };
        match lookup.await {
            Ok(found) => found.filter(|res| match res.address {
                Some(reserved) => {
                    !(subnet.reservations_out_of_pool && subnet.in_pool(reserved))
                }
                None => true,
            }),
            Err(err) => {
                warn!("reservation lookup failed, proceeding unreserved: {}", err);
                self.stats
                    .increment(stats::RESERVATION_LOOKUP_ERRORS, None);
                None
            }
        }
    }

    /// The active lease this identity owns anywhere in the shared network.
    async fn find_owned_lease(
        &self,
        snapshot: &ConfigSnapshot,
        subnet: &Arc<Subnet>,
        identity: &Identity,
    ) -> Result<Option<Lease>> {
        for member in snapshot.allocation_subnets(subnet) {
            if subnet.match_client_id
                && let Some(cid) = &identity.client_id
                && let Some(lease) = self
                    .leases
                    .find_active_by_identifier(member.id, crate::ident::IdentifierKind::ClientId, cid)
                    .await?
                && lease_owned_by(&lease, identity, subnet.match_client_id)
            {
                return Ok(Some(lease));
            }
            if let Some(hw) = &identity.hw
                && let Some(lease) = self
                    .leases
                    .find_active_by_identifier(member.id, crate::ident::IdentifierKind::HwAddress, hw)
                    .await?
                && lease_owned_by(&lease, identity, subnet.match_client_id)
            {
                return Ok(Some(lease));
            }
        }
        Ok(None)
    }

    /// True if a client may take this address: nobody else's reservation,
    /// nobody else's standing lease.
    async fn address_free_for(
        &self,
        pool_subnet: &Arc<Subnet>,
        addr: Ipv4Addr,
        identity: &Identity,
        identifiers: &[ClientIdentifier],
        policy_subnet: &Subnet,
    ) -> Result<bool> {
        if let Some(res) = self.reservation_on_address(pool_subnet, addr).await
            && !res.matches_any(identifiers)
        {
            return Ok(false);
        }
        match self.leases.find_by_address(addr).await? {
            Some(lease)
                if lease.precludes_allocation()
                    && !lease_owned_by(&lease, identity, policy_subnet.match_client_id) =>
            {
                Ok(false)
            }
            _ => Ok(true),
        }
    }

    /// Identifier list for a request, replaying stashed relay options on a
    /// direct unicast renewal so circuit-id-keyed reservations keep
    /// matching after the relay is gone.
    async fn effective_identifiers(
        &self,
        subnet: &Subnet,
        msg: &ClientMessage,
        identity: &Identity,
        state: ClientState,
        target: Ipv4Addr,
    ) -> Result<Vec<ClientIdentifier>> {
        if subnet.stash_agent_options
            && state == ClientState::Renewing
            && msg.relay_info.is_none()
            && !msg.is_relayed()
            && let Some(lease) = self.leases.find_by_address(target).await?
            && lease_owned_by(&lease, identity, subnet.match_client_id)
            && let Some(stash) = lease.stashed_relay_info()
        {
            let mut replayed = msg.clone();
            replayed.relay_info = Some(stash);
            return Ok(ident::resolve(
                &replayed,
                &subnet.host_reservation_identifiers,
            ));
        }
        Ok(ident::resolve(msg, &subnet.host_reservation_identifiers))
    }

    fn count_conflict(&self, subnet: &Subnet) {
        self.stats.increment(
            stats::RESERVATION_CONFLICTS,
            Some(&stats::subnet_counter(
                subnet.id,
                stats::RESERVATION_CONFLICTS,
            )),
        );
    }

    fn count_reuse(&self, subnet: &Subnet) {
        self.stats.increment(
            stats::LEASE_REUSES,
            Some(&stats::subnet_counter(subnet.id, stats::LEASE_REUSES)),
        );
    }
}

fn boot_info(reservation: Option<&Reservation>) -> Option<BootInfo> {
    let res = reservation?;
    let info = BootInfo {
        next_server: res.next_server,
        boot_file_name: res.boot_file_name.clone(),
        server_hostname: res.server_hostname.clone(),
        hostname: res.hostname.clone(),
    };
    (info != BootInfo::default()).then_some(info)
}
