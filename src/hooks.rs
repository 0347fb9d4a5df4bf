//! Extension points in the allocation state machine.
//!
//! Hook implementations live outside this core. The engine invokes them
//! synchronously at defined points and checks the returned action after
//! every callout: a hook may let processing continue, veto the default
//! action, or substitute the candidate address.

use std::net::Ipv4Addr;

use async_trait::async_trait;

use crate::config::SubnetId;
use crate::lease::Lease;
use crate::packet::ClientMessage;

/// What a hook decided about the action it was consulted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookAction {
    /// Proceed with the default behavior.
    Continue,
    /// Veto: the engine drops the default action and sends no reply.
    Skip,
    /// Use this address instead of the engine's candidate.
    ReplaceAddress(Ipv4Addr),
}

/// Context handed to every callout.
#[derive(Debug)]
pub struct HookContext<'a> {
    /// The message being processed.
    pub message: &'a ClientMessage,
    /// Subnet the engine resolved, when one was.
    pub subnet_id: Option<SubnetId>,
    /// Candidate address about to be acted on.
    pub candidate: Option<Ipv4Addr>,
    /// Existing lease involved in the action, if any.
    pub lease: Option<&'a Lease>,
}

/// The set of callout points. Every method defaults to [`HookAction::Continue`],
/// so implementations override only the points they care about.
#[async_trait]
pub trait Hooks: Send + Sync {
    /// Before committing a newly selected lease (offer or fresh claim).
    async fn lease_select(&self, _ctx: &HookContext<'_>) -> HookAction {
        HookAction::Continue
    }

    /// Before extending an existing lease.
    async fn lease_renew(&self, _ctx: &HookContext<'_>) -> HookAction {
        HookAction::Continue
    }

    /// Before deleting a released lease.
    async fn lease_release(&self, _ctx: &HookContext<'_>) -> HookAction {
        HookAction::Continue
    }

    /// Before putting a declined address into probation.
    async fn lease_decline(&self, _ctx: &HookContext<'_>) -> HookAction {
        HookAction::Continue
    }
}

/// Hooks implementation that never intervenes.
#[derive(Debug, Default)]
pub struct NoopHooks;

#[async_trait]
impl Hooks for NoopHooks {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::MessageKind;

    #[tokio::test]
    async fn test_noop_hooks_always_continue() {
        let msg = ClientMessage::new(MessageKind::Discover, 1);
        let ctx = HookContext {
            message: &msg,
            subnet_id: Some(1),
            candidate: None,
            lease: None,
        };
        let hooks = NoopHooks;
        assert_eq!(hooks.lease_select(&ctx).await, HookAction::Continue);
        assert_eq!(hooks.lease_renew(&ctx).await, HookAction::Continue);
        assert_eq!(hooks.lease_release(&ctx).await, HookAction::Continue);
        assert_eq!(hooks.lease_decline(&ctx).await, HookAction::Continue);
    }
}
