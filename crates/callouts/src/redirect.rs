//! Bind and connect redirection.
//!
//! A split process must leave through the physical interface. Two stages
//! take care of it:
//! - at bind time, a wildcard or tunnel local address is replaced with the
//!   physical address of the same family
//! - at connect time, a route through the tunnel is replaced with the
//!   physical interface. Inclusion is checked again: the process may have
//!   been reclassified since bind.
//!
//! With the VPN connected, a family whose physical side is unknown is
//! blocked: the flow would otherwise silently use the tunnel. With the VPN
//! disconnected there is nothing to split.

use std::sync::Arc;

use split_core::{
    Callout, ClassifyContext, ClassifyEvent, Decision, InterfaceBinding, RedirectTarget,
    event::is_local_scope,
};

use crate::context::EngineContext;

/// Bind stage decision for a process whose inclusion is `included`.
pub fn bind_decision(event: &ClassifyEvent, included: bool, binding: &InterfaceBinding) -> Decision {
    let ClassifyContext::Bind { local } = event.context else {
        return Decision::Continue;
    };
    if !included || !binding.vpn_connected || is_local_scope(&local.ip()) {
        return Decision::Continue;
    }
    let family = event.layer.family;
    if !local.ip().is_unspecified() && Some(local.ip()) != binding.tunnel_address(family) {
        // Explicitly bound elsewhere
        return Decision::Continue;
    }
    match binding.physical_address(family) {
        Some(physical) => Decision::Redirect(RedirectTarget::LocalAddress(physical)),
        None => Decision::Block,
    }
}

/// Connect stage decision for a process whose inclusion is `included`.
pub fn connect_decision(
    event: &ClassifyEvent,
    included: bool,
    binding: &InterfaceBinding,
) -> Decision {
    let ClassifyContext::Connect {
        local,
        remote,
        interface,
    } = event.context
    else {
        return Decision::Continue;
    };
    if !included || !binding.vpn_connected || is_local_scope(&remote.ip()) {
        return Decision::Continue;
    }
    let family = event.layer.family;
    let Some(physical) = binding.physical_address(family) else {
        return Decision::Block;
    };
    let through_tunnel = match interface {
        // Unresolved route: the tunnel owns the default route, unless the
        // socket is already bound to the physical address.
        None => local.ip() != physical,
        Some(index) if Some(index) == binding.tunnel_interface => true,
        Some(_) => Some(local.ip()) == binding.tunnel_address(family),
    };
    if !through_tunnel {
        return Decision::Continue;
    }
    match binding.physical_interface {
        Some(index) => Decision::Redirect(RedirectTarget::Interface {
            index,
            local_address: physical,
        }),
        None => Decision::Block,
    }
}

/// Invokes `decide` with the current classification and binding, and
/// records blocks caused by a missing physical binding.
fn classify_with(
    ctx: &EngineContext,
    event: &ClassifyEvent,
    decide: fn(&ClassifyEvent, bool, &InterfaceBinding) -> Decision,
) -> Decision {
    let included = ctx.is_included(&event.process);
    let decision = decide(event, included, &ctx.binding());
    if decision.is_block() {
        ctx.mark_degraded(event.layer.family);
    }
    if included {
        log::trace!("{event}: {decision}");
    }
    decision
}

pub struct BindRedirectCallout {
    ctx: Arc<EngineContext>,
}

impl BindRedirectCallout {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }
}

impl Callout for BindRedirectCallout {
    fn classify(&self, event: &ClassifyEvent) -> Decision {
        classify_with(&self.ctx, event, bind_decision)
    }
}

pub struct ConnectRedirectCallout {
    ctx: Arc<EngineContext>,
}

impl ConnectRedirectCallout {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }
}

impl Callout for ConnectRedirectCallout {
    fn classify(&self, event: &ClassifyEvent) -> Decision {
        classify_with(&self.ctx, event, connect_decision)
    }
}
