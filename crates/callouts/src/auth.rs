use std::sync::Arc;

use split_core::{Callout, ClassifyEvent, Decision};

use crate::context::EngineContext;

/// Authorization decision: explicit permit for split processes, no opinion
/// otherwise. Never blocks, blocking is the firewall's job.
pub fn auth_decision(included: bool) -> Decision {
    if included {
        Decision::Permit
    } else {
        Decision::Continue
    }
}

/// Attached to the auth-connect and auth-recv-accept layers. The cooperating
/// firewall invokes the same callout keys from its own sublayer, before its
/// default block filter.
pub struct AuthCallout {
    ctx: Arc<EngineContext>,
}

impl AuthCallout {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }
}

impl Callout for AuthCallout {
    fn classify(&self, event: &ClassifyEvent) -> Decision {
        let decision = auth_decision(self.ctx.is_included(&event.process));
        log::trace!("{event}: {decision}");
        decision
    }
}
