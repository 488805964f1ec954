//! Classify functions invoked by the host filtering engine.
//!
//! Every callout is a thin wrapper around a pure decision function of
//! (event, classification, binding); the wrappers only fetch the current
//! classification and binding from the [`EngineContext`].

mod auth;
mod context;
mod redirect;

use std::sync::Arc;

pub use auth::{AuthCallout, auth_decision};
pub use context::EngineContext;
pub use redirect::{BindRedirectCallout, ConnectRedirectCallout, bind_decision, connect_decision};
use split_core::{Callout, CalloutRole, Layer};

/// The callout to register at `layer`.
pub fn callout_for(layer: Layer, ctx: Arc<EngineContext>) -> Arc<dyn Callout> {
    match layer.role {
        CalloutRole::BindRedirect => Arc::new(BindRedirectCallout::new(ctx)),
        CalloutRole::ConnectRedirect => Arc::new(ConnectRedirectCallout::new(ctx)),
        CalloutRole::AuthConnect | CalloutRole::AuthRecvAccept => Arc::new(AuthCallout::new(ctx)),
    }
}
