use std::{fmt, net::IpAddr};

use serde::Serialize;

/// Outcome of a callout invocation.
///
/// Callouts are pure functions of (event, classification, binding) returning
/// one of these; applying the outcome to the flow is up to the host engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Decision {
    /// Explicitly allow the flow. Overrides lower-priority default blocks.
    Permit,
    /// Drop the flow.
    Block,
    /// No opinion: let the next filter decide.
    Continue,
    /// Allow the flow after rewriting its local binding or route.
    Redirect(RedirectTarget),
}

impl Decision {
    pub fn is_block(&self) -> bool {
        matches!(self, Decision::Block)
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Permit => write!(f, "permit"),
            Decision::Block => write!(f, "block"),
            Decision::Continue => write!(f, "continue"),
            Decision::Redirect(target) => write!(f, "redirect({target})"),
        }
    }
}

/// What a redirect callout rewrites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RedirectTarget {
    /// Bind stage: replace the socket local address.
    LocalAddress(IpAddr),
    /// Connect stage: force the outbound route through `interface`, sourcing
    /// from `local_address`.
    Interface { index: u32, local_address: IpAddr },
}

impl fmt::Display for RedirectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RedirectTarget::LocalAddress(address) => write!(f, "local {address}"),
            RedirectTarget::Interface {
                index,
                local_address,
            } => write!(f, "interface {index} via {local_address}"),
        }
    }
}
