//! Split tunnel engine lifecycle.
//!
//! Registration order is namespace (provider, sublayer), callouts, filters.
//! Teardown goes the other way around. Every group is created in a single
//! host transaction, so the host never sees half of a group.

mod config;
mod engine;
mod error;
mod filters;
mod namespace;
mod registry;
mod transaction;

pub use config::EngineConfig;
pub use engine::{EngineStatus, SplitTunnelEngine};
pub use error::EngineError;
pub use filters::{
    DEFAULT_FILTER_WEIGHT, FilterManager, FilterSet, FilterSetBuilder, FilterSpec,
    FilterTransaction,
};
pub use namespace::{DEFAULT_SUBLAYER_WEIGHT, NamespaceIdentity, PROVIDER_NAME, SUBLAYER_NAME};
pub use registry::{register_callouts, unregister_callouts};
