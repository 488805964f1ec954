//! Interface to the host's in-kernel filtering engine.
//!
//! The engine exposes management objects (providers, sublayers, callouts and
//! filters) keyed by fixed 128-bit identifiers. Changes can be grouped in a
//! transaction which is applied atomically on commit or discarded on abort.
//!
//! [`SimulatedEngine`] is an in-memory host which also delivers classify
//! events to the registered callouts and arbitrates their decisions.

mod error;
mod objects;
mod simulated;
#[cfg(feature = "test-utils")]
pub mod test_utils;

use std::sync::Arc;

pub use error::HostError;
pub use objects::{CalloutRegistration, Condition, Filter, FilterAction, Provider, Sublayer};
pub use simulated::{SimulatedEngine, Verdict, VerdictAction};
use split_core::{Callout, ObjectKey};

/// Management API of the host filtering engine.
///
/// Calls made between [`HostEngine::begin_transaction`] and
/// [`HostEngine::commit_transaction`] become visible to classification only
/// on commit. Only one transaction at a time is supported.
pub trait HostEngine: Send + Sync {
    /// Open the filtering subsystem. Fails if it's not available.
    fn open(&self) -> Result<(), HostError>;

    fn begin_transaction(&self) -> Result<(), HostError>;
    fn commit_transaction(&self) -> Result<(), HostError>;
    fn abort_transaction(&self) -> Result<(), HostError>;

    fn add_provider(&self, provider: &Provider) -> Result<(), HostError>;
    fn get_provider(&self, key: ObjectKey) -> Result<Option<Provider>, HostError>;
    fn delete_provider(&self, key: ObjectKey) -> Result<(), HostError>;

    fn add_sublayer(&self, sublayer: &Sublayer) -> Result<(), HostError>;
    fn get_sublayer(&self, key: ObjectKey) -> Result<Option<Sublayer>, HostError>;
    fn delete_sublayer(&self, key: ObjectKey) -> Result<(), HostError>;

    fn register_callout(
        &self,
        registration: &CalloutRegistration,
        callout: Arc<dyn Callout>,
    ) -> Result<(), HostError>;
    fn unregister_callout(&self, key: ObjectKey) -> Result<(), HostError>;
    fn callouts_by_provider(&self, provider: ObjectKey)
    -> Result<Vec<CalloutRegistration>, HostError>;

    fn add_filter(&self, filter: &Filter) -> Result<(), HostError>;
    fn delete_filter(&self, key: ObjectKey) -> Result<(), HostError>;
    fn filters_by_provider(&self, provider: ObjectKey) -> Result<Vec<Filter>, HostError>;
}
