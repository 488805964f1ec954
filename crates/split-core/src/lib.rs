//! Shared vocabulary of the split tunnel engine: fixed object keys, classify
//! events, callout decisions, executable paths and the interface binding
//! callouts read from.

pub mod binding;
pub mod config;
pub mod decision;
pub mod event;
pub mod ids;
pub mod path;

pub use binding::{BindingCell, InterfaceBinding};
pub use config::{ConfigError, SectionConfig};
pub use decision::{Decision, RedirectTarget};
pub use event::{ClassifyContext, ClassifyEvent, Pid, ProcessIdentity};
pub use ids::{AddressFamily, CalloutRole, KeyRole, Layer, ObjectKey};
pub use path::{EmptyPath, ImagePath};

/// Classify function registered with the host engine under a callout key.
///
/// Implementations run on arbitrary threads, concurrently, while the host
/// is processing a socket operation: they must not block and must not call
/// back into the host engine.
pub trait Callout: Send + Sync {
    fn classify(&self, event: &ClassifyEvent) -> Decision;
}

impl<F> Callout for F
where
    F: Fn(&ClassifyEvent) -> Decision + Send + Sync,
{
    fn classify(&self, event: &ClassifyEvent) -> Decision {
        self(event)
    }
}

/// Utility function to pretty print an error with its sources.
///
/// By default Rust won't print the source of an error message, anyhow is
/// used as an error pretty-printer.
pub fn log_error<E: std::error::Error + Send + Sync + 'static>(msg: &str, err: E) {
    log::error!("{}: {:?}", msg, anyhow::Error::from(err));
}
