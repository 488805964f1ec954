use host_engine::HostError;
use split_core::{AddressFamily, ObjectKey, ids::CatalogError};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("filtering engine unavailable")]
    EngineUnavailable(#[source] HostError),
    #[error("object {key} is already registered by someone else ({found})")]
    ConflictingNamespace { key: ObjectKey, found: String },
    #[error("applying filter {filter} failed")]
    FilterApplyFailed {
        filter: ObjectKey,
        #[source]
        source: HostError,
    },
    #[error("no physical interface binding for {}", display_families(.families))]
    MissingPhysicalBinding { families: Vec<AddressFamily> },
    #[error("objects still registered under the namespace: {}", display_keys(.keys))]
    ObjectsStillRegistered { keys: Vec<ObjectKey> },
    #[error("invalid object key catalog")]
    Catalog(#[from] CatalogError),
    #[error("host engine request failed")]
    Host(#[from] HostError),
}

fn display_families(families: &[AddressFamily]) -> String {
    families
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn display_keys(keys: &[ObjectKey]) -> String {
    keys.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
