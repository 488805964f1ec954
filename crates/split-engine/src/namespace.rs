//! Provider and sublayer registration.
//!
//! All the engine objects live under our provider, and all our filters in
//! our sublayer. The namespace is created before anything else and removed
//! last.

use host_engine::{HostEngine, HostError, Provider, Sublayer};
use serde::Serialize;
use split_core::{
    ObjectKey,
    ids::{PROVIDER, SUBLAYER},
};

use crate::{error::EngineError, transaction::in_transaction};

pub const PROVIDER_NAME: &str = "Split Tunnel";
pub const SUBLAYER_NAME: &str = "Split Tunnel filters";

/// Sublayers are evaluated in weight order: ours goes before most others.
pub const DEFAULT_SUBLAYER_WEIGHT: u16 = 0xfffe;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NamespaceIdentity {
    pub provider: ObjectKey,
    pub sublayer: ObjectKey,
    pub sublayer_weight: u16,
}

impl Default for NamespaceIdentity {
    fn default() -> Self {
        Self {
            provider: PROVIDER,
            sublayer: SUBLAYER,
            sublayer_weight: DEFAULT_SUBLAYER_WEIGHT,
        }
    }
}

impl NamespaceIdentity {
    fn provider_object(&self) -> Provider {
        Provider {
            key: self.provider,
            name: PROVIDER_NAME.to_string(),
        }
    }

    fn sublayer_object(&self) -> Sublayer {
        Sublayer {
            key: self.sublayer,
            name: SUBLAYER_NAME.to_string(),
            provider: Some(self.provider),
            weight: self.sublayer_weight,
        }
    }

    /// Create provider and sublayer, reusing compatible leftovers.
    pub fn activate(&self, host: &dyn HostEngine) -> Result<(), EngineError> {
        host.open().map_err(EngineError::EngineUnavailable)?;
        in_transaction(host, || {
            match host.get_provider(self.provider)? {
                None => host.add_provider(&self.provider_object())?,
                Some(provider) if provider.name == PROVIDER_NAME => {
                    log::debug!("reusing provider {}", self.provider)
                }
                Some(provider) => {
                    return Err(EngineError::ConflictingNamespace {
                        key: self.provider,
                        found: provider.name,
                    });
                }
            }
            match host.get_sublayer(self.sublayer)? {
                None => host.add_sublayer(&self.sublayer_object())?,
                Some(sublayer)
                    if sublayer.name == SUBLAYER_NAME && sublayer.provider == Some(self.provider) =>
                {
                    if sublayer.weight != self.sublayer_weight {
                        log::warn!(
                            "reusing sublayer {} with weight {:#x} instead of {:#x}",
                            self.sublayer,
                            sublayer.weight,
                            self.sublayer_weight
                        );
                    }
                }
                Some(sublayer) => {
                    return Err(EngineError::ConflictingNamespace {
                        key: self.sublayer,
                        found: sublayer.name,
                    });
                }
            }
            Ok(())
        })?;
        log::info!("namespace {} activated", self.provider);
        Ok(())
    }

    /// Remove sublayer then provider. Succeeds if they're already gone.
    pub fn deactivate(&self, host: &dyn HostEngine) -> Result<(), EngineError> {
        host.open().map_err(EngineError::EngineUnavailable)?;

        let mut keys: Vec<ObjectKey> = host
            .filters_by_provider(self.provider)?
            .into_iter()
            .map(|filter| filter.key)
            .collect();
        keys.extend(
            host.callouts_by_provider(self.provider)?
                .into_iter()
                .map(|callout| callout.key),
        );
        if !keys.is_empty() {
            return Err(EngineError::ObjectsStillRegistered { keys });
        }

        in_transaction(host, || {
            match host.get_sublayer(self.sublayer)? {
                Some(sublayer) if sublayer.provider == Some(self.provider) => {
                    tolerate_absent(host.delete_sublayer(self.sublayer))?
                }
                Some(_) => log::warn!("sublayer {} is not ours, leaving it", self.sublayer),
                None => {}
            }
            match host.get_provider(self.provider)? {
                Some(provider) if provider.name == PROVIDER_NAME => {
                    tolerate_absent(host.delete_provider(self.provider))?
                }
                Some(_) => log::warn!("provider {} is not ours, leaving it", self.provider),
                None => {}
            }
            Ok(())
        })?;
        log::info!("namespace {} deactivated", self.provider);
        Ok(())
    }
}

fn tolerate_absent(result: Result<(), HostError>) -> Result<(), HostError> {
    match result {
        Err(err) if err.is_not_found() => Ok(()),
        result => result,
    }
}
