//! Fault injection and a cooperating firewall for tests.

use std::net::IpAddr;

use split_core::{AddressFamily, CalloutRole, Layer, ObjectKey, ids::FIREWALL_SUBLAYER};

use crate::{
    Condition, Filter, FilterAction, HostEngine, HostError, Provider, SimulatedEngine, Sublayer,
};

pub const FIREWALL_PROVIDER: ObjectKey = ObjectKey::from_fields(
    0xfed0afd4,
    0x98d4,
    0x4233,
    [0xa4, 0xf3, 0x8b, 0x7c, 0x02, 0x44, 0x50, 0x01],
);

/// Weight of the firewall sublayer: below the split tunnel one.
pub const FIREWALL_WEIGHT: u16 = 0x1000;

impl SimulatedEngine {
    /// Make [`HostEngine::open`] fail.
    pub fn set_unavailable(&self, reason: &str) {
        self.lock_faults().unavailable = Some(reason.to_string());
    }

    /// Make every addition of the filter `key` fail.
    pub fn reject_filter(&self, key: ObjectKey) {
        self.lock_faults().rejected_filters.insert(key);
    }

    pub fn clear_faults(&self) {
        let mut faults = self.lock_faults();
        faults.unavailable = None;
        faults.rejected_filters.clear();
    }
}

/// Install a default-deny firewall in its own sublayer.
///
/// At every authorization layer:
/// - traffic sourced from a tunnel address is permitted
/// - the split tunnel authorization callout of that layer is asked next
/// - everything else is blocked
pub fn install_firewall(
    engine: &SimulatedEngine,
    tunnel_addresses: &[IpAddr],
) -> Result<(), HostError> {
    engine.begin_transaction()?;
    match add_firewall_objects(engine, tunnel_addresses) {
        Ok(()) => engine.commit_transaction(),
        Err(err) => {
            engine.abort_transaction()?;
            Err(err)
        }
    }
}

fn add_firewall_objects(
    engine: &SimulatedEngine,
    tunnel_addresses: &[IpAddr],
) -> Result<(), HostError> {
    engine.add_provider(&Provider {
        key: FIREWALL_PROVIDER,
        name: "Default deny firewall".to_string(),
    })?;
    engine.add_sublayer(&Sublayer {
        key: FIREWALL_SUBLAYER,
        name: "Default deny firewall".to_string(),
        provider: Some(FIREWALL_PROVIDER),
        weight: FIREWALL_WEIGHT,
    })?;

    let mut n = 0;
    for role in [CalloutRole::AuthConnect, CalloutRole::AuthRecvAccept] {
        for family in [AddressFamily::V4, AddressFamily::V6] {
            let layer = Layer::new(role, family);
            for (weight, conditions, action) in [
                (
                    20,
                    vec![Condition::LocalAddress(tunnel_addresses.to_vec())],
                    FilterAction::Permit,
                ),
                (10, vec![], FilterAction::Callout(layer.callout_key())),
                (0, vec![], FilterAction::Block),
            ] {
                n += 1;
                engine.add_filter(&Filter {
                    key: ObjectKey::from_fields(0xfed0afd4, 0x98d4, n, [0xff; 8]),
                    name: format!("firewall {layer} #{n}"),
                    layer,
                    sublayer: FIREWALL_SUBLAYER,
                    provider: Some(FIREWALL_PROVIDER),
                    weight,
                    conditions,
                    action,
                })?;
            }
        }
    }
    Ok(())
}
