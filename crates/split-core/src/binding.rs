use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    sync::{Arc, PoisonError, RwLock},
};

use serde::Serialize;

use crate::ids::AddressFamily;

/// Where split traffic must egress, and what the tunnel looks like.
///
/// With the VPN connected, a family without a physical address cannot carry
/// split traffic: included processes get blocked for that family rather than
/// leak through the tunnel. With the VPN disconnected there is nothing to
/// split and every flow passes through untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InterfaceBinding {
    /// Set by the engine when the binding is published.
    pub vpn_connected: bool,
    pub tunnel_interface: Option<u32>,
    pub physical_interface: Option<u32>,
    pub ipv4_physical: Option<Ipv4Addr>,
    pub ipv6_physical: Option<Ipv6Addr>,
    pub ipv4_tunnel: Option<Ipv4Addr>,
    pub ipv6_tunnel: Option<Ipv6Addr>,
}

impl InterfaceBinding {
    pub fn physical_address(&self, family: AddressFamily) -> Option<IpAddr> {
        match family {
            AddressFamily::V4 => self.ipv4_physical.map(IpAddr::V4),
            AddressFamily::V6 => self.ipv6_physical.map(IpAddr::V6),
        }
    }

    pub fn tunnel_address(&self, family: AddressFamily) -> Option<IpAddr> {
        match family {
            AddressFamily::V4 => self.ipv4_tunnel.map(IpAddr::V4),
            AddressFamily::V6 => self.ipv6_tunnel.map(IpAddr::V6),
        }
    }

    /// Same binding with the tunnel part cleared (VPN disconnected).
    pub fn without_tunnel(self) -> Self {
        Self {
            vpn_connected: false,
            tunnel_interface: None,
            ipv4_tunnel: None,
            ipv6_tunnel: None,
            ..self
        }
    }
}

/// Atomically published [`InterfaceBinding`].
///
/// Readers get a consistent snapshot: they see the whole old binding or the
/// whole new one, never a mix of v4 and v6 fields. The lock is held only for
/// the duration of an `Arc` clone or pointer swap.
#[derive(Debug, Default)]
pub struct BindingCell {
    current: RwLock<Arc<InterfaceBinding>>,
}

impl BindingCell {
    pub fn new(binding: InterfaceBinding) -> Self {
        Self {
            current: RwLock::new(Arc::new(binding)),
        }
    }

    pub fn load(&self) -> Arc<InterfaceBinding> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Publish a new binding, returning the previous one.
    pub fn publish(&self, binding: InterfaceBinding) -> Arc<InterfaceBinding> {
        let binding = Arc::new(binding);
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *current, binding)
    }
}
