//! Classify events delivered by the host engine to the callouts.

use std::{
    fmt,
    net::{IpAddr, SocketAddr},
};

use serde::Serialize;

use crate::ids::{AddressFamily, CalloutRole, Layer};

/// Process identifier as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Pid(u32);

impl Pid {
    pub const fn from_raw(pid: u32) -> Self {
        Self(pid)
    }

    pub const fn as_raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The process owning the socket. `path` is resolved by the host, not by us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessIdentity {
    pub pid: Pid,
    pub path: String,
}

impl ProcessIdentity {
    pub fn new(pid: u32, path: impl Into<String>) -> Self {
        Self {
            pid: Pid::from_raw(pid),
            path: path.into(),
        }
    }
}

/// Layer specific part of a classify event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassifyContext {
    /// `bind()`: the local address the socket is about to use.
    /// An unspecified IP means "let the stack choose".
    Bind { local: SocketAddr },
    /// `connect()` after bind: local address, destination and the interface
    /// the stack has selected for the route, if resolved already.
    Connect {
        local: SocketAddr,
        remote: SocketAddr,
        interface: Option<u32>,
    },
    /// Flow authorization (outbound connect or inbound accept).
    Flow { local: SocketAddr, remote: SocketAddr },
}

impl ClassifyContext {
    /// The remote side, if the stage has one.
    pub fn remote(&self) -> Option<SocketAddr> {
        match self {
            ClassifyContext::Bind { .. } => None,
            ClassifyContext::Connect { remote, .. } | ClassifyContext::Flow { remote, .. } => {
                Some(*remote)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifyEvent {
    pub layer: Layer,
    pub process: ProcessIdentity,
    pub context: ClassifyContext,
}

impl ClassifyEvent {
    pub fn bind(process: ProcessIdentity, local: SocketAddr) -> Self {
        Self {
            layer: Layer::new(CalloutRole::BindRedirect, family_of(&local.ip())),
            process,
            context: ClassifyContext::Bind { local },
        }
    }

    pub fn connect(
        process: ProcessIdentity,
        local: SocketAddr,
        remote: SocketAddr,
        interface: Option<u32>,
    ) -> Self {
        Self {
            layer: Layer::new(CalloutRole::ConnectRedirect, family_of(&remote.ip())),
            process,
            context: ClassifyContext::Connect {
                local,
                remote,
                interface,
            },
        }
    }

    pub fn auth_connect(process: ProcessIdentity, local: SocketAddr, remote: SocketAddr) -> Self {
        Self::flow(CalloutRole::AuthConnect, process, local, remote)
    }

    pub fn auth_recv_accept(
        process: ProcessIdentity,
        local: SocketAddr,
        remote: SocketAddr,
    ) -> Self {
        Self::flow(CalloutRole::AuthRecvAccept, process, local, remote)
    }

    fn flow(
        role: CalloutRole,
        process: ProcessIdentity,
        local: SocketAddr,
        remote: SocketAddr,
    ) -> Self {
        Self {
            layer: Layer::new(role, family_of(&remote.ip())),
            process,
            context: ClassifyContext::Flow { local, remote },
        }
    }
}

impl fmt::Display for ClassifyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ClassifyEvent {
            layer, process, ..
        } = self;
        write!(f, "{layer} [{}:{}]", process.pid, process.path)?;
        match &self.context {
            ClassifyContext::Bind { local } => write!(f, " bind {local}"),
            ClassifyContext::Connect {
                local,
                remote,
                interface,
            } => write!(f, " {local} -> {remote} (if {interface:?})"),
            ClassifyContext::Flow { local, remote } => write!(f, " {local} <-> {remote}"),
        }
    }
}

pub fn family_of(ip: &IpAddr) -> AddressFamily {
    match ip {
        IpAddr::V4(_) => AddressFamily::V4,
        IpAddr::V6(_) => AddressFamily::V6,
    }
}

/// Loopback and link-local traffic never leaves the host's local segment,
/// redirecting it is never correct.
pub fn is_local_scope(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_local_scope(&IpAddr::V4(v4)),
            None => v6.is_loopback() || v6.is_unicast_link_local(),
        },
    }
}
