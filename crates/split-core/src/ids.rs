//! # Object keys
//!
//! Every object the engine creates inside the host filtering engine is keyed
//! by a fixed 128-bit identifier. The identifiers are constants, never
//! negotiated at runtime, so that external software (the cooperating firewall
//! in particular) can reference them: a firewall filter which invokes the
//! [`CalloutRole::AuthConnect`] callouts lets split traffic bypass its default
//! block rule.
//!
//! The set of roles is closed: provider, sublayer, one callout per
//! (stage, address family) and one filter per callout. [`validate_catalog`]
//! checks at startup that no two roles share a key.

use std::{collections::HashMap, fmt};

use lazy_static::lazy_static;
use serde::{Serialize, Serializer};
use strum::{Display, EnumIter, IntoEnumIterator};
use thiserror::Error;
use uuid::Uuid;

/// A 128-bit host engine object key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey(Uuid);

impl ObjectKey {
    /// Build a key from the classic GUID field layout.
    pub const fn from_fields(d1: u32, d2: u16, d3: u16, d4: [u8; 8]) -> Self {
        Self(Uuid::from_fields(d1, d2, d3, &d4))
    }

    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}", self.0.braced())
    }
}

impl fmt::Debug for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectKey({self})")
    }
}

impl Serialize for ObjectKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Address family of a layer, callout or filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, EnumIter, Display, Serialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    V4,
    V6,
}

/// Socket lifecycle stage a callout is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, EnumIter, Display, Serialize)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum CalloutRole {
    BindRedirect,
    ConnectRedirect,
    AuthConnect,
    AuthRecvAccept,
}

/// A host filtering layer: one application-layer enforcement stage for one
/// address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Layer {
    pub role: CalloutRole,
    pub family: AddressFamily,
}

impl Layer {
    pub const fn new(role: CalloutRole, family: AddressFamily) -> Self {
        Self { role, family }
    }

    /// All the layers the engine attaches to.
    pub fn all() -> impl Iterator<Item = Layer> {
        CalloutRole::iter()
            .flat_map(|role| AddressFamily::iter().map(move |family| Layer::new(role, family)))
    }

    pub fn callout_key(&self) -> ObjectKey {
        KeyRole::Callout(*self).key()
    }

    pub fn filter_key(&self) -> ObjectKey {
        KeyRole::Filter(*self).key()
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ale-{}-{}", self.role, self.family)
    }
}

/// Sublayer owned by the cooperating firewall. It's not ours: we only need to
/// recognize it and make sure we never collide with it.
pub const FIREWALL_SUBLAYER: ObjectKey = ObjectKey::from_fields(
    0xfed0afd4,
    0x98d4,
    0x4233,
    [0xa4, 0xf3, 0x8b, 0x7c, 0x02, 0x44, 0x50, 0x02],
);

pub const PROVIDER: ObjectKey = ObjectKey::from_fields(
    0x1454ebe8,
    0x94fd,
    0x464f,
    [0xb2, 0x3f, 0xb7, 0x41, 0x1c, 0x7a, 0x12, 0x86],
);

pub const SUBLAYER: ObjectKey = ObjectKey::from_fields(
    0xd267063d,
    0xed71,
    0x4b65,
    [0x8c, 0xbd, 0x87, 0x62, 0x96, 0x17, 0x4f, 0x6b],
);

/// Every named role which owns a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyRole {
    Provider,
    Sublayer,
    Callout(Layer),
    Filter(Layer),
}

impl KeyRole {
    /// Iterate the closed set of roles.
    pub fn all() -> impl Iterator<Item = KeyRole> {
        [KeyRole::Provider, KeyRole::Sublayer]
            .into_iter()
            .chain(Layer::all().map(KeyRole::Callout))
            .chain(Layer::all().map(KeyRole::Filter))
    }

    pub fn key(&self) -> ObjectKey {
        use AddressFamily::*;
        use CalloutRole::*;

        match *self {
            KeyRole::Provider => PROVIDER,
            KeyRole::Sublayer => SUBLAYER,
            KeyRole::Callout(Layer { role, family }) => match (role, family) {
                (BindRedirect, V4) => ObjectKey::from_fields(
                    0x409a204b,
                    0x1cb9,
                    0x424a,
                    [0xbf, 0x04, 0xa2, 0x96, 0xc2, 0x20, 0xfe, 0xbd],
                ),
                (ConnectRedirect, V4) => ObjectKey::from_fields(
                    0xfca5543a,
                    0xad22,
                    0x4ddc,
                    [0xb3, 0x2a, 0xca, 0xfb, 0x97, 0x92, 0xa5, 0x17],
                ),
                (BindRedirect, V6) => ObjectKey::from_fields(
                    0x563b569e,
                    0xfe81,
                    0x49b2,
                    [0xbe, 0xfe, 0xf8, 0x39, 0x73, 0xbc, 0x4a, 0xf4],
                ),
                (ConnectRedirect, V6) => ObjectKey::from_fields(
                    0x4612064f,
                    0xf055,
                    0x44f2,
                    [0xaa, 0x59, 0x6a, 0xa1, 0x8e, 0x02, 0xa8, 0x4a],
                ),
                (AuthConnect, V4) => ObjectKey::from_fields(
                    0x100dd8bc,
                    0x5c6c,
                    0x4989,
                    [0x99, 0xcf, 0xeb, 0x93, 0xb1, 0x4a, 0xfa, 0x69],
                ),
                (AuthConnect, V6) => ObjectKey::from_fields(
                    0x7c4e6a94,
                    0x7284,
                    0x4592,
                    [0xb3, 0x94, 0xb3, 0x36, 0x97, 0x70, 0xf3, 0x0d],
                ),
                (AuthRecvAccept, V4) => ObjectKey::from_fields(
                    0xd7fd0b39,
                    0x89fe,
                    0x4e13,
                    [0x9f, 0xe4, 0x52, 0xf9, 0x71, 0x70, 0xf0, 0x98],
                ),
                (AuthRecvAccept, V6) => ObjectKey::from_fields(
                    0x67c57157,
                    0x8a6b,
                    0x4af2,
                    [0x8d, 0xaa, 0x5f, 0x06, 0x37, 0x2f, 0x5d, 0xab],
                ),
            },
            KeyRole::Filter(Layer { role, family }) => match (role, family) {
                (BindRedirect, V4) => ObjectKey::from_fields(
                    0xdc3b8aa4,
                    0xb974,
                    0x4781,
                    [0x8f, 0x3e, 0x1b, 0x10, 0x5c, 0xae, 0x7d, 0x3a],
                ),
                (ConnectRedirect, V4) => ObjectKey::from_fields(
                    0xee0e35e7,
                    0x74ad,
                    0x407a,
                    [0x9f, 0x8b, 0xef, 0x9b, 0xb5, 0x0f, 0x17, 0xc8],
                ),
                (BindRedirect, V6) => ObjectKey::from_fields(
                    0x182e81cd,
                    0xeac4,
                    0x46f9,
                    [0x86, 0x3b, 0x27, 0xbb, 0xb5, 0x19, 0x41, 0xf3],
                ),
                (ConnectRedirect, V6) => ObjectKey::from_fields(
                    0x3d9bc339,
                    0xb1e9,
                    0x44a8,
                    [0xa6, 0xc1, 0x63, 0x21, 0x98, 0x62, 0x16, 0xf0],
                ),
                (AuthConnect, V4) => ObjectKey::from_fields(
                    0x776fc85a,
                    0x4ee0,
                    0x4151,
                    [0xa6, 0xe9, 0x2f, 0xb2, 0x95, 0xa9, 0x29, 0x8d],
                ),
                (AuthConnect, V6) => ObjectKey::from_fields(
                    0x071ae1e7,
                    0xb99e,
                    0x41a3,
                    [0x96, 0xc0, 0x1a, 0x67, 0xfc, 0x2f, 0x6d, 0xb1],
                ),
                (AuthRecvAccept, V4) => ObjectKey::from_fields(
                    0x3be2c346,
                    0x32a1,
                    0x4b5e,
                    [0x8c, 0x35, 0x45, 0x78, 0x6c, 0x63, 0x4c, 0x2d],
                ),
                (AuthRecvAccept, V6) => ObjectKey::from_fields(
                    0xe6dd578d,
                    0x745f,
                    0x4aa4,
                    [0x8a, 0x4a, 0x92, 0x00, 0xeb, 0xaa, 0xea, 0x0f],
                ),
            },
        }
    }
}

impl fmt::Display for KeyRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyRole::Provider => write!(f, "provider"),
            KeyRole::Sublayer => write!(f, "sublayer"),
            KeyRole::Callout(layer) => write!(f, "callout {layer}"),
            KeyRole::Filter(layer) => write!(f, "filter {layer}"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    #[error("key {key} is assigned to both {first} and {second}")]
    DuplicateKey {
        key: ObjectKey,
        first: String,
        second: String,
    },
}

lazy_static! {
    /// `(role, key)` pairs for every role, in a stable order.
    pub static ref CATALOG: Vec<(KeyRole, ObjectKey)> =
        KeyRole::all().map(|role| (role, role.key())).collect();
}

/// Make sure every role has its own key and that none of our keys collides
/// with the cooperating firewall's sublayer.
pub fn validate_catalog() -> Result<(), CatalogError> {
    let mut seen: HashMap<ObjectKey, String> = HashMap::new();
    seen.insert(FIREWALL_SUBLAYER, "firewall sublayer".to_string());
    for (role, key) in CATALOG.iter() {
        if let Some(first) = seen.insert(*key, role.to_string()) {
            return Err(CatalogError::DuplicateKey {
                key: *key,
                first,
                second: role.to_string(),
            });
        }
    }
    Ok(())
}
