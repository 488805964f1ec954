//! Filter registrations.
//!
//! The filters installed in the host are described by a [`FilterSet`]. A
//! change of desired set is turned into a [`FilterTransaction`] (stage) and
//! applied to the host all at once (commit): either the whole new set is in
//! place, or the previous one is left untouched.

use std::collections::BTreeMap;

use host_engine::{Condition, Filter, FilterAction, HostEngine};
use serde::Serialize;
use split_core::{Layer, ObjectKey};

use crate::{error::EngineError, namespace::NamespaceIdentity, transaction::in_transaction};

pub const DEFAULT_FILTER_WEIGHT: u16 = 0x0f;

/// A callout-backed filter restricted to the split processes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FilterSpec {
    pub layer: Layer,
    pub weight: u16,
    pub apps: Vec<String>,
}

impl FilterSpec {
    pub fn key(&self) -> ObjectKey {
        self.layer.filter_key()
    }

    pub fn callout_key(&self) -> ObjectKey {
        self.layer.callout_key()
    }

    fn to_filter(&self, namespace: &NamespaceIdentity) -> Filter {
        Filter {
            key: self.key(),
            name: format!("Split tunnel {}", self.layer),
            layer: self.layer,
            sublayer: namespace.sublayer,
            provider: Some(namespace.provider),
            weight: self.weight,
            conditions: vec![Condition::AppPath(self.apps.clone())],
            action: FilterAction::Callout(self.callout_key()),
        }
    }
}

/// Desired (or installed) filters, keyed by filter key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterSet {
    filters: BTreeMap<ObjectKey, FilterSpec>,
}

impl FilterSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn builder() -> FilterSetBuilder {
        FilterSetBuilder::default()
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn get(&self, key: &ObjectKey) -> Option<&FilterSpec> {
        self.filters.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FilterSpec> {
        self.filters.values()
    }

    pub fn keys(&self) -> impl Iterator<Item = ObjectKey> + '_ {
        self.filters.keys().copied()
    }
}

#[derive(Debug, Clone)]
pub struct FilterSetBuilder {
    apps: Vec<String>,
    weight: u16,
    layers: Vec<Layer>,
}

impl Default for FilterSetBuilder {
    fn default() -> Self {
        Self {
            apps: Vec::new(),
            weight: DEFAULT_FILTER_WEIGHT,
            layers: Vec::new(),
        }
    }
}

impl FilterSetBuilder {
    pub fn apps<I, S>(mut self, apps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.apps.extend(apps.into_iter().map(Into::into));
        self
    }

    pub fn weight(mut self, weight: u16) -> Self {
        self.weight = weight;
        self
    }

    pub fn layer(mut self, layer: Layer) -> Self {
        self.layers.push(layer);
        self
    }

    pub fn all_layers(mut self) -> Self {
        self.layers.extend(Layer::all());
        self
    }

    /// A set without applications would match nothing: it's empty.
    pub fn build(self) -> FilterSet {
        let FilterSetBuilder {
            mut apps,
            weight,
            layers,
        } = self;
        if apps.is_empty() {
            return FilterSet::empty();
        }
        apps.sort();
        apps.dedup();
        let filters = layers
            .into_iter()
            .map(|layer| {
                let spec = FilterSpec {
                    layer,
                    weight,
                    apps: apps.clone(),
                };
                (spec.key(), spec)
            })
            .collect();
        FilterSet { filters }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum FilterOp {
    Add(Filter),
    Delete(ObjectKey),
}

impl FilterOp {
    fn key(&self) -> ObjectKey {
        match self {
            FilterOp::Add(filter) => filter.key,
            FilterOp::Delete(key) => *key,
        }
    }
}

/// Staged filter changes, applied by [`FilterTransaction::commit`].
#[derive(Debug, Clone, Default)]
pub struct FilterTransaction {
    ops: Vec<FilterOp>,
}

impl FilterTransaction {
    /// Compute the operations turning `installed` into `desired`. Changed
    /// filters are deleted and added back under the same key.
    pub fn stage(
        installed: &FilterSet,
        desired: &FilterSet,
        namespace: &NamespaceIdentity,
    ) -> Self {
        let deletions = installed
            .iter()
            .filter(|spec| desired.get(&spec.key()) != Some(*spec))
            .map(|spec| FilterOp::Delete(spec.key()));
        let additions = desired
            .iter()
            .filter(|spec| installed.get(&spec.key()) != Some(*spec))
            .map(|spec| FilterOp::Add(spec.to_filter(namespace)));
        Self {
            ops: deletions.chain(additions).collect(),
        }
    }

    /// Delete every filter in `keys`.
    pub fn teardown(keys: impl IntoIterator<Item = ObjectKey>) -> Self {
        Self {
            ops: keys.into_iter().map(FilterOp::Delete).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Apply all the staged operations in one host transaction.
    pub fn commit(self, host: &dyn HostEngine) -> Result<(), EngineError> {
        if self.ops.is_empty() {
            return Ok(());
        }
        in_transaction(host, || {
            for op in &self.ops {
                let result = match op {
                    FilterOp::Add(filter) => host.add_filter(filter),
                    FilterOp::Delete(key) => host.delete_filter(*key),
                };
                result.map_err(|source| EngineError::FilterApplyFailed {
                    filter: op.key(),
                    source,
                })?;
            }
            Ok(())
        })
    }
}

/// Keeps track of the filter set installed in the host.
#[derive(Debug, Default)]
pub struct FilterManager {
    namespace: NamespaceIdentity,
    installed: FilterSet,
}

impl FilterManager {
    pub fn new(namespace: NamespaceIdentity) -> Self {
        Self {
            namespace,
            installed: FilterSet::empty(),
        }
    }

    pub fn installed(&self) -> &FilterSet {
        &self.installed
    }

    /// Make the host filters match `desired`. On failure nothing changes.
    pub fn apply_filter_set(
        &mut self,
        host: &dyn HostEngine,
        desired: FilterSet,
    ) -> Result<(), EngineError> {
        let transaction = FilterTransaction::stage(&self.installed, &desired, &self.namespace);
        if transaction.is_empty() {
            return Ok(());
        }
        let changes = transaction.len();
        transaction.commit(host)?;
        log::debug!(
            "filter set applied ({changes} changes, {} filters)",
            desired.len()
        );
        self.installed = desired;
        Ok(())
    }

    /// Remove every filter registered under our provider, including the ones
    /// we don't know about (left over by a previous run).
    pub fn teardown_all(&mut self, host: &dyn HostEngine) -> Result<(), EngineError> {
        let keys: Vec<ObjectKey> = host
            .filters_by_provider(self.namespace.provider)?
            .into_iter()
            .map(|filter| filter.key)
            .collect();
        let count = keys.len();
        FilterTransaction::teardown(keys).commit(host)?;
        if count > 0 {
            log::debug!("{count} filters removed");
        }
        self.installed = FilterSet::empty();
        Ok(())
    }
}
