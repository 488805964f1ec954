use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use classification::ClassificationStore;
use split_core::{AddressFamily, BindingCell, InterfaceBinding, ProcessIdentity};

/// State shared by the callouts and the control path.
///
/// There's one context per engine instance; it's handed explicitly to every
/// callout at registration time.
#[derive(Debug)]
pub struct EngineContext {
    store: Arc<ClassificationStore>,
    binding: BindingCell,
    degraded_v4: AtomicBool,
    degraded_v6: AtomicBool,
}

impl EngineContext {
    pub fn new(store: Arc<ClassificationStore>, binding: InterfaceBinding) -> Self {
        Self {
            store,
            binding: BindingCell::new(binding),
            degraded_v4: AtomicBool::new(false),
            degraded_v6: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &Arc<ClassificationStore> {
        &self.store
    }

    pub fn is_included(&self, process: &ProcessIdentity) -> bool {
        self.store.is_included(&process.path, process.pid)
    }

    pub fn binding(&self) -> Arc<InterfaceBinding> {
        self.binding.load()
    }

    /// Publish a new binding. Degraded flags are reset: the next event tells
    /// whether the new binding is still missing something.
    pub fn publish_binding(&self, binding: InterfaceBinding) {
        self.binding.publish(binding);
        self.degraded_v4.store(false, Ordering::Relaxed);
        self.degraded_v6.store(false, Ordering::Relaxed);
    }

    fn degraded_flag(&self, family: AddressFamily) -> &AtomicBool {
        match family {
            AddressFamily::V4 => &self.degraded_v4,
            AddressFamily::V6 => &self.degraded_v6,
        }
    }

    /// Record that split traffic of `family` was blocked for lack of a
    /// physical binding.
    pub fn mark_degraded(&self, family: AddressFamily) {
        if !self.degraded_flag(family).swap(true, Ordering::Relaxed) {
            log::debug!("no physical {family} binding, blocking split traffic");
        }
    }

    pub fn degraded_families(&self) -> Vec<AddressFamily> {
        [AddressFamily::V4, AddressFamily::V6]
            .into_iter()
            .filter(|family| self.degraded_flag(*family).load(Ordering::Relaxed))
            .collect()
    }
}
