use std::{collections::BTreeSet, sync::Arc};

use callouts::EngineContext;
use classification::{ClassificationStore, ImagePath, RunningApp};
use host_engine::HostEngine;
use serde::Serialize;
use split_core::{AddressFamily, InterfaceBinding, ObjectKey, Pid, ids::validate_catalog};

use crate::{
    config::EngineConfig,
    error::EngineError,
    filters::{FilterManager, FilterSet},
    registry::{register_callouts, unregister_callouts},
};

/// Snapshot of the engine state, for the control service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineStatus {
    pub running: bool,
    pub enabled: bool,
    pub vpn_connected: bool,
    pub binding: InterfaceBinding,
    pub apps: Vec<ImagePath>,
    pub running_apps: Vec<RunningApp>,
    pub installed_filters: Vec<ObjectKey>,
    pub degraded: Vec<AddressFamily>,
    pub unavailable: Option<String>,
}

/// Split tunnel engine: owns the namespace, the callouts and the filters
/// registered into the host, and the context the callouts read from.
///
/// Control operations take `&mut self`: they're serialized by the owner.
/// Callouts only see the shared [`EngineContext`].
pub struct SplitTunnelEngine {
    host: Arc<dyn HostEngine>,
    config: EngineConfig,
    ctx: Arc<EngineContext>,
    filters: FilterManager,
    unavailable: Option<EngineError>,
    /// Configured split list. Loaded into the store only while running.
    apps: BTreeSet<ImagePath>,
    running: bool,
    enabled: bool,
    vpn_connected: bool,
}

impl SplitTunnelEngine {
    pub fn new(host: Arc<dyn HostEngine>, config: EngineConfig) -> Self {
        Self::with_store(host, config, Arc::new(ClassificationStore::new()))
    }

    pub fn with_store(
        host: Arc<dyn HostEngine>,
        config: EngineConfig,
        store: Arc<ClassificationStore>,
    ) -> Self {
        let filters = FilterManager::new(config.namespace.clone());
        Self {
            host,
            config,
            ctx: Arc::new(EngineContext::new(store, InterfaceBinding::default())),
            filters,
            unavailable: None,
            apps: BTreeSet::new(),
            running: false,
            enabled: false,
            vpn_connected: false,
        }
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    pub fn store(&self) -> &Arc<ClassificationStore> {
        self.ctx.store()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn installed_filters(&self) -> &FilterSet {
        self.filters.installed()
    }

    /// Check that split tunneling can work on this host.
    /// The result is remembered, see [`Self::func_not_available_error`].
    pub fn initialize(&mut self) -> Result<(), EngineError> {
        log::info!("initializing split tunnel");
        let result = validate_catalog()
            .map_err(EngineError::from)
            .and_then(|()| self.host.open().map_err(EngineError::EngineUnavailable));
        self.unavailable = result.clone().err();
        result
    }

    /// Why split tunneling is not available, if it's not.
    pub fn func_not_available_error(&self) -> Option<&EngineError> {
        self.unavailable.as_ref()
    }

    /// Register namespace, callouts and filters. Nothing stays registered
    /// if any step fails.
    pub fn start(&mut self) -> Result<(), EngineError> {
        if self.running {
            return Ok(());
        }
        if let Some(err) = &self.unavailable {
            return Err(err.clone());
        }
        validate_catalog()?;
        self.config.namespace.activate(&*self.host)?;
        if let Err(err) = self.install() {
            if let Err(rollback_err) = self.teardown() {
                split_core::log_error("rolling back split tunnel start", rollback_err);
            }
            return Err(err);
        }
        self.running = true;
        self.sync_store();
        log::info!(
            "split tunnel started, {} filters",
            self.filters.installed().len()
        );
        Ok(())
    }

    fn install(&mut self) -> Result<(), EngineError> {
        let host = &*self.host;
        let namespace = &self.config.namespace;
        // Leftovers of a previous run
        self.filters.teardown_all(host)?;
        unregister_callouts(host, namespace)?;

        register_callouts(host, namespace, &self.ctx)?;
        let desired = self.desired_filters();
        self.filters.apply_filter_set(host, desired)
    }

    fn teardown(&mut self) -> Result<(), EngineError> {
        let host = &*self.host;
        let namespace = &self.config.namespace;
        self.filters.teardown_all(host)?;
        unregister_callouts(host, namespace)?;
        namespace.deactivate(host)
    }

    /// Remove filters, callouts and namespace. Does nothing if not running.
    pub fn stop(&mut self) -> Result<(), EngineError> {
        if !self.running {
            return Ok(());
        }
        self.teardown()?;
        self.running = false;
        self.sync_store();
        log::info!("split tunnel stopped");
        Ok(())
    }

    fn desired_filters(&self) -> FilterSet {
        FilterSet::builder()
            .apps(self.apps.iter().map(ImagePath::to_string))
            .weight(self.config.filter_weight)
            .all_layers()
            .build()
    }

    fn refresh_filters(&mut self) -> Result<(), EngineError> {
        if !self.running {
            return Ok(());
        }
        let desired = self.desired_filters();
        self.filters.apply_filter_set(&*self.host, desired)
    }

    /// The store holds the split list while running and nothing otherwise.
    fn sync_store(&self) {
        if self.running {
            self.store()
                .replace_all(self.apps.iter().map(ImagePath::as_str));
        } else {
            self.store().clear();
        }
    }

    /// Apply a full configuration pushed by the control service.
    ///
    /// With the VPN disconnected the tunnel addresses are dropped. If the
    /// engine can't be brought to the requested state the previous split
    /// list is restored.
    pub fn apply_config<I, P>(
        &mut self,
        enabled: bool,
        vpn_enabled: bool,
        binding: InterfaceBinding,
        apps: I,
    ) -> Result<(), EngineError>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<str>,
    {
        self.update_network(vpn_enabled, binding);
        self.enabled = enabled;

        let apps = apps
            .into_iter()
            .map(|path| ImagePath::normalize(path.as_ref()))
            .filter(|path| !path.is_empty())
            .collect();
        let previous = std::mem::replace(&mut self.apps, apps);
        let result = match (enabled, self.running) {
            (true, false) => self.start(),
            (true, true) => self.refresh_filters(),
            (false, true) => self.stop(),
            (false, false) => Ok(()),
        };
        if result.is_err() {
            self.apps = previous;
        }
        self.sync_store();
        result
    }

    /// Turn split tunneling on or off. The split list is kept for the next
    /// start, the store stays empty while disabled.
    pub fn set_enabled(&mut self, enabled: bool) -> Result<(), EngineError> {
        self.enabled = enabled;
        if enabled { self.start() } else { self.stop() }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Configured split list, kept while disabled.
    pub fn apps(&self) -> &BTreeSet<ImagePath> {
        &self.apps
    }

    /// Add or remove an executable, updating the filters if needed.
    pub fn set_inclusion(&mut self, path: &str, included: bool) -> Result<(), EngineError> {
        let path = ImagePath::normalize(path);
        if path.is_empty() {
            log::warn!("ignoring empty executable path");
            return Ok(());
        }
        let changed = if included {
            self.apps.insert(path.clone())
        } else {
            self.apps.remove(&path)
        };
        if !changed {
            return Ok(());
        }
        if let Err(err) = self.refresh_filters() {
            if included {
                self.apps.remove(&path);
            } else {
                self.apps.insert(path);
            }
            return Err(err);
        }
        if self.running {
            self.store().set_inclusion(path.as_str(), included);
        }
        Ok(())
    }

    /// Publish a new interface binding to the callouts, under the current
    /// VPN state.
    pub fn update_binding(&self, binding: InterfaceBinding) {
        let binding = if self.vpn_connected {
            InterfaceBinding {
                vpn_connected: true,
                ..binding
            }
        } else {
            binding.without_tunnel()
        };
        log::debug!("interface binding updated: {binding:?}");
        self.ctx.publish_binding(binding);
    }

    /// VPN state and binding change together: callouts see a single swap.
    pub fn update_network(&mut self, vpn_connected: bool, binding: InterfaceBinding) {
        self.vpn_connected = vpn_connected;
        self.update_binding(binding);
    }

    pub fn process_started(&self, pid: Pid, path: &str) {
        self.store().process_started(pid, path);
    }

    pub fn process_exited(&self, pid: Pid) {
        self.store().process_exited(pid);
    }

    /// `MissingPhysicalBinding` if split traffic was blocked since the last
    /// binding update.
    pub fn health(&self) -> Result<(), EngineError> {
        let families = self.ctx.degraded_families();
        if families.is_empty() {
            Ok(())
        } else {
            Err(EngineError::MissingPhysicalBinding { families })
        }
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            running: self.running,
            enabled: self.enabled,
            vpn_connected: self.vpn_connected,
            binding: InterfaceBinding::clone(&self.ctx.binding()),
            apps: self.apps.iter().cloned().collect(),
            running_apps: self.store().running_apps(),
            installed_filters: self.filters.installed().keys().collect(),
            degraded: self.ctx.degraded_families(),
            unavailable: self.unavailable.as_ref().map(ToString::to_string),
        }
    }
}

#[cfg(test)]
mod tests {
    use host_engine::SimulatedEngine;
    use split_core::{
        ClassifyEvent, Layer, ProcessIdentity,
        ids::{PROVIDER, SUBLAYER},
    };

    use super::*;

    const APP: &str = "c:\\apps\\split.exe";
    const OTHER: &str = "c:\\other.exe";

    fn binding() -> InterfaceBinding {
        InterfaceBinding {
            vpn_connected: true,
            tunnel_interface: Some(20),
            physical_interface: Some(3),
            ipv4_physical: Some("192.168.1.10".parse().unwrap()),
            ipv6_physical: None,
            ipv4_tunnel: Some("10.0.0.2".parse().unwrap()),
            ipv6_tunnel: Some("fd00::2".parse().unwrap()),
        }
    }

    fn engine() -> (Arc<SimulatedEngine>, SplitTunnelEngine) {
        let host = Arc::new(SimulatedEngine::new());
        let engine = SplitTunnelEngine::new(host.clone(), EngineConfig::default());
        (host, engine)
    }

    #[test]
    fn start_registers_everything_and_stop_removes_it() {
        let (host, mut engine) = engine();
        engine.initialize().unwrap();
        engine.set_inclusion(APP, true).unwrap();
        assert!(engine.store().is_empty());
        engine.start().unwrap();
        assert!(engine.is_running());
        assert_eq!(host.filters().len(), 8);
        assert!(Layer::all().all(|layer| host.has_object(layer.callout_key())));
        assert!(engine.store().is_included(APP, Pid::from_raw(1)));

        engine.stop().unwrap();
        assert!(engine.store().is_empty());
        assert!(host.filters().is_empty());
        assert!(!host.has_object(PROVIDER));
        assert!(!host.has_object(SUBLAYER));
        assert!(Layer::all().all(|layer| !host.has_object(layer.callout_key())));
        engine.stop().unwrap();
    }

    #[test]
    fn failed_start_leaves_nothing_behind() {
        let (host, mut engine) = engine();
        engine.set_inclusion(APP, true).unwrap();
        host.reject_filter(Layer::all().nth(3).unwrap().filter_key());
        assert!(matches!(
            engine.start(),
            Err(EngineError::FilterApplyFailed { .. })
        ));
        assert!(!engine.is_running());
        assert!(engine.store().is_empty());
        assert!(host.filters().is_empty());
        assert!(!host.has_object(PROVIDER));
        assert!(Layer::all().all(|layer| !host.has_object(layer.callout_key())));
    }

    #[test]
    fn unavailable_host_is_remembered() {
        let (host, mut engine) = engine();
        host.set_unavailable("no filtering engine");
        assert!(engine.initialize().is_err());
        assert!(matches!(
            engine.func_not_available_error(),
            Some(EngineError::EngineUnavailable(_))
        ));
        assert!(engine.start().is_err());

        host.clear_faults();
        engine.initialize().unwrap();
        assert_eq!(engine.func_not_available_error(), None);
    }

    #[test]
    fn apply_config_transitions() {
        let (host, mut engine) = engine();
        engine
            .apply_config(true, true, binding(), [APP])
            .unwrap();
        assert!(engine.is_running());
        assert_eq!(host.filters().len(), 8);

        // no apps: running, no filters
        engine
            .apply_config(true, true, binding(), Vec::<String>::new())
            .unwrap();
        assert!(engine.is_running());
        assert!(host.filters().is_empty());

        engine
            .apply_config(false, true, binding(), [APP])
            .unwrap();
        assert!(!engine.is_running());
        assert!(!host.has_object(PROVIDER));
    }

    #[test]
    fn disabled_engine_empties_the_store() {
        let (host, mut engine) = engine();
        engine
            .apply_config(true, true, binding(), [APP])
            .unwrap();
        engine.process_started(Pid::from_raw(10), APP);
        assert!(engine.store().is_included(APP, Pid::from_raw(10)));

        engine.set_enabled(false).unwrap();
        assert!(engine.store().is_empty());
        assert!(engine.store().running_apps().is_empty());
        assert_eq!(engine.status().apps, vec![ImagePath::normalize(APP)]);

        // The split list comes back with the next start
        engine.set_enabled(true).unwrap();
        assert!(engine.store().is_included(APP, Pid::from_raw(10)));
        assert_eq!(host.filters().len(), 8);

        engine
            .apply_config(false, true, binding(), [APP])
            .unwrap();
        assert!(engine.store().is_empty());
    }

    #[test]
    fn failed_disable_restores_previous_list() {
        let (host, mut engine) = engine();
        engine
            .apply_config(true, true, binding(), [APP])
            .unwrap();
        host.set_unavailable("service stopped");
        assert!(
            engine
                .apply_config(false, true, binding(), [OTHER])
                .is_err()
        );
        assert!(engine.is_running());
        assert_eq!(engine.status().apps, vec![ImagePath::normalize(APP)]);
        assert!(engine.store().is_included(APP, Pid::from_raw(1)));
        assert!(!engine.store().is_included(OTHER, Pid::from_raw(2)));
    }

    #[test]
    fn failed_start_restores_previous_list() {
        let (host, mut engine) = engine();
        host.reject_filter(Layer::all().next().unwrap().filter_key());
        assert!(
            engine
                .apply_config(true, true, binding(), [APP])
                .is_err()
        );
        assert!(!engine.is_running());
        assert!(engine.status().apps.is_empty());
        assert!(engine.store().is_empty());
    }

    #[test]
    fn vpn_off_drops_tunnel_addresses() {
        let (_host, mut engine) = engine();
        engine
            .apply_config(true, false, binding(), [APP])
            .unwrap();
        let status = engine.status();
        assert!(!status.binding.vpn_connected);
        assert_eq!(status.binding, binding().without_tunnel());

        // Reconnecting takes the tunnel fields from the new binding
        engine.update_network(true, binding());
        assert_eq!(*engine.context().binding(), binding());
        assert!(engine.status().vpn_connected);
    }

    #[test]
    fn binding_carries_vpn_state() {
        let (_host, mut engine) = engine();
        let unflagged = InterfaceBinding {
            vpn_connected: false,
            ..binding()
        };
        engine.update_network(true, unflagged.clone());
        assert!(engine.context().binding().vpn_connected);

        engine.update_network(false, unflagged);
        let published = engine.context().binding();
        assert!(!published.vpn_connected);
        assert_eq!(published.tunnel_interface, None);
    }

    #[test]
    fn failed_inclusion_update_is_rolled_back() {
        let (host, mut engine) = engine();
        engine
            .apply_config(true, true, binding(), [APP])
            .unwrap();
        let before = host.filters();
        host.reject_filter(Layer::all().next().unwrap().filter_key());
        assert!(engine.set_inclusion(OTHER, true).is_err());
        assert_eq!(host.filters(), before);
        assert_eq!(engine.status().apps, vec![ImagePath::normalize(APP)]);
        assert!(!engine.store().is_included(OTHER, Pid::from_raw(2)));
    }

    #[test]
    fn degraded_family_is_reported() {
        let (host, mut engine) = engine();
        engine
            .apply_config(true, true, binding(), [APP])
            .unwrap();
        assert_eq!(engine.health(), Ok(()));

        let event = ClassifyEvent::bind(
            ProcessIdentity::new(10, APP),
            "[::]:0".parse().unwrap(),
        );
        assert!(host.classify(&event).is_block());
        assert_eq!(
            engine.health(),
            Err(EngineError::MissingPhysicalBinding {
                families: vec![AddressFamily::V6]
            })
        );
        assert_eq!(engine.status().degraded, vec![AddressFamily::V6]);
    }

    #[test]
    fn connected_vpn_without_binding_blocks_split_traffic() {
        let (host, mut engine) = engine();
        engine
            .apply_config(true, true, InterfaceBinding::default(), [APP])
            .unwrap();
        let event = ClassifyEvent::bind(
            ProcessIdentity::new(10, APP),
            "0.0.0.0:0".parse().unwrap(),
        );
        assert!(host.classify(&event).is_block());
        assert_eq!(engine.status().degraded, vec![AddressFamily::V4]);
    }
}
