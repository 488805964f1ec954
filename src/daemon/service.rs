use classification::ImagePath;
use split_core::Pid;
use split_engine::{EngineError, EngineStatus, SplitTunnelEngine};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use super::{
    config::{DaemonConfig, NetworkSettings, SPLIT_TUNNEL_SECTION, SplitTunnelSettings},
    netchange::NetworkChange,
};

/// Error returned to the callers of [`ControlHandle`].
#[derive(Error, Debug)]
pub enum ControlError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("error updating the configuration")]
    ConfigurationUpdate(#[source] anyhow::Error),
    #[error("control service stopped")]
    ServiceStopped,
}

#[derive(Debug)]
pub enum ControlCommand {
    ApplyConfig {
        settings: SplitTunnelSettings,
        network: NetworkSettings,
        tx_reply: oneshot::Sender<Result<(), ControlError>>,
    },
    UpdateSettings {
        settings: SplitTunnelSettings,
        tx_reply: oneshot::Sender<Result<(), ControlError>>,
    },
    SetInclusion {
        path: String,
        included: bool,
        tx_reply: oneshot::Sender<Result<(), ControlError>>,
    },
    SetEnabled {
        enabled: bool,
        tx_reply: oneshot::Sender<Result<(), ControlError>>,
    },
    InterfaceChanged {
        change: NetworkChange,
    },
    ProcessStarted {
        pid: Pid,
        path: String,
    },
    ProcessExited {
        pid: Pid,
    },
    Status {
        tx_reply: oneshot::Sender<EngineStatus>,
    },
    Shutdown {
        tx_reply: oneshot::Sender<Result<(), ControlError>>,
    },
}

/// Handle to the running control service.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    tx_cmd: mpsc::Sender<ControlCommand>,
}

impl ControlHandle {
    async fn request<T>(
        &self,
        msg: impl FnOnce(oneshot::Sender<T>) -> ControlCommand,
    ) -> Result<T, ControlError> {
        let (send, recv) = oneshot::channel();

        // Ignore send errors. If this send fails, so does the
        // recv.await below. There's no reason to check the
        // failure twice.
        let _ = self.tx_cmd.send(msg(send)).await;
        recv.await.map_err(|_| ControlError::ServiceStopped)
    }

    async fn notify(&self, msg: ControlCommand) {
        if self.tx_cmd.send(msg).await.is_err() {
            log::debug!("control service stopped, notification dropped");
        }
    }

    /// Replace the whole configuration.
    pub async fn apply_config(
        &self,
        settings: SplitTunnelSettings,
        network: NetworkSettings,
    ) -> Result<(), ControlError> {
        self.request(|tx_reply| ControlCommand::ApplyConfig {
            settings,
            network,
            tx_reply,
        })
        .await?
    }

    /// Replace the split list and the on/off switch, keeping the network state.
    pub async fn update_settings(&self, settings: SplitTunnelSettings) -> Result<(), ControlError> {
        self.request(|tx_reply| ControlCommand::UpdateSettings { settings, tx_reply })
            .await?
    }

    pub async fn add_app(&self, path: String) -> Result<(), ControlError> {
        self.set_inclusion(path, true).await
    }

    pub async fn remove_app(&self, path: String) -> Result<(), ControlError> {
        self.set_inclusion(path, false).await
    }

    async fn set_inclusion(&self, path: String, included: bool) -> Result<(), ControlError> {
        self.request(|tx_reply| ControlCommand::SetInclusion {
            path,
            included,
            tx_reply,
        })
        .await?
    }

    pub async fn set_enabled(&self, enabled: bool) -> Result<(), ControlError> {
        self.request(|tx_reply| ControlCommand::SetEnabled { enabled, tx_reply })
            .await?
    }

    pub async fn interface_changed(&self, change: NetworkChange) {
        self.notify(ControlCommand::InterfaceChanged { change })
            .await
    }

    pub async fn process_started(&self, pid: Pid, path: String) {
        self.notify(ControlCommand::ProcessStarted { pid, path })
            .await
    }

    pub async fn process_exited(&self, pid: Pid) {
        self.notify(ControlCommand::ProcessExited { pid }).await
    }

    pub async fn status(&self) -> Result<EngineStatus, ControlError> {
        self.request(|tx_reply| ControlCommand::Status { tx_reply })
            .await
    }

    /// Stop the engine and the service.
    pub async fn shutdown(&self) -> Result<(), ControlError> {
        self.request(|tx_reply| ControlCommand::Shutdown { tx_reply })
            .await?
    }
}

/// Owner of the [`SplitTunnelEngine`]. Every control operation goes
/// through here, one at a time.
///
/// When a [`DaemonConfig`] is attached, changes made through the handle
/// are written back to the configuration file.
pub struct ControlService {
    engine: SplitTunnelEngine,
    config: Option<DaemonConfig>,
    network: NetworkSettings,
    rx_cmd: mpsc::Receiver<ControlCommand>,
}

/// Create and start a [`ControlService`] actor.
///
/// The service stops, and the engine with it, on [`ControlHandle::shutdown`]
/// or when every handle is dropped.
pub fn start_control_service(
    engine: SplitTunnelEngine,
    config: Option<DaemonConfig>,
) -> ControlHandle {
    let (tx_cmd, rx_cmd) = mpsc::channel(8);
    let service = ControlService {
        engine,
        config,
        network: NetworkSettings::default(),
        rx_cmd,
    };
    tokio::spawn(run_control_service(service));
    ControlHandle { tx_cmd }
}

impl ControlService {
    /// Returns `false` once the service must stop.
    fn handle_cmd(&mut self, cmd: ControlCommand) -> bool {
        match cmd {
            ControlCommand::ApplyConfig {
                settings,
                network,
                tx_reply,
            } => {
                self.network = network;
                let _ = tx_reply.send(self.apply(settings));
            }
            ControlCommand::UpdateSettings { settings, tx_reply } => {
                let _ = tx_reply.send(self.apply(settings));
            }
            ControlCommand::SetInclusion {
                path,
                included,
                tx_reply,
            } => {
                let _ = tx_reply.send(self.set_inclusion(&path, included));
            }
            ControlCommand::SetEnabled { enabled, tx_reply } => {
                let _ = tx_reply.send(self.set_enabled(enabled));
            }
            ControlCommand::InterfaceChanged { change } => self.interface_changed(change),
            ControlCommand::ProcessStarted { pid, path } => {
                self.engine.process_started(pid, &path)
            }
            ControlCommand::ProcessExited { pid } => self.engine.process_exited(pid),
            ControlCommand::Status { tx_reply } => {
                let _ = tx_reply.send(self.engine.status());
            }
            ControlCommand::Shutdown { tx_reply } => {
                let _ = tx_reply.send(self.engine.stop().map_err(ControlError::from));
                return false;
            }
        }
        true
    }

    fn apply(&mut self, settings: SplitTunnelSettings) -> Result<(), ControlError> {
        self.engine.apply_config(
            settings.enabled,
            self.network.vpn_connected,
            self.network.binding.clone(),
            settings.apps,
        )?;
        Ok(())
    }

    fn set_inclusion(&mut self, path: &str, included: bool) -> Result<(), ControlError> {
        self.engine.set_inclusion(path, included)?;
        let apps = self
            .engine
            .apps()
            .iter()
            .map(ImagePath::as_str)
            .collect::<Vec<_>>()
            .join(", ");
        self.persist("apps", &apps)
    }

    fn set_enabled(&mut self, enabled: bool) -> Result<(), ControlError> {
        self.engine.set_enabled(enabled)?;
        self.persist("enabled", &enabled.to_string())
    }

    fn persist(&self, key: &str, value: &str) -> Result<(), ControlError> {
        match &self.config {
            Some(config) => config
                .update_config(SPLIT_TUNNEL_SECTION, key, value)
                .map_err(ControlError::ConfigurationUpdate),
            None => Ok(()),
        }
    }

    fn interface_changed(&mut self, change: NetworkChange) {
        if change.tunnel_lost {
            log::warn!("tunnel interface lost while the VPN is connected");
        }
        self.network = NetworkSettings {
            vpn_connected: change.vpn_connected,
            binding: change.binding.clone(),
        };
        self.engine
            .update_network(change.vpn_connected, change.binding);
    }
}

async fn run_control_service(mut service: ControlService) {
    while let Some(cmd) = service.rx_cmd.recv().await {
        if !service.handle_cmd(cmd) {
            log::info!("control service stopped");
            return;
        }
    }

    if let Err(err) = service.engine.stop() {
        split_core::log_error("stopping split tunnel", err);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use host_engine::SimulatedEngine;
    use split_core::{InterfaceBinding, ids::PROVIDER};
    use split_engine::EngineConfig;

    use super::*;

    const APP: &str = "c:\\apps\\split.exe";

    fn network() -> NetworkSettings {
        NetworkSettings {
            vpn_connected: true,
            binding: InterfaceBinding {
                vpn_connected: true,
                tunnel_interface: Some(20),
                physical_interface: Some(3),
                ipv4_physical: Some("192.168.1.10".parse().unwrap()),
                ipv6_physical: None,
                ipv4_tunnel: Some("10.0.0.2".parse().unwrap()),
                ipv6_tunnel: None,
            },
        }
    }

    fn settings(apps: &[&str]) -> SplitTunnelSettings {
        SplitTunnelSettings {
            enabled: true,
            apps: apps.iter().map(ToString::to_string).collect(),
        }
    }

    fn service(config: Option<DaemonConfig>) -> (Arc<SimulatedEngine>, ControlHandle) {
        let host = Arc::new(SimulatedEngine::new());
        let engine = SplitTunnelEngine::new(host.clone(), EngineConfig::default());
        (host, start_control_service(engine, config))
    }

    #[tokio::test]
    async fn apply_and_status() {
        let (host, control) = service(None);
        control.apply_config(settings(&[APP]), network()).await.unwrap();

        let status = control.status().await.unwrap();
        assert!(status.running);
        assert!(status.vpn_connected);
        assert_eq!(status.apps, vec![ImagePath::normalize(APP)]);
        assert_eq!(host.filters().len(), 8);

        control.update_settings(settings(&[])).await.unwrap();
        assert!(host.filters().is_empty());
        assert_eq!(control.status().await.unwrap().binding, network().binding);
    }

    #[tokio::test]
    async fn app_changes_are_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let config = DaemonConfig::new(dir.path().join("split-tunnel.ini")).unwrap();
        let (_host, control) = service(Some(config.clone()));
        control.apply_config(settings(&[]), network()).await.unwrap();

        control.add_app("C:\\Apps\\B.exe".to_string()).await.unwrap();
        control.add_app(APP.to_string()).await.unwrap();
        control.remove_app("c:\\apps\\b.exe".to_string()).await.unwrap();
        control.set_enabled(false).await.unwrap();

        let section = DaemonConfig::new(config.config_file())
            .unwrap()
            .get_section_config(SPLIT_TUNNEL_SECTION);
        assert_eq!(
            SplitTunnelSettings::try_from(&section).unwrap(),
            SplitTunnelSettings {
                enabled: false,
                apps: vec![APP.to_string()],
            }
        );
    }

    #[tokio::test]
    async fn engine_errors_are_returned() {
        let (host, control) = service(None);
        host.set_unavailable("no filtering engine");
        assert!(matches!(
            control.apply_config(settings(&[APP]), network()).await,
            Err(ControlError::Engine(EngineError::EngineUnavailable(_)))
        ));
        assert!(!control.status().await.unwrap().running);
    }

    #[tokio::test]
    async fn interface_change_updates_binding() {
        let (_host, control) = service(None);
        control.apply_config(settings(&[APP]), network()).await.unwrap();

        let mut binding = network().binding;
        binding.physical_interface = Some(4);
        control
            .interface_changed(NetworkChange {
                vpn_connected: false,
                binding: binding.clone(),
                tunnel_lost: false,
            })
            .await;

        let status = control.status().await.unwrap();
        assert!(!status.vpn_connected);
        assert_eq!(status.binding, binding.without_tunnel());
    }

    #[tokio::test]
    async fn lost_tunnel_keeps_vpn_state() {
        let (_host, control) = service(None);
        control.apply_config(settings(&[APP]), network()).await.unwrap();

        let binding = InterfaceBinding {
            tunnel_interface: None,
            ipv4_tunnel: None,
            ..network().binding
        };
        control
            .interface_changed(NetworkChange {
                vpn_connected: true,
                binding: binding.clone(),
                tunnel_lost: true,
            })
            .await;

        let status = control.status().await.unwrap();
        assert!(status.vpn_connected);
        assert!(status.binding.vpn_connected);
        assert_eq!(status.binding, binding);
    }

    #[tokio::test]
    async fn disabled_split_list_is_still_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let config = DaemonConfig::new(dir.path().join("split-tunnel.ini")).unwrap();
        let (_host, control) = service(Some(config.clone()));
        control.apply_config(settings(&[APP]), network()).await.unwrap();
        control.set_enabled(false).await.unwrap();
        control.add_app("c:\\apps\\b.exe".to_string()).await.unwrap();

        let section = config.get_section_config(SPLIT_TUNNEL_SECTION);
        assert_eq!(
            SplitTunnelSettings::try_from(&section).unwrap().apps,
            vec!["c:\\apps\\b.exe".to_string(), APP.to_string()]
        );
    }

    #[tokio::test]
    async fn process_notifications() {
        let (_host, control) = service(None);
        control.apply_config(settings(&[APP]), network()).await.unwrap();
        control.process_started(Pid::from_raw(42), APP.to_string()).await;
        let running = control.status().await.unwrap().running_apps;
        assert_eq!(running.len(), 1);
        assert!(running[0].included);

        control.process_exited(Pid::from_raw(42)).await;
        assert!(control.status().await.unwrap().running_apps.is_empty());
    }

    #[tokio::test]
    async fn shutdown_stops_engine() {
        let (host, control) = service(None);
        control.apply_config(settings(&[APP]), network()).await.unwrap();
        control.shutdown().await.unwrap();
        assert!(!host.has_object(PROVIDER));
        assert!(matches!(
            control.status().await,
            Err(ControlError::ServiceStopped)
        ));
    }

    #[tokio::test]
    async fn dropping_handles_stops_engine() {
        let (host, control) = service(None);
        control.apply_config(settings(&[APP]), network()).await.unwrap();
        drop(control);
        for _ in 0..100 {
            if !host.has_object(PROVIDER) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(!host.has_object(PROVIDER));
    }
}
