//! The `split-tunneld` service.
//!
//! Loads the configuration, starts the [control service](service) and the
//! [network change detector](netchange), then follows the configuration
//! file: on `SIGHUP` it is read again and the changed sections are applied.

use std::sync::Arc;

use anyhow::{Context, Result};
use host_engine::SimulatedEngine;
use split_core::ids::{CATALOG, FIREWALL_SUBLAYER};
use split_engine::{EngineConfig, SplitTunnelEngine};
use tokio::{
    signal::unix::{SignalKind, signal},
    sync::mpsc,
};

use crate::cli::split_tunneld::DaemonOpts;

pub mod config;
pub mod netchange;
pub mod service;

pub use config::{DaemonConfig, NetworkSettings, SplitTunnelSettings};
pub use netchange::{NetworkChange, NetworkChangeHandle, start_network_change_detector};
pub use service::{ControlError, ControlHandle, start_control_service};

use config::{ENGINE_SECTION, NETWORK_SECTION, SPLIT_TUNNEL_SECTION};

/// Object keys as a JSON object, role name to key.
pub fn catalog_json() -> Result<String> {
    let mut keys = serde_json::Map::new();
    for (role, key) in CATALOG.iter() {
        keys.insert(role.to_string(), serde_json::to_value(key)?);
    }
    keys.insert(
        "firewall sublayer".to_string(),
        serde_json::to_value(FIREWALL_SUBLAYER)?,
    );
    Ok(serde_json::to_string_pretty(&keys)?)
}

pub async fn split_tunnel_daemon_run(options: &DaemonOpts) -> Result<()> {
    log::trace!("Split tunnel daemon options: {:?}", options);

    if options.print_keys {
        println!("{}", catalog_json()?);
        return Ok(());
    }

    let config = DaemonConfig::new(&options.config)?;

    let engine_config = EngineConfig::try_from(&config.get_section_config(ENGINE_SECTION))
        .context("Invalid [engine] section")?;
    let mut engine = SplitTunnelEngine::new(Arc::new(SimulatedEngine::new()), engine_config);
    if let Err(err) = engine.initialize() {
        log::warn!("Split tunneling not available: {err}");
    }

    let control = start_control_service(engine, Some(config.clone()));

    let mut rx_split = config.get_watched_section_config(SPLIT_TUNNEL_SECTION);
    let mut rx_network = config.get_watched_section_config(NETWORK_SECTION);
    {
        let settings = SplitTunnelSettings::try_from(&*rx_split.borrow_and_update())
            .context("Invalid [split-tunnel] section")?;
        let network = NetworkSettings::try_from(&*rx_network.borrow_and_update())
            .context("Invalid [network] section")?;
        if let Err(err) = control.apply_config(settings, network).await {
            crate::utils::report_error(
                &anyhow::Error::from(err).context("Error applying the configuration"),
            );
        }
    }

    let (tx_change, mut rx_change) = mpsc::channel(1);
    let detector = start_network_change_detector(netchange::DEFAULT_QUIET_PERIOD, tx_change);

    let mut sig_int = signal(SignalKind::interrupt())?;
    let mut sig_term = signal(SignalKind::terminate())?;
    let mut sig_hup = signal(SignalKind::hangup())?;

    log::info!("Split tunnel daemon running");

    loop {
        tokio::select! {
            _ = sig_int.recv() => {
                log::trace!("SIGINT received");
                break;
            }
            _ = sig_term.recv() => {
                log::trace!("SIGTERM received");
                break;
            }
            _ = sig_hup.recv() => {
                log::info!("SIGHUP received, reloading {}", config.config_file().display());
                if let Err(err) = config.reload() {
                    crate::utils::report_error(&err);
                }
            }
            Ok(()) = rx_split.changed() => {
                let section = rx_split.borrow_and_update().clone();
                match SplitTunnelSettings::try_from(&section) {
                    Ok(settings) => {
                        if let Err(err) = control.update_settings(settings).await {
                            log::error!("Error applying [split-tunnel]: {err}");
                        }
                    }
                    Err(err) => log::error!("Invalid [split-tunnel] section: {err}"),
                }
            }
            Ok(()) = rx_network.changed() => {
                let section = rx_network.borrow_and_update().clone();
                match NetworkSettings::try_from(&section) {
                    Ok(settings) => detector.interface_changed(settings).await,
                    Err(err) => log::error!("Invalid [network] section: {err}"),
                }
            }
            Some(change) = rx_change.recv() => {
                control.interface_changed(change).await;
            }
        }
    }

    log::info!("Terminating split tunnel daemon...");
    control
        .shutdown()
        .await
        .context("Error stopping split tunnel")?;

    Ok(())
}
