//! Coalesce interface change notifications.
//!
//! Interface changes come in bursts: an address shows up, a route moves, the
//! tunnel reconnects. The detector waits for a quiet period after the last
//! notification and delivers only the latest state.

use std::time::Duration;

use split_core::InterfaceBinding;
use tokio::{
    sync::mpsc,
    time::{Instant, sleep_until},
};

use super::config::NetworkSettings;

pub const DEFAULT_QUIET_PERIOD: Duration = Duration::from_secs(3);

/// Settled network state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkChange {
    pub vpn_connected: bool,
    pub binding: InterfaceBinding,
    /// The tunnel interface in use before this change is gone while the
    /// VPN is still supposed to be connected.
    pub tunnel_lost: bool,
}

/// Handle to the running detector. The detector stops when every handle
/// is dropped.
#[derive(Debug, Clone)]
pub struct NetworkChangeHandle {
    tx_change: mpsc::Sender<NetworkSettings>,
}

impl NetworkChangeHandle {
    pub async fn interface_changed(&self, settings: NetworkSettings) {
        if self.tx_change.send(settings).await.is_err() {
            log::warn!("network change detector stopped");
        }
    }
}

/// Start the detector. Settled changes are pushed to `tx_out` without
/// waiting: if the consumer hasn't taken the previous one yet, the new one
/// is dropped.
pub fn start_network_change_detector(
    quiet_period: Duration,
    tx_out: mpsc::Sender<NetworkChange>,
) -> NetworkChangeHandle {
    let (tx_change, rx_change) = mpsc::channel(16);
    let detector = NetworkChangeDetector {
        quiet_period,
        rx_change,
        tx_out,
        protected_interface: None,
    };
    tokio::spawn(run_detector(detector));
    NetworkChangeHandle { tx_change }
}

struct NetworkChangeDetector {
    quiet_period: Duration,
    rx_change: mpsc::Receiver<NetworkSettings>,
    tx_out: mpsc::Sender<NetworkChange>,
    protected_interface: Option<u32>,
}

impl NetworkChangeDetector {
    fn settle(&mut self, settings: NetworkSettings) -> NetworkChange {
        let tunnel_lost = settings.vpn_connected
            && self.protected_interface.is_some()
            && settings.binding.tunnel_interface != self.protected_interface;

        self.protected_interface = if settings.vpn_connected {
            settings.binding.tunnel_interface
        } else {
            None
        };

        NetworkChange {
            vpn_connected: settings.vpn_connected,
            binding: settings.binding,
            tunnel_lost,
        }
    }

    fn deliver(&mut self, settings: NetworkSettings) {
        let change = self.settle(settings);
        if change.tunnel_lost {
            log::warn!("tunnel interface lost");
        }
        match self.tx_out.try_send(change) {
            Ok(()) => log::debug!("network change delivered"),
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::debug!("network change dropped, consumer busy")
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                log::debug!("network change dropped, consumer gone")
            }
        }
    }
}

async fn run_detector(mut detector: NetworkChangeDetector) {
    let mut pending: Option<NetworkSettings> = None;
    let mut deadline = Instant::now();

    loop {
        tokio::select! {
            change = detector.rx_change.recv() => match change {
                Some(settings) => {
                    pending = Some(settings);
                    deadline = Instant::now() + detector.quiet_period;
                }
                None => return,
            },
            _ = sleep_until(deadline), if pending.is_some() => {
                if let Some(settings) = pending.take() {
                    detector.deliver(settings);
                }
            }
        }
    }
}
