//! Configuration file, control service and network change detector wired
//! together the way `split-tunneld` does it.

use std::{sync::Arc, time::Duration};

use host_engine::SimulatedEngine;
use split_tunnel::{
    classification::ImagePath,
    daemon::{
        DaemonConfig, NetworkSettings, SplitTunnelSettings,
        config::{NETWORK_SECTION, SPLIT_TUNNEL_SECTION},
        netchange::DEFAULT_QUIET_PERIOD,
        start_control_service, start_network_change_detector,
    },
    split_engine::{EngineConfig, SplitTunnelEngine},
};
use tokio::sync::mpsc;

const CONFIG: &str = "
[split-tunnel]
enabled = true
apps = c:\\apps\\browser.exe

[network]
vpn_connected = true
tunnel_interface = 20
physical_interface = 3
ipv4_public = 192.168.1.10
ipv4_tunnel = 10.0.0.2
";

#[tokio::test(start_paused = true)]
async fn configuration_changes_reach_the_engine() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("split-tunnel.ini");
    std::fs::write(&path, CONFIG).unwrap();
    let config = DaemonConfig::new(&path).unwrap();

    let host = Arc::new(SimulatedEngine::new());
    let mut engine = SplitTunnelEngine::new(host.clone(), EngineConfig::default());
    engine.initialize().unwrap();
    let control = start_control_service(engine, Some(config.clone()));

    let settings =
        SplitTunnelSettings::try_from(&config.get_section_config(SPLIT_TUNNEL_SECTION)).unwrap();
    let network =
        NetworkSettings::try_from(&config.get_section_config(NETWORK_SECTION)).unwrap();
    control.apply_config(settings, network).await.unwrap();
    assert_eq!(host.filters().len(), 8);

    // Physical interface moves, the detector settles it
    let mut rx_network = config.get_watched_section_config(NETWORK_SECTION);
    std::fs::write(&path, CONFIG.replace("physical_interface = 3", "physical_interface = 4"))
        .unwrap();
    assert_eq!(config.reload().unwrap(), vec![NETWORK_SECTION.to_string()]);
    assert!(rx_network.has_changed().unwrap());

    let (tx_change, mut rx_change) = mpsc::channel(1);
    let detector = start_network_change_detector(DEFAULT_QUIET_PERIOD, tx_change);
    let section = rx_network.borrow_and_update().clone();
    detector
        .interface_changed(NetworkSettings::try_from(&section).unwrap())
        .await;
    let change = tokio::time::timeout(Duration::from_secs(10), rx_change.recv())
        .await
        .unwrap()
        .unwrap();
    control.interface_changed(change).await;
    assert_eq!(
        control.status().await.unwrap().binding.physical_interface,
        Some(4)
    );

    // Apps added through the handle end up in the file
    control
        .add_app("C:\\Apps\\Mail.exe".to_string())
        .await
        .unwrap();
    let reloaded = DaemonConfig::new(&path).unwrap();
    let settings =
        SplitTunnelSettings::try_from(&reloaded.get_section_config(SPLIT_TUNNEL_SECTION))
            .unwrap();
    assert_eq!(
        settings.apps,
        vec!["c:\\apps\\browser.exe", "c:\\apps\\mail.exe"]
    );
    assert_eq!(
        control.status().await.unwrap().apps,
        vec![
            ImagePath::normalize("c:\\apps\\browser.exe"),
            ImagePath::normalize("c:\\apps\\mail.exe"),
        ]
    );

    control.shutdown().await.unwrap();
    assert!(host.filters().is_empty());
}
