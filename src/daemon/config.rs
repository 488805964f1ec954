use std::{
    collections::HashMap,
    fs::File,
    net::{Ipv4Addr, Ipv6Addr},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use anyhow::{Context, Result};
use ini::{EscapePolicy, Ini, ParseOption};
use split_core::{ConfigError, InterfaceBinding, SectionConfig};
use tokio::sync::watch;

/// Split list and on/off switch.
pub const SPLIT_TUNNEL_SECTION: &str = "split-tunnel";
/// Tunnel and physical interface description.
pub const NETWORK_SECTION: &str = "network";
/// Host engine registration settings.
pub const ENGINE_SECTION: &str = "engine";

/// Daemon configuration manager, one [`SectionConfig`] per `INI` section.
///
/// Every section is published on a watch channel: [`DaemonConfig::reload`]
/// notifies the receivers of the sections which changed on disk.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    inner: Arc<Mutex<DaemonConfigInternal>>,
}

#[derive(Debug)]
struct DaemonConfigInternal {
    config_file: PathBuf,
    sections: HashMap<String, watch::Sender<SectionConfig>>,
}

impl DaemonConfig {
    /// Load the configuration file, creating an empty one if missing.
    pub fn new(config_file: impl AsRef<Path>) -> Result<Self> {
        let config_file = config_file.as_ref().to_path_buf();
        if !config_file.exists() {
            if let Some(prefix) = config_file.parent() {
                std::fs::create_dir_all(prefix)
                    .with_context(|| format!("Error creating directory {}", prefix.display()))?;
            }
            File::create(&config_file)
                .with_context(|| format!("Error creating {}", config_file.display()))?;
            log::info!("Created empty configuration {}", config_file.display());
        }

        let sections = load_sections(&config_file)?
            .into_iter()
            .map(|(name, section)| {
                let (tx, _) = watch::channel(section);
                (name, tx)
            })
            .collect();

        Ok(Self {
            inner: Arc::new(Mutex::new(DaemonConfigInternal {
                config_file,
                sections,
            })),
        })
    }

    fn lock(&self) -> MutexGuard<'_, DaemonConfigInternal> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config_file(&self) -> PathBuf {
        self.lock().config_file.clone()
    }

    /// Get [`watch::Receiver`] of a section.
    pub fn get_watched_section_config(&self, section: &str) -> watch::Receiver<SectionConfig> {
        self.lock()
            .sections
            .entry(section.to_string())
            .or_insert_with(|| watch::channel(SectionConfig::default()).0)
            .subscribe()
    }

    /// Get a section. Missing sections are empty.
    pub fn get_section_config(&self, section: &str) -> SectionConfig {
        self.lock()
            .sections
            .get(section)
            .map(|tx| tx.borrow().clone())
            .unwrap_or_default()
    }

    /// Read the file again. Watchers of the sections which changed are
    /// notified; sections removed from the file become empty.
    pub fn reload(&self) -> Result<Vec<String>> {
        let mut inner = self.lock();
        let mut loaded = load_sections(&inner.config_file)?;
        let mut changed = Vec::new();

        for (name, tx) in inner.sections.iter() {
            let section = loaded.remove(name).unwrap_or_default();
            if tx.send_if_modified(|current| {
                if *current == section {
                    false
                } else {
                    *current = section;
                    true
                }
            }) {
                changed.push(name.clone());
            }
        }
        for (name, section) in loaded {
            changed.push(name.clone());
            inner.sections.insert(name, watch::channel(section).0);
        }

        changed.sort();
        log::debug!("Configuration reloaded, changed sections: {changed:?}");
        Ok(changed)
    }

    /// Update one value, in memory and on disk.
    pub fn update_config(&self, section: &str, key: &str, value: &str) -> Result<()> {
        let mut inner = self.lock();

        let tx = inner
            .sections
            .entry(section.to_string())
            .or_insert_with(|| watch::channel(SectionConfig::default()).0);
        tx.send_modify(|config| {
            config.insert(key, value);
        });

        update_file_config(&inner.config_file, section, key, value)
    }
}

/// Backslashes are path separators in executable paths, not escapes.
fn load_ini(config_file: &Path) -> Result<Ini> {
    let opt = ParseOption {
        enabled_escape: false,
        ..ParseOption::default()
    };
    Ini::load_from_file_opt(config_file, opt)
        .with_context(|| format!("Error loading configuration from {config_file:?}"))
}

fn load_sections(config_file: &Path) -> Result<HashMap<String, SectionConfig>> {
    let conf = load_ini(config_file)?;

    let mut sections: HashMap<String, SectionConfig> = HashMap::new();
    for (section, prop) in &conf {
        if let Some(section) = section {
            let section_config = sections.entry(section.to_string()).or_default();
            for (key, value) in prop.iter() {
                log::debug!("{}.{}={}", section, key, value);
                section_config.insert(key, value);
            }
        }
    }
    Ok(sections)
}

/// Open configuration ini file, update the given value and save it to disk
fn update_file_config(config_file: &Path, section: &str, key: &str, value: &str) -> Result<()> {
    let mut conf = load_ini(config_file)?;

    conf.with_section(Some(section)).set(key, value);
    log::debug!("Changing configuration {}.{}={}", section, key, value);

    conf.write_to_file_policy(config_file, EscapePolicy::Nothing)
        .with_context(|| format!("Error writing to {config_file:?}"))?;

    Ok(())
}

/// Contents of the `[split-tunnel]` section.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SplitTunnelSettings {
    pub enabled: bool,
    pub apps: Vec<String>,
}

impl TryFrom<&SectionConfig> for SplitTunnelSettings {
    type Error = ConfigError;

    fn try_from(config: &SectionConfig) -> Result<Self, Self::Error> {
        let apps = classification::Config::try_from(config)?
            .apps
            .into_iter()
            .map(|app| app.to_string())
            .collect();
        Ok(Self {
            enabled: config.with_default("enabled", false)?,
            apps,
        })
    }
}

/// Contents of the `[network]` section.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkSettings {
    pub vpn_connected: bool,
    pub binding: InterfaceBinding,
}

impl TryFrom<&SectionConfig> for NetworkSettings {
    type Error = ConfigError;

    fn try_from(config: &SectionConfig) -> Result<Self, Self::Error> {
        let vpn_connected = config.with_default("vpn_connected", false)?;
        Ok(Self {
            vpn_connected,
            binding: InterfaceBinding {
                vpn_connected,
                tunnel_interface: config.optional("tunnel_interface")?,
                physical_interface: config.optional("physical_interface")?,
                ipv4_physical: config.optional::<Ipv4Addr>("ipv4_public")?,
                ipv6_physical: config.optional::<Ipv6Addr>("ipv6_public")?,
                ipv4_tunnel: config.optional::<Ipv4Addr>("ipv4_tunnel")?,
                ipv6_tunnel: config.optional::<Ipv6Addr>("ipv6_tunnel")?,
            },
        })
    }
}
