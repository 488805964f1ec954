use split_core::{ConfigError, ImagePath, SectionConfig};

/// Split list as read from the configuration file.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Config {
    /// Executables whose traffic bypasses the tunnel.
    pub apps: Vec<ImagePath>,
}

/// Extract Config from configuration file
impl TryFrom<&SectionConfig> for Config {
    type Error = ConfigError;

    fn try_from(config: &SectionConfig) -> Result<Self, Self::Error> {
        let mut apps: Vec<ImagePath> = config.get_list("apps")?;
        apps.sort();
        apps.dedup();
        Ok(Config { apps })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apps_are_normalized_and_deduplicated() {
        let section: SectionConfig = [(
            "apps",
            "C:\\Tools\\a.exe, c:/tools/A.EXE, c:\\tools\\b.exe",
        )]
        .into_iter()
        .collect();
        let config = Config::try_from(&section).unwrap();
        assert_eq!(
            config.apps,
            vec![
                ImagePath::normalize("c:\\tools\\a.exe"),
                ImagePath::normalize("c:\\tools\\b.exe"),
            ]
        );
    }

    #[test]
    fn missing_apps_means_empty_list() {
        let config = Config::try_from(&SectionConfig::default()).unwrap();
        assert!(config.apps.is_empty());
    }
}
