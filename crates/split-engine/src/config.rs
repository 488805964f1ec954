use split_core::{ConfigError, SectionConfig};

use crate::{
    filters::DEFAULT_FILTER_WEIGHT,
    namespace::{DEFAULT_SUBLAYER_WEIGHT, NamespaceIdentity},
};

/// Engine settings read from the `[engine]` section.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    pub namespace: NamespaceIdentity,
    /// Weight of the split filters inside our sublayer.
    pub filter_weight: u16,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            namespace: NamespaceIdentity::default(),
            filter_weight: DEFAULT_FILTER_WEIGHT,
        }
    }
}

/// Extract EngineConfig from configuration file
impl TryFrom<&SectionConfig> for EngineConfig {
    type Error = ConfigError;

    fn try_from(config: &SectionConfig) -> Result<Self, Self::Error> {
        Ok(EngineConfig {
            namespace: NamespaceIdentity {
                sublayer_weight: config.with_default("sublayer_weight", DEFAULT_SUBLAYER_WEIGHT)?,
                ..NamespaceIdentity::default()
            },
            filter_weight: config.with_default("filter_weight", DEFAULT_FILTER_WEIGHT)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        assert_eq!(
            EngineConfig::try_from(&SectionConfig::default()),
            Ok(EngineConfig::default())
        );
    }

    #[test]
    fn weights() {
        let section: SectionConfig = [("sublayer_weight", "4096"), ("filter_weight", "3")]
            .into_iter()
            .collect();
        let config = EngineConfig::try_from(&section).unwrap();
        assert_eq!(config.namespace.sublayer_weight, 4096);
        assert_eq!(config.filter_weight, 3);

        let section: SectionConfig = [("filter_weight", "70000")].into_iter().collect();
        assert!(EngineConfig::try_from(&section).is_err());
    }
}
