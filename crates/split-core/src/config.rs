use std::{
    collections::HashMap,
    fmt::Display,
    str::FromStr,
};

use thiserror::Error;

/// Raw key/value pairs of one configuration file section.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SectionConfig {
    inner: HashMap<String, String>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("field {field} is required")]
    RequiredValue { field: String },
    #[error("{value} is not a valid value for field {field}: {err}")]
    InvalidValue {
        field: String,
        value: String,
        err: String,
    },
}

impl SectionConfig {
    /// Inserts a new configuration value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.inner.insert(key.into(), value.into())
    }

    /// Returns an option of raw configuration value.
    pub fn get_raw(&self, config_name: &str) -> Option<&str> {
        self.inner.get(config_name).map(String::as_str)
    }

    /// Returns a typed configuration value.
    pub fn required<T>(&self, config_name: &str) -> Result<T, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        match self.inner.get(config_name) {
            None => Err(ConfigError::RequiredValue {
                field: config_name.to_string(),
            }),
            Some(value) => parse(value, config_name),
        }
    }

    /// Returns an optional typed configuration value. An empty value counts as missing.
    pub fn optional<T>(&self, config_name: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        self.inner
            .get(config_name)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
            .map(|value| parse(value, config_name))
            .transpose()
    }

    /// Returns a typed configuration value, or `default` if the field is missing.
    pub fn with_default<T>(&self, config_name: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        Ok(self.optional(config_name)?.unwrap_or(default))
    }

    /// Return a comma separed list of values. Return empty vector if field is missing.
    pub fn get_list<T>(&self, config_name: &str) -> Result<Vec<T>, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        self.inner
            .get(config_name)
            .iter()
            .flat_map(|config| config.split(','))
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(|item| parse(item, config_name))
            .collect()
    }
}

impl<K, V> FromIterator<(K, V)> for SectionConfig
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            inner: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

fn parse<T>(value: &str, config_name: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    <T as FromStr>::Err: Display,
{
    T::from_str(value).map_err(|err| ConfigError::InvalidValue {
        field: config_name.to_string(),
        value: value.to_string(),
        err: err.to_string(),
    })
}
