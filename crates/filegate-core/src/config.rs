//! Per-section configuration map with typed accessors.

use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;

use thiserror::Error;

/// Configuration of one section of the agent config file.
#[derive(Debug, Clone, Default)]
pub struct SectionConfig {
    inner: HashMap<String, String>,
}

#[derive(Error, Debug, Clone)]
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
    pub fn insert(&mut self, key: String, value: String) -> Option<String> {
        self.inner.insert(key, value)
    }

    /// Returns an option of raw configuration value.
    pub fn get_raw(&self, name: &str) -> Option<&str> {
        self.inner.get(name).map(String::as_str)
    }

    /// Returns a typed configuration value.
    pub fn required<T>(&self, name: &str) -> Result<T, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        match self.inner.get(name) {
            None => Err(ConfigError::RequiredValue {
                field: name.to_string(),
            }),
            Some(value) => parse(value, name),
        }
    }

    /// Returns a typed configuration value, falling back to a default
    /// when the field is missing.
    pub fn with_default<T>(&self, name: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        match self.inner.get(name) {
            None => Ok(default),
            Some(value) => parse(value, name),
        }
    }

    /// Return a comma separated list of values. Missing field means an
    /// empty list.
    pub fn get_list<T>(&self, name: &str) -> Result<Vec<T>, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        self.inner
            .get(name)
            .iter()
            .flat_map(|config| config.split(','))
            .filter(|item| !item.is_empty())
            .map(|item| parse(item.trim(), name))
            .collect()
    }
}

fn parse<T>(value: &str, name: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    <T as FromStr>::Err: Display,
{
    T::from_str(value).map_err(|err| ConfigError::InvalidValue {
        field: name.to_string(),
        value: value.to_string(),
        err: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section(pairs: &[(&str, &str)]) -> SectionConfig {
        let mut cfg = SectionConfig::default();
        for (k, v) in pairs {
            cfg.insert(k.to_string(), v.to_string());
        }
        cfg
    }

    #[test]
    fn typed_accessors() {
        let cfg = section(&[("enabled", "true"), ("paths", "/etc, /bin,")]);
        assert!(cfg.required::<bool>("enabled").unwrap());
        assert!(cfg.with_default("trace", false).unwrap() == false);
        assert_eq!(
            cfg.get_list::<String>("paths").unwrap(),
            vec!["/etc".to_string(), "/bin".to_string()]
        );
        assert!(matches!(
            cfg.required::<bool>("missing"),
            Err(ConfigError::RequiredValue { .. })
        ));
        assert!(matches!(
            section(&[("enabled", "yep")]).required::<bool>("enabled"),
            Err(ConfigError::InvalidValue { .. })
        ));
    }
}
