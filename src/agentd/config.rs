//! Agent configuration.
//!
//! Backed by an INI file; each section becomes a
//! [`SectionConfig`](filegate_core::config::SectionConfig) with typed
//! accessors.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use ini::Ini;

use filegate_core::config::SectionConfig;

const DEFAULT_CONFIG_FILE: &str = "/etc/filegate/filegate.ini";

#[derive(Debug, Clone, Default)]
pub struct AgentConfig {
    sections: HashMap<String, SectionConfig>,
}

impl AgentConfig {
    /// Load the default configuration file. A missing file simply
    /// yields the built-in defaults.
    pub fn new() -> Result<Self> {
        let path = PathBuf::from(DEFAULT_CONFIG_FILE);
        if !path.exists() {
            log::debug!("no configuration at {DEFAULT_CONFIG_FILE}, using defaults");
            return Ok(Self::default());
        }
        Self::from_config_file(&path)
    }

    /// Load an explicitly named configuration file, which must exist.
    pub fn with_custom_file(config_file: &str) -> Result<Self> {
        let path = PathBuf::from(config_file);
        if !path.exists() {
            bail!("configuration file {config_file} not found");
        }
        Self::from_config_file(&path)
    }

    fn from_config_file(path: &Path) -> Result<Self> {
        let conf = Ini::load_from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?;

        let mut sections: HashMap<String, SectionConfig> = HashMap::new();
        for (section, prop) in &conf {
            if let Some(section) = section {
                let entry = sections.entry(section.to_string()).or_default();
                for (key, value) in prop.iter() {
                    log::debug!("{section}.{key}={value}");
                    entry.insert(key.to_string(), value.to_string());
                }
            }
        }
        Ok(AgentConfig { sections })
    }

    /// Configuration of one section; missing sections act empty.
    pub fn section(&self, name: &str) -> SectionConfig {
        self.sections.get(name).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn sections_parse_into_typed_configs() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[monitor]").unwrap();
        writeln!(file, "enabled = true").unwrap();
        writeln!(file, "mode = enforce").unwrap();
        file.flush().unwrap();

        let config = AgentConfig::with_custom_file(file.path().to_str().unwrap()).unwrap();
        let monitor = config.section("monitor");
        assert!(monitor.required::<bool>("enabled").unwrap());
        assert_eq!(monitor.get_raw("mode"), Some("enforce"));
        assert!(config.section("missing").get_raw("anything").is_none());
    }

    #[test]
    fn missing_custom_file_is_an_error() {
        assert!(AgentConfig::with_custom_file("/does/not/exist.ini").is_err());
    }
}
