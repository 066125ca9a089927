//! TOML loading for [`HostConfig`].
//!
//! The config struct itself lives in `remod-api` (modules read it through
//! `Host::config`); this module layers file parsing and defaults on top.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use remod_api::HostConfig;
use serde::Deserialize;

use crate::error::ConfigError;

/// On-disk shape. Every field optional; absent fields keep their default.
#[derive(Debug, Default, Deserialize)]
struct HostConfigFile {
    modules_path: Option<PathBuf>,
    build_path: Option<PathBuf>,
    compiler_command: Option<String>,
    include_dirs: Option<Vec<PathBuf>>,
    thread_pool_workers: Option<usize>,
    skip_compile: Option<BTreeSet<String>>,
}

impl HostConfigFile {
    fn merge_into(self, mut config: HostConfig) -> HostConfig {
        if let Some(v) = self.modules_path {
            config.modules_path = v;
        }
        if let Some(v) = self.build_path {
            config.build_path = v;
        }
        if let Some(v) = self.compiler_command {
            config.compiler_command = v;
        }
        if let Some(v) = self.include_dirs {
            config.include_dirs = v;
        }
        if let Some(v) = self.thread_pool_workers {
            config.thread_pool_workers = v;
        }
        if let Some(v) = self.skip_compile {
            config.skip_compile = v;
        }
        config
    }
}

/// Load a config file over the defaults.
pub fn load_config(path: &Path) -> Result<HostConfig, ConfigError> {
    let text = std::fs::read_to_string(path)?;
    parse_config(&text)
}

/// Parse config text over the defaults.
pub fn parse_config(text: &str) -> Result<HostConfig, ConfigError> {
    let file: HostConfigFile = toml::from_str(text)?;
    Ok(file.merge_into(HostConfig::default()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_is_defaults() {
        let config = parse_config("").unwrap();
        let defaults = HostConfig::default();
        assert_eq!(config.compiler_command, defaults.compiler_command);
        assert_eq!(config.thread_pool_workers, defaults.thread_pool_workers);
    }

    #[test]
    fn fields_override_defaults() {
        let config = parse_config(
            r#"
            modules_path = "game/modules"
            compiler_command = "rustc-1.75"
            thread_pool_workers = 8
            skip_compile = ["worldgen"]
            "#,
        )
        .unwrap();
        assert_eq!(config.modules_path, PathBuf::from("game/modules"));
        assert_eq!(config.compiler_command, "rustc-1.75");
        assert_eq!(config.thread_pool_workers, 8);
        assert!(config.skip_compile.contains("worldgen"));
    }

    #[test]
    fn rejects_malformed_toml() {
        assert!(parse_config("modules_path = [").is_err());
    }
}
