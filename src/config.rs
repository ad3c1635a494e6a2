//! Runtime configuration, loadable from a TOML file or left as `Default`.
//! A plain serde-derived settings struct rather than a builder, using the
//! `Serialize`/`Deserialize` derive pattern shared across the pack.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::{GPError, GPResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// CUDA device ordinal used by `Context::new_cuda`.
    pub device_index: usize,
    /// Default dtype for factories that don't pin one explicitly.
    pub default_dtype_name: String,
    /// Emit generated fused-kernel CUDA source via `tracing::debug!` before
    /// compiling it.
    pub log_kernel_source: bool,
    /// Overrides the backend's threadgroup-size heuristic; `None` lets the
    /// backend pick (pipeline.maxTotalThreadsPerThreadgroup-equivalent).
    pub thread_group_size: Option<u32>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            device_index: 0,
            default_dtype_name: "f32".to_string(),
            log_kernel_source: false,
            thread_group_size: None,
        }
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> GPResult<Config> {
        toml::from_str(s).map_err(|e| GPError::Config(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> GPResult<Config> {
        let text = std::fs::read_to_string(path)?;
        Config::from_toml_str(&text)
    }

    pub fn from_env() -> Config {
        let mut config = Config::default();
        if let Ok(v) = std::env::var("TENSORGRAPH_DEVICE_INDEX") {
            if let Ok(parsed) = v.parse() {
                config.device_index = parsed;
            }
        }
        if let Ok(v) = std::env::var("TENSORGRAPH_LOG_KERNEL_SOURCE") {
            config.log_kernel_source = v == "1" || v.eq_ignore_ascii_case("true");
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_f32_dtype() {
        let c = Config::default();
        assert_eq!(c.default_dtype_name, "f32");
    }

    #[test]
    fn parses_partial_toml_with_defaults() {
        let c = Config::from_toml_str("device_index = 2\n").unwrap();
        assert_eq!(c.device_index, 2);
        assert!(!c.log_kernel_source);
    }

    #[test]
    fn rejects_malformed_toml() {
        assert!(Config::from_toml_str("not valid = = toml").is_err());
    }
}
