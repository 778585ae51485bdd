//! Layered configuration.
//!
//! The configuration is a YAML mapping built from up to three layers: the
//! default file compiled into the binary, an optional user file, and the
//! overrides derived from command-line flags. Layers are combined with
//! [`deep_merge`]. Once built, a [`Config`] is never mutated; share it behind
//! an `Arc`.

use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_yaml::{Mapping, Value};

use crate::error::ConfigError;

/// Default configuration shipped with the crate.
pub const DEFAULT_CONFIG_YAML: &str = include_str!("../config/default.yaml");

/// One component category forwarded to the external perf analysis.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct KindCategory {
    pub name: String,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub thread: Option<serde_json::Value>,
}

/// Immutable, merged configuration values.
#[derive(Debug, Clone)]
pub struct Config {
    values: Value,
}

impl Default for Config {
    fn default() -> Self {
        // The embedded file is covered by tests; failing to parse it is a build defect.
        Self::from_layers(&[("<default>", DEFAULT_CONFIG_YAML)])
            .unwrap_or(Self {
                values: Value::Mapping(Mapping::new()),
            })
    }
}

impl Config {
    /// Load the default configuration and overlay `user_path` if given.
    ///
    /// A user path that does not exist is an error: silently ignoring a
    /// mistyped `--config` would run with the wrong settings.
    pub fn load(user_path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Self::from_layers(&[("<default>", DEFAULT_CONFIG_YAML)])?;
        if let Some(path) = user_path {
            let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            let layer = parse_layer(&path.display().to_string(), &text)?;
            deep_merge(&mut config.values, layer);
        }
        Ok(config)
    }

    /// Build a configuration from YAML texts, later layers winning.
    pub fn from_layers(layers: &[(&str, &str)]) -> Result<Self, ConfigError> {
        let mut values = Value::Mapping(Mapping::new());
        for (origin, text) in layers {
            deep_merge(&mut values, parse_layer(origin, text)?);
        }
        Ok(Self { values })
    }

    /// Return a copy with `value` set at the dotted `path`.
    ///
    /// Used while assembling command-line overrides, before the configuration
    /// is shared.
    pub fn with_override(mut self, path: &str, value: impl Into<Value>) -> Self {
        let mut overlay = value.into();
        for key in path.split('.').rev() {
            let mut map = Mapping::new();
            map.insert(Value::String(key.to_string()), overlay);
            overlay = Value::Mapping(map);
        }
        deep_merge(&mut self.values, overlay);
        self
    }

    /// Look up a dotted path such as `hiperf.event`. Explicit nulls read as absent.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut current = &self.values;
        for key in path.split('.') {
            current = current.as_mapping()?.get(key)?;
        }
        if current.is_null() {
            None
        } else {
            Some(current)
        }
    }

    /// Deserialize the value at `path`, or `None` when it is absent.
    pub fn get_as<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, ConfigError> {
        match self.get(path) {
            None => Ok(None),
            Some(value) => serde_yaml::from_value(value.clone())
                .map(Some)
                .map_err(|e| ConfigError::Invalid {
                    key: path.to_string(),
                    message: e.to_string(),
                }),
        }
    }

    fn string_or(&self, path: &str, default: &str) -> String {
        self.get(path)
            .and_then(Value::as_str)
            .unwrap_or(default)
            .to_string()
    }

    pub fn hiperf_data_filename(&self) -> String {
        self.string_or("hiperf.data_filename", "perf.data")
    }

    pub fn hiperf_db_filename(&self) -> String {
        self.string_or("hiperf.db_filename", "perf.db")
    }

    /// Hardware event name, `None` when unset or empty.
    pub fn hiperf_event(&self) -> Option<String> {
        self.get("hiperf.event")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }

    pub fn trace_enabled(&self) -> bool {
        self.get("trace.enable")
            .and_then(Value::as_bool)
            .unwrap_or(true)
    }

    pub fn so_dir(&self) -> Option<PathBuf> {
        self.get("so_dir").and_then(Value::as_str).map(PathBuf::from)
    }

    pub fn kind(&self) -> Result<Option<Vec<KindCategory>>, ConfigError> {
        self.get_as("kind")
    }

    pub fn run_testcases(&self) -> Result<Vec<String>, ConfigError> {
        Ok(self.get_as("run_testcases")?.unwrap_or_default())
    }

    pub fn rounds(&self) -> u32 {
        self.get("rounds")
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(5)
    }

    pub fn max_round_retries(&self) -> u32 {
        self.get("max_round_retries")
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(5)
    }

    pub fn toolbox_node(&self) -> String {
        self.string_or("toolbox.node", "node")
    }

    pub fn toolbox_cmd(&self) -> PathBuf {
        PathBuf::from(self.string_or("toolbox.cmd", "hapray-toolbox/hapray-cmd.js"))
    }

    pub fn report_template(&self) -> PathBuf {
        PathBuf::from(self.string_or(
            "toolbox.template",
            "hapray-toolbox/res/report_template.html",
        ))
    }

    pub fn trace_streamer(&self) -> Option<PathBuf> {
        self.get("trace_streamer")
            .and_then(Value::as_str)
            .map(PathBuf::from)
    }

    pub fn driver_command(&self) -> Result<Vec<String>, ConfigError> {
        Ok(self.get_as("driver.command")?.unwrap_or_default())
    }
}

fn parse_layer(origin: &str, text: &str) -> Result<Value, ConfigError> {
    let value: Value = serde_yaml::from_str(text).map_err(|source| ConfigError::Yaml {
        origin: origin.to_string(),
        source,
    })?;
    match value {
        // An empty document is an empty layer.
        Value::Null => Ok(Value::Mapping(Mapping::new())),
        Value::Mapping(_) => Ok(value),
        other => Err(ConfigError::Invalid {
            key: origin.to_string(),
            message: format!("top level must be a mapping, got {other:?}"),
        }),
    }
}

/// Merge `overlay` into `base`.
///
/// Two mappings merge recursively key by key; in every other case the
/// overlay value replaces the base value, so lists are replaced rather than
/// concatenated.
pub fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                let nested = value.is_mapping()
                    && base_map.get(&key).is_some_and(Value::is_mapping);
                if nested {
                    if let Some(existing) = base_map.get_mut(&key) {
                        deep_merge(existing, value);
                    }
                } else {
                    base_map.insert(key, value);
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}
