use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use dotenvy::dotenv;
use serde::{Deserialize, Deserializer};

use crate::perms::MatchingPolicy;

/// File locations, overridable through the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    pub config: PathBuf,
    pub permissions: PathBuf,
    pub database: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            config: PathBuf::from("config.yml"),
            permissions: PathBuf::from("permissions.yml"),
            database: PathBuf::from("db.msgpack"),
        }
    }
}

impl Paths {
    /// Read `BEYMAX_CONFIG_PATH`, `BEYMAX_PERMISSIONS_PATH` and
    /// `BEYMAX_DB_PATH`, falling back to the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            config: env::var_os("BEYMAX_CONFIG_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.config),
            permissions: env::var_os("BEYMAX_PERMISSIONS_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.permissions),
            database: env::var_os("BEYMAX_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct Settings {
    prefix: String,
    name: Option<String>,
    channels: BTreeMap<String, String>,
    #[serde(deserialize_with = "one_or_many")]
    ignore_role: Vec<String>,
    disable_delimiters: bool,
    send_traces: bool,
    permissions_matching: MatchingPolicy,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

fn one_or_many<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(reference) => vec![reference],
        OneOrMany::Many(references) => references,
    })
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            prefix: "!".to_string(),
            name: None,
            channels: BTreeMap::new(),
            ignore_role: Vec::new(),
            disable_delimiters: false,
            send_traces: false,
            permissions_matching: MatchingPolicy::default(),
        }
    }
}

/// Bot configuration loaded from a YAML file.
///
/// Well-known keys are parsed into fields. The whole document is kept so
/// suites can read their own sections with [`Config::get`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Command prefix, `!` unless configured.
    pub prefix: String,
    pub name: Option<String>,
    /// Channel reference name -> channel name or id.
    pub channels: BTreeMap<String, String>,
    /// Role names or ids whose holders are ignored. Accepts a single
    /// reference or a list.
    pub ignore_role: Vec<String>,
    /// Split command arguments on whitespace even when a command declares a
    /// delimiter.
    pub disable_delimiters: bool,
    /// Post handler failures to the `dev` channel reference.
    pub send_traces: bool,
    pub permissions_matching: MatchingPolicy,
    pub paths: Paths,
    raw: serde_yaml::Value,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_settings(Settings::default(), serde_yaml::Value::Null, Paths::default())
    }
}

impl Config {
    /// Load configuration using paths from the environment.
    ///
    /// A missing config file yields the defaults.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let paths = Paths::from_env();
        if paths.config.exists() {
            let mut config = Self::from_path(&paths.config)?;
            config.paths = paths;
            Ok(config)
        } else {
            tracing::warn!(path = %paths.config.display(), "config file not found, using defaults");
            Ok(Self {
                paths,
                ..Self::default()
            })
        }
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let mut config = Self::from_yaml_str(&text)
            .with_context(|| format!("invalid config file {}", path.display()))?;
        config.paths.config = path.to_path_buf();
        Ok(config)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let raw: serde_yaml::Value = serde_yaml::from_str(text).context("config is not valid YAML")?;
        let settings: Settings = if raw.is_null() {
            Settings::default()
        } else {
            serde_yaml::from_value(raw.clone()).context("config has invalid settings")?
        };
        Ok(Self::from_settings(settings, raw, Paths::default()))
    }

    fn from_settings(settings: Settings, raw: serde_yaml::Value, paths: Paths) -> Self {
        Self {
            prefix: settings.prefix,
            name: settings.name,
            channels: settings.channels,
            ignore_role: settings.ignore_role,
            disable_delimiters: settings.disable_delimiters,
            send_traces: settings.send_traces,
            permissions_matching: settings.permissions_matching,
            paths,
            raw,
        }
    }

    /// Look up a nested value, e.g. `config.get(&["games", "poker", "blind"])`.
    pub fn get(&self, keys: &[&str]) -> Option<&serde_yaml::Value> {
        keys.iter()
            .try_fold(&self.raw, |value, key| value.as_mapping()?.get(*key))
    }

    /// Nested lookup deserialized into `T`. `None` if absent or mistyped.
    pub fn get_as<T: serde::de::DeserializeOwned>(&self, keys: &[&str]) -> Option<T> {
        self.get(keys)
            .and_then(|value| serde_yaml::from_value(value.clone()).ok())
    }

    pub fn with_paths(mut self, paths: Paths) -> Self {
        self.paths = paths;
        self
    }
}
