//! Converter definition file.

use anyhow::{Context, Result, bail};
use indexmap::IndexMap;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Name of the definition file looked up in the working directory.
pub const LOCAL_FILE: &str = "osmosis.toml";

/// Main configuration structure.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreSection,
    pub executor: ExecutorSection,
    pub steps: Vec<StepConfig>,
    /// Where this config was read from; relative paths resolve against its directory.
    #[serde(skip)]
    source: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// Main store database file.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ExecutorSection {
    pub workers: Option<usize>,
    pub queue_capacity: Option<usize>,
    /// Worker channel framing: `msgpack` or `jsonl`.
    pub codec: Option<String>,
    /// Parent directory for per-run shard directories.
    pub scratch_dir: Option<PathBuf>,
}

/// One JSON Lines import step.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepConfig {
    pub name: String,
    pub title: Option<String>,
    /// Files or glob patterns, read in sorted order.
    #[serde(default)]
    pub sources: Vec<String>,
    /// Record kind to write; defaults to the step name.
    pub kind: Option<String>,
    /// Field holding each row's natural key.
    #[serde(default = "default_key")]
    pub key: String,
    #[serde(default)]
    pub parallel: bool,
    /// Show progress as a percentage. Needs `count`.
    #[serde(default)]
    pub percent: bool,
    /// Count rows up front so progress has a total.
    #[serde(default)]
    pub count: bool,
    /// Fields that should be present; a missing one is a warning.
    #[serde(default)]
    pub required: Vec<String>,
    /// Source field name -> output field name.
    #[serde(default)]
    pub rename: IndexMap<String, String>,
    /// Fields left out of the output record.
    #[serde(default)]
    pub drop: Vec<String>,
}

fn default_key() -> String {
    "id".to_string()
}

impl Config {
    /// Load from `explicit`, or discover `osmosis.toml` in the working
    /// directory, then the user's config dir. No file at all is an empty config.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            if !path.exists() {
                bail!("config file {} does not exist", path.display());
            }
            return Self::load_from_path(path);
        }

        let local = PathBuf::from(LOCAL_FILE);
        let found = std::iter::once(Some(local))
            .chain(std::iter::once(Self::default_path()))
            .flatten()
            .find(|p| p.is_file());
        match found {
            Some(path) => Self::load_from_path(&path),
            None => Ok(Self::default()),
        }
    }

    /// Load config from a specific path.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.source = Some(std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf()));
        config.validate()?;
        Ok(config)
    }

    /// Get the default config file path.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("osmosis").join("config.toml"))
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Resolve `path` against the config file's directory.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            return path.to_path_buf();
        }
        match self.source.as_deref().and_then(Path::parent) {
            Some(base) => base.join(path),
            None => path.to_path_buf(),
        }
    }

    fn validate(&self) -> Result<()> {
        for (i, step) in self.steps.iter().enumerate() {
            if step.name.trim().is_empty() {
                bail!("step #{} has an empty name", i + 1);
            }
            if self.steps[..i].iter().any(|s| s.name == step.name) {
                bail!("step '{}' is defined twice", step.name);
            }
        }
        Ok(())
    }
}
