//! Configuration parsing for the harness.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use mdchain_config::MdParams;
use serde::{Deserialize, Serialize};

use crate::job::JobDescriptor;

/// Top-level configuration, after overrides have been merged in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessConfig {
    pub harness: HarnessSettings,
    pub job: JobDescriptor,
    #[serde(default)]
    pub md: MdParams,
}

/// Harness-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessSettings {
    /// Directory all stage artifacts live in. Relative paths resolve against the config file.
    #[serde(default = "default_workdir")]
    pub workdir: PathBuf,
    /// Chain state file, relative to `workdir`.
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    /// The `gmx` executable.
    #[serde(default = "default_gmx_binary")]
    pub gmx_binary: String,
    /// Directory holding the `.mdp` templates, relative to `workdir`.
    #[serde(default = "default_mdp_dir")]
    pub mdp_dir: PathBuf,
    /// Structure file the pipeline starts from.
    #[serde(default)]
    pub input_structure: Option<PathBuf>,
    /// Time reserved before the wall-clock limit for writing a checkpoint.
    #[serde(default = "default_safety_margin")]
    pub safety_margin_secs: u64,
    /// Time between SIGTERM and SIGKILL when mdrun overruns its budget.
    #[serde(default = "default_term_grace")]
    pub term_grace_secs: u64,
    /// `RUST_LOG` value to pass to scheduled attempts.
    #[serde(default)]
    pub rust_log: Option<String>,
    /// Where generated batch scripts are kept, relative to `workdir`.
    #[serde(default = "default_script_dir")]
    pub script_dir: PathBuf,
    #[serde(default)]
    pub analysis: AnalysisSettings,
}

/// Index group selections fed to the interactive analysis tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisSettings {
    #[serde(default = "default_protein_group")]
    pub center_group: String,
    #[serde(default = "default_system_group")]
    pub output_group: String,
    #[serde(default = "default_backbone_group")]
    pub fit_group: String,
    #[serde(default = "default_backbone_group")]
    pub rms_group: String,
    #[serde(default = "default_protein_group")]
    pub gyrate_group: String,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            center_group: default_protein_group(),
            output_group: default_system_group(),
            fit_group: default_backbone_group(),
            rms_group: default_backbone_group(),
            gyrate_group: default_protein_group(),
        }
    }
}

fn default_workdir() -> PathBuf {
    PathBuf::from(".")
}

fn default_state_file() -> PathBuf {
    PathBuf::from("mdchain_state.json")
}

fn default_gmx_binary() -> String {
    "gmx".to_string()
}

fn default_mdp_dir() -> PathBuf {
    PathBuf::from("mdp")
}

fn default_safety_margin() -> u64 {
    900
}

fn default_term_grace() -> u64 {
    120
}

fn default_script_dir() -> PathBuf {
    PathBuf::from(".mdchain")
}

fn default_protein_group() -> String {
    "Protein".to_string()
}

fn default_system_group() -> String {
    "System".to_string()
}

fn default_backbone_group() -> String {
    "Backbone".to_string()
}

/// Merge two TOML tables, with `overlay` values taking precedence.
fn merge_toml(base: &toml::Value, overlay: &toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(base_map), toml::Value::Table(overlay_map)) => {
            let mut merged = base_map.clone();
            for (k, v) in overlay_map {
                merged.insert(
                    k.clone(),
                    if let Some(base_v) = base_map.get(k) {
                        merge_toml(base_v, v)
                    } else {
                        v.clone()
                    },
                );
            }
            toml::Value::Table(merged)
        }
        (_, overlay) => overlay.clone(),
    }
}

/// Turn `md.temperature=310` into the nested table `{ md = { temperature = 310 } }`.
///
/// The value is read as a TOML literal when it parses as one and as a plain
/// string otherwise, so `md.force_field=charmm27` needs no quoting.
fn parse_override(spec: &str) -> Result<toml::Value, ConfigError> {
    let (path, raw) = spec
        .split_once('=')
        .ok_or_else(|| ConfigError::Override(spec.to_string()))?;
    let keys: Vec<&str> = path.trim().split('.').map(str::trim).collect();
    if keys.iter().any(|k| k.is_empty()) {
        return Err(ConfigError::Override(spec.to_string()));
    }

    let raw = raw.trim();
    let mut value = toml::from_str::<toml::Table>(&format!("v = {raw}"))
        .ok()
        .and_then(|mut t| t.remove("v"))
        .unwrap_or_else(|| toml::Value::String(raw.to_string()));

    for key in keys.iter().rev() {
        let mut table = toml::map::Map::new();
        table.insert((*key).to_string(), value);
        value = toml::Value::Table(table);
    }
    Ok(value)
}

impl HarnessConfig {
    /// Load configuration from a TOML file and apply `key.path=value` overrides.
    pub fn load(path: impl AsRef<Path>, overrides: &[String]) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.display().to_string(), e))?;
        let mut merged: toml::Value =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        for spec in overrides {
            merged = merge_toml(&merged, &parse_override(spec)?);
        }

        let mut config: Self = merged
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::Parse(e.to_string()))?;

        if config.harness.workdir.is_relative() {
            let base = path.parent().unwrap_or_else(|| Path::new("."));
            let base = if base.as_os_str().is_empty() {
                Path::new(".")
            } else {
                base
            };
            let base = std::fs::canonicalize(base)
                .map_err(|e| ConfigError::Io(base.display().to_string(), e))?;
            config.harness.workdir = base.join(&config.harness.workdir);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make the chain unable to make progress.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.job.budget(self.safety_margin()).is_none() {
            return Err(ConfigError::Invalid(format!(
                "safety margin of {}s leaves no time inside the {} wall-clock limit",
                self.harness.safety_margin_secs, self.job.walltime
            )));
        }
        if self.md.steps.md_steps == 0 {
            return Err(ConfigError::Invalid(
                "md_steps must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn safety_margin(&self) -> Duration {
        Duration::from_secs(self.harness.safety_margin_secs)
    }

    #[must_use]
    pub fn workdir(&self) -> &Path {
        &self.harness.workdir
    }

    #[must_use]
    pub fn state_file(&self) -> PathBuf {
        self.harness.workdir.join(&self.harness.state_file)
    }

    #[must_use]
    pub fn mdp_dir(&self) -> PathBuf {
        self.harness.workdir.join(&self.harness.mdp_dir)
    }

    #[must_use]
    pub fn script_dir(&self) -> PathBuf {
        self.harness.workdir.join(&self.harness.script_dir)
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Io(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid override {0:?}, expected key.path=value")]
    Override(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}
