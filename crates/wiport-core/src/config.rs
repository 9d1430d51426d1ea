use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level migration settings, read from `wiport.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Destination project; also the first segment of written
    /// classification paths.
    #[serde(default = "default_project")]
    pub project: String,
    #[serde(default = "default_process_template")]
    pub process_template: String,
    #[serde(default)]
    pub base_area_path: String,
    #[serde(default)]
    pub base_iteration_path: String,
    /// Downgrade "link target not yet migrated" from error to warning.
    #[serde(default)]
    pub ignore_failed_links: bool,
    #[serde(default)]
    pub replay: ReplayConfig,
    #[serde(default)]
    pub setup: SetupConfig,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            project: default_project(),
            process_template: default_process_template(),
            base_area_path: String::new(),
            base_iteration_path: String::new(),
            ignore_failed_links: false,
            replay: ReplayConfig::default(),
            setup: SetupConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Preferred offset of a description-correction edit after its revision.
    #[serde(default = "default_correction_delta_ms")]
    pub correction_delta_ms: u64,
    /// Work item types whose narrative body lives in the repro-steps field.
    #[serde(default = "default_repro_steps_types")]
    pub repro_steps_types: Vec<String>,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            correction_delta_ms: default_correction_delta_ms(),
            repro_steps_types: default_repro_steps_types(),
        }
    }
}

impl ReplayConfig {
    #[must_use]
    pub const fn correction_delta(&self) -> Duration {
        Duration::from_millis(self.correction_delta_ms)
    }

    /// Worker count, never below one.
    #[must_use]
    pub fn effective_workers(&self) -> usize {
        self.workers.max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupConfig {
    #[serde(default)]
    pub create_project_if_missing: bool,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
}

impl Default for SetupConfig {
    fn default() -> Self {
        Self {
            create_project_if_missing: false,
            poll_interval_ms: default_poll_interval_ms(),
            max_wait_ms: default_max_wait_ms(),
        }
    }
}

impl SetupConfig {
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub const fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

fn default_project() -> String {
    "Migrated".to_string()
}

fn default_process_template() -> String {
    "Scrum".to_string()
}

const fn default_workers() -> usize {
    4
}

const fn default_correction_delta_ms() -> u64 {
    50
}

fn default_repro_steps_types() -> Vec<String> {
    vec!["Bug".to_string()]
}

const fn default_poll_interval_ms() -> u64 {
    5_000
}

const fn default_max_wait_ms() -> u64 {
    30_000
}

/// Read and parse a config file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or is not valid TOML for
/// [`MigrationConfig`].
pub fn load_config(path: &Path) -> Result<MigrationConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    toml::from_str::<MigrationConfig>(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))
}

/// Default per-user config location: `<config_dir>/wiport/config.toml`.
#[must_use]
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("wiport/config.toml"))
}

/// Resolve the effective config.
///
/// Precedence: an explicit path (must exist), then the per-user config file
/// if present, then built-in defaults.
///
/// # Errors
///
/// Returns an error if the chosen file cannot be read or parsed.
pub fn resolve_config(explicit: Option<&Path>) -> Result<MigrationConfig> {
    if let Some(path) = explicit {
        return load_config(path);
    }

    match user_config_path() {
        Some(path) if path.exists() => load_config(&path),
        _ => Ok(MigrationConfig::default()),
    }
}
