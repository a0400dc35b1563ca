//! ---
//! vtnc_section: "01-core-functionality"
//! vtnc_subsection: "module"
//! vtnc_type: "source"
//! vtnc_scope: "code"
//! vtnc_description: "Shared primitives and utilities for the reconciliation core."
//! vtnc_version: "v0.0.0-prealpha"
//! vtnc_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::logging::LogFormat;

/// Highest label value a controller can carry on the wire.
pub const LABEL_CEILING: u32 = 4095;

fn default_bridge_label_capacity() -> u32 {
    4000
}

fn default_tunnel_label_capacity() -> u32 {
    4000
}

fn default_max_label() -> u32 {
    LABEL_CEILING
}

fn default_refresh_status() -> bool {
    true
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_startup_path() -> PathBuf {
    PathBuf::from("target/vtnc/startup.json")
}

/// Primary configuration object for the reconciliation core.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub allocator: AllocatorConfig,
    #[serde(default)]
    pub commit: CommitConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub controllers: IndexMap<String, ControllerConfig>,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &'static str = "VTNC_CONFIG";

    /// Load configuration from disk, respecting the `VTNC_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        contents
            .parse::<AppConfig>()
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Retrieve a controller configuration by identifier.
    pub fn controller(&self, controller_id: &str) -> Option<&ControllerConfig> {
        self.controllers.get(controller_id)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.allocator.validate()?;
        for (controller_id, controller) in &self.controllers {
            controller.validate(controller_id)?;
        }
        Ok(())
    }

    /// SHA-256 digest of the serialised configuration, hex encoded.
    pub fn digest(&self) -> Result<String> {
        let serialised =
            toml::to_string(self).with_context(|| "failed to serialise configuration for hashing")?;
        let mut hasher = Sha256::new();
        hasher.update(serialised.as_bytes());
        Ok(format!("{:x}", hasher.finalize()))
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Default pool sizing for the label allocator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocatorConfig {
    /// Capacity of a VTN's bridge-label pool when no override record exists.
    #[serde(default = "default_bridge_label_capacity")]
    pub bridge_label_capacity: u32,
    /// Capacity of a spine domain's tunnel-label pool when no override record exists.
    #[serde(default = "default_tunnel_label_capacity")]
    pub tunnel_label_capacity: u32,
    /// Labels are handed out from `1..=max_label`.
    #[serde(default = "default_max_label")]
    pub max_label: u32,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            bridge_label_capacity: default_bridge_label_capacity(),
            tunnel_label_capacity: default_tunnel_label_capacity(),
            max_label: default_max_label(),
        }
    }
}

impl AllocatorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_label == 0 || self.max_label > LABEL_CEILING {
            return Err(anyhow!(
                "allocator max_label must be within 1..={}, got {}",
                LABEL_CEILING,
                self.max_label
            ));
        }
        for (name, capacity) in [
            ("bridge_label_capacity", self.bridge_label_capacity),
            ("tunnel_label_capacity", self.tunnel_label_capacity),
        ] {
            if capacity == 0 {
                return Err(anyhow!("allocator {} must be greater than zero", name));
            }
            if capacity > self.max_label {
                return Err(anyhow!(
                    "allocator {} ({}) exceeds max_label ({})",
                    name,
                    capacity,
                    self.max_label
                ));
            }
        }
        Ok(())
    }
}

/// How the commit engine treats a controller that is not connected.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DisconnectedPolicy {
    /// Promote the record with `NOT_APPLIED` status and leave it for audit.
    #[default]
    MarkNotApplied,
    /// Treat the disconnection as a per-record dispatch failure.
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CommitConfig {
    #[serde(default)]
    pub disconnected_policy: DisconnectedPolicy,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Promote records the controller already holds from `NOT_APPLIED` to `APPLIED`.
    #[serde(default = "default_refresh_status")]
    pub refresh_status: bool,
    /// Wall-clock budget for one audit pass; polled alongside the external signal.
    #[serde(default)]
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    pub max_duration: Option<Duration>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            refresh_status: default_refresh_status(),
            max_duration: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Location of the persisted STARTUP partition.
    #[serde(default = "default_startup_path")]
    pub startup_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            startup_path: default_startup_path(),
        }
    }
}

/// Controller driver family.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum ControllerKind {
    #[default]
    Odc,
    Pfc,
    Vnp,
    Generic,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ControllerConfig {
    #[serde(default)]
    pub kind: ControllerKind,
    #[serde(default)]
    pub domains: Vec<String>,
    /// Attributes this controller cannot carry, keyed by key-type name.
    #[serde(default)]
    pub unsupported_attributes: IndexMap<String, Vec<String>>,
}

impl ControllerConfig {
    pub fn validate(&self, controller_id: &str) -> Result<()> {
        if self.domains.is_empty() {
            return Err(anyhow!(
                "controller '{}' must declare at least one domain",
                controller_id
            ));
        }
        if self.domains.iter().any(|domain| domain.trim().is_empty()) {
            return Err(anyhow!(
                "controller '{}' declares an empty domain identifier",
                controller_id
            ));
        }
        Ok(())
    }

    /// Whether the controller can carry `attribute` for the given key-type name.
    pub fn supports(&self, key_type: &str, attribute: &str) -> bool {
        self.unsupported_attributes
            .get(key_type)
            .map_or(true, |attrs| !attrs.iter().any(|attr| attr == attribute))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [allocator]
        bridge_label_capacity = 100
        tunnel_label_capacity = 200

        [commit]
        disconnected_policy = "fail"

        [audit]
        max_duration = 30

        [controllers.ctrlr-x]
        kind = "pfc"
        domains = ["dom-d"]
        unsupported_attributes = { vbridge = ["description"] }
    "#;

    #[test]
    fn parses_sample_configuration() {
        let config: AppConfig = SAMPLE.parse().unwrap();
        assert_eq!(config.allocator.bridge_label_capacity, 100);
        assert_eq!(config.allocator.max_label, LABEL_CEILING);
        assert_eq!(config.commit.disconnected_policy, DisconnectedPolicy::Fail);
        assert_eq!(config.audit.max_duration, Some(Duration::from_secs(30)));
        assert!(config.audit.refresh_status);
        let controller = config.controller("ctrlr-x").unwrap();
        assert_eq!(controller.kind, ControllerKind::Pfc);
        assert!(!controller.supports("vbridge", "description"));
        assert!(controller.supports("vtn", "description"));
    }

    #[test]
    fn empty_document_uses_defaults() {
        let config: AppConfig = "".parse().unwrap();
        assert_eq!(config.allocator.tunnel_label_capacity, 4000);
        assert_eq!(config.commit.disconnected_policy, DisconnectedPolicy::MarkNotApplied);
        assert!(config.controllers.is_empty());
    }

    #[test]
    fn rejects_capacity_above_max_label() {
        let err = "[allocator]\nbridge_label_capacity = 5000\n"
            .parse::<AppConfig>()
            .unwrap_err();
        assert!(format!("{err:#}").contains("exceeds max_label"));
    }

    #[test]
    fn rejects_controller_without_domains() {
        let err = "[controllers.c1]\nkind = \"odc\"\n"
            .parse::<AppConfig>()
            .unwrap_err();
        assert!(format!("{err:#}").contains("at least one domain"));
    }

    #[test]
    fn loads_first_existing_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vtnc.toml");
        fs::write(&path, SAMPLE).unwrap();
        let missing = dir.path().join("missing.toml");
        let loaded = AppConfig::load_with_source(&[missing, path.clone()]).unwrap();
        assert_eq!(loaded.source, path);
        assert_eq!(loaded.config.allocator.tunnel_label_capacity, 200);
    }

    #[test]
    fn digest_is_stable() {
        let config: AppConfig = SAMPLE.parse().unwrap();
        assert_eq!(config.digest().unwrap(), config.clone().digest().unwrap());
        assert_eq!(config.digest().unwrap().len(), 64);
    }
}
