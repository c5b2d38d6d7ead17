//! TOML configuration for anomalytriage.
//!
//! Every section is optional; missing keys take their compiled-in defaults.
//! The file is located through `--config`, then the `ANOMALYTRIAGE_CONFIG`
//! environment variable, then `./anomalytriage.toml`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::calibrate::CalibrationConfig;
use crate::classify::SeverityTiers;
use crate::session::runner::AnalysisSettings;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "ANOMALYTRIAGE_CONFIG";
/// Config file picked up from the working directory.
pub const LOCAL_CONFIG: &str = "anomalytriage.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriageConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub calibration: CalibrationConfig,
    #[serde(default)]
    pub classification: SeverityTiers,
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl TriageConfig {
    /// Load and validate configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config file: {}", path.display()))?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Resolve configuration, in order:
    /// 1. `explicit`, when given. Errors are returned, not skipped.
    /// 2. The path in `ANOMALYTRIAGE_CONFIG`.
    /// 3. `./anomalytriage.toml`.
    /// 4. Compiled-in defaults.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "ANOMALYTRIAGE_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let local = Path::new(LOCAL_CONFIG);
        if local.exists() {
            return Self::load(local);
        }

        debug!("No config file found, using compiled-in defaults");
        Ok(Self::default())
    }

    pub fn validate(&self) -> Result<()> {
        self.calibration.validate()?;
        self.classification.validate()?;
        Ok(())
    }

    /// Session settings derived from this config.
    pub fn analysis_settings(&self) -> AnalysisSettings {
        AnalysisSettings {
            calibration: self.calibration.clone(),
            tiers: self.classification,
            top_n: self.report.top_n,
        }
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file; ignored by the memory backend.
    pub db_path: PathBuf,
    pub backend: StorageBackend,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/anomalytriage.db"),
            backend: StorageBackend::Sqlite,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Sqlite,
    /// Process-local; everything is lost on exit.
    Memory,
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    /// Anomalies listed in detail per report.
    pub top_n: usize,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self { top_n: 20 }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
