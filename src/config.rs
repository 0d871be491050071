// ⚙️ Analysis Configuration
// Loaded from YAML or JSON, adjusted by environment presets and GST_* overrides.
//
// Validation happens before any I/O: a bad threshold or an empty root id is a
// startup error, never a half-finished run.

use crate::classifier::{RiskWeights, ThresholdBand};
use crate::error::{AnalysisError, AnalysisResult};
use crate::parser::LoaderSettings;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

pub const DEFAULT_ROOT_NODE_ID: &str = "AAYCA4390A";
pub const DEFAULT_BOGUS_THRESHOLD: f64 = 0.5;
pub const DEFAULT_DATA_START_ROW: usize = 19;

// ============================================================================
// COLUMN MAPPING
// ============================================================================

/// 0-based column positions inside the transaction sheet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnMapping {
    pub info_code: usize,
    pub pan: usize,
    pub party_name: usize,
    pub taxpayer_type: usize,
    pub amount: usize,
    pub business_nature: usize,
    pub turnover_range: usize,
    pub income_range: usize,
}

impl Default for ColumnMapping {
    fn default() -> Self {
        ColumnMapping {
            info_code: 1,       // Column B - Information Code
            pan: 3,             // Column D - Party PAN
            party_name: 4,      // Column E - Party Name
            taxpayer_type: 5,   // Column F - Taxpayer Type
            amount: 7,          // Column H - Aggregated Transaction Value
            business_nature: 9, // Column J - Nature of Business
            turnover_range: 10, // Column K
            income_range: 11,   // Column L
        }
    }
}

// ============================================================================
// ANALYSIS CONFIG
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub root_node_id: String,

    /// Spreadsheet whose embedded PAN is used when `root_node_id` has no file
    pub root_file: Option<String>,

    /// Single knob for the normal P/S band, see `ThresholdBand::from_threshold`
    pub bogus_threshold: f64,

    /// Risk score above which an entity counts as high risk
    pub risk_threshold: f64,
    pub risk_weights: RiskWeights,

    pub data_directory: PathBuf,
    pub output_directory: PathBuf,

    pub cache_enabled: bool,
    pub cache_path: PathBuf,

    /// 1-based row holding the column headers; data start on the next row
    pub data_start_row: usize,
    pub column_mapping: ColumnMapping,

    /// Wall-clock budget for one run (None = unbounded)
    pub timeout_secs: Option<u64>,

    pub log_level: String,
    pub web_host: String,
    pub web_port: u16,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        AnalysisConfig {
            root_node_id: DEFAULT_ROOT_NODE_ID.to_string(),
            root_file: None,
            bogus_threshold: DEFAULT_BOGUS_THRESHOLD,
            risk_threshold: 70.0,
            risk_weights: RiskWeights::default(),
            data_directory: PathBuf::from("data/input"),
            output_directory: PathBuf::from("data/output"),
            cache_enabled: true,
            cache_path: PathBuf::from("data/cache/parse_cache.db"),
            data_start_row: DEFAULT_DATA_START_ROW,
            column_mapping: ColumnMapping::default(),
            timeout_secs: None,
            log_level: "info".to_string(),
            web_host: "127.0.0.1".to_string(),
            web_port: 8000,
        }
    }
}

impl AnalysisConfig {
    /// Load configuration from a YAML (.yaml/.yml) or JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> AnalysisResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;

        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );

        let config = if is_yaml {
            serde_yaml::from_str(&content).map_err(|e| {
                AnalysisError::Configuration(format!("{}: {}", path.display(), e))
            })?
        } else {
            serde_json::from_str(&content).map_err(|e| {
                AnalysisError::Configuration(format!("{}: {}", path.display(), e))
            })?
        };

        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Load from file when it exists, defaults otherwise
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> AnalysisResult<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::from_file(path)
        } else {
            warn!(path = %path.display(), "configuration file not found, using defaults");
            Ok(Self::default())
        }
    }

    /// Preset for a named environment (development, production, testing)
    pub fn for_environment(env: &str) -> Self {
        let mut config = AnalysisConfig::default();
        match env {
            "development" => {
                config.log_level = "debug".to_string();
            }
            "production" => {
                config.log_level = "info".to_string();
                config.timeout_secs = Some(600);
            }
            "testing" => {
                config.log_level = "warn".to_string();
                config.cache_enabled = false;
                config.data_directory = PathBuf::from("tests/test_data");
                config.output_directory = PathBuf::from("tests/output");
            }
            other => {
                warn!(env = other, "unknown environment, using default configuration");
            }
        }
        config
    }

    /// Apply GST_* environment variable overrides
    pub fn apply_env_overrides(&mut self) -> AnalysisResult<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Same as `apply_env_overrides` with an injectable lookup
    pub fn apply_overrides<F>(&mut self, lookup: F) -> AnalysisResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("GST_DATA_DIR") {
            self.data_directory = PathBuf::from(v);
        }
        if let Some(v) = lookup("GST_OUTPUT_DIR") {
            self.output_directory = PathBuf::from(v);
        }
        if let Some(v) = lookup("GST_ROOT_NODE") {
            self.root_node_id = v;
        }
        if let Some(v) = lookup("GST_ROOT_FILE") {
            self.root_file = Some(v);
        }
        if let Some(v) = lookup("GST_BOGUS_THRESHOLD") {
            self.bogus_threshold = v.parse().map_err(|_| {
                AnalysisError::Configuration(format!("GST_BOGUS_THRESHOLD is not a number: {}", v))
            })?;
        }
        if let Some(v) = lookup("GST_LOG_LEVEL") {
            self.log_level = v;
        }
        if let Some(v) = lookup("GST_WEB_HOST") {
            self.web_host = v;
        }
        if let Some(v) = lookup("GST_WEB_PORT") {
            self.web_port = v.parse().map_err(|_| {
                AnalysisError::Configuration(format!("GST_WEB_PORT is not a port: {}", v))
            })?;
        }
        if let Some(v) = lookup("GST_CACHE_ENABLED") {
            self.cache_enabled = matches!(v.to_lowercase().as_str(), "true" | "1" | "yes" | "on");
        }
        Ok(())
    }

    /// Startup validation. Performs no I/O.
    pub fn validate(&self) -> AnalysisResult<()> {
        if self.root_node_id.trim().is_empty() {
            return Err(AnalysisError::Configuration("root_node_id is empty".into()));
        }
        // Band construction carries the threshold checks
        ThresholdBand::from_threshold(self.bogus_threshold)?;

        if !(0.0..=100.0).contains(&self.risk_threshold) {
            return Err(AnalysisError::Configuration(format!(
                "risk_threshold must be within [0, 100], got {}",
                self.risk_threshold
            )));
        }
        self.risk_weights.validate()?;

        if self.data_start_row == 0 {
            return Err(AnalysisError::Configuration(
                "data_start_row is 1-based and must be at least 1".into(),
            ));
        }
        if self.timeout_secs == Some(0) {
            return Err(AnalysisError::Configuration("timeout_secs must be positive".into()));
        }
        Ok(())
    }

    pub fn threshold_band(&self) -> AnalysisResult<ThresholdBand> {
        ThresholdBand::from_threshold(self.bogus_threshold)
    }

    pub fn loader_settings(&self) -> LoaderSettings {
        LoaderSettings {
            data_start_row: self.data_start_row,
            columns: self.column_mapping.clone(),
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// Root id normalized the same way spreadsheet PANs are
    pub fn root_id(&self) -> String {
        self.root_node_id.trim().to_uppercase()
    }
}
