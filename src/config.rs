use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::consensus::{
    CategoryWeights, DeductionTable, DetectionContext, ScoringTable, Severity, SeverityScale,
    DEFAULT_CATEGORY_CAP,
};
use crate::event_log::{EventLog, InMemoryEventLog, JsonlEventLog};
use crate::orchestration::{RetryPolicy, DEFAULT_MAX_RETRIES, DEFAULT_WORKER_TIMEOUT_SECS};
use crate::{Error, Result};

pub const DEFAULT_MAX_CONCURRENT: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub worker_timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            worker_timeout_secs: DEFAULT_WORKER_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_concurrent: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub category_cap: u32,
    pub deductions: DeductionTable,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            category_cap: DEFAULT_CATEGORY_CAP,
            deductions: DeductionTable::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub tags: Vec<String>,
}

/// Engine configuration, read from `concord.toml`.
///
/// Every section is optional; missing keys take their defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// JSONL event log file. When unset the log stays in memory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_log: Option<String>,
    pub retry: RetryConfig,
    pub scheduler: SchedulerConfig,
    pub scoring: ScoringConfig,
    /// Default category weights, used when a request carries none.
    pub weights: BTreeMap<String, f64>,
    pub context: ContextConfig,
    pub severity_aliases: BTreeMap<String, Severity>,
}

impl EngineConfig {
    pub fn config_dir() -> Result<PathBuf> {
        Ok(dirs::config_dir()
            .ok_or_else(|| Error::Configuration("no config directory for this platform".to_string()))?
            .join("concord"))
    }

    pub fn default_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("concord.toml"))
    }

    /// Load from `path`.
    ///
    /// # Errors
    /// `Io` if the file cannot be read, `TomlParse` if it is not valid.
    pub fn load(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "EngineConfig::load");
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        debug!(
            max_retries = config.retry.max_retries,
            max_concurrent = config.scheduler.max_concurrent,
            weights = config.weights.len(),
            "config loaded"
        );
        Ok(config)
    }

    /// Load from `path`, falling back to defaults if the file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        Self::load(path)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::with_max_retries(self.retry.max_retries)
            .timeout(Duration::from_secs(self.retry.worker_timeout_secs))
    }

    pub fn scoring_table(&self) -> ScoringTable {
        ScoringTable {
            deductions: self.scoring.deductions,
            category_cap: self.scoring.category_cap,
        }
    }

    pub fn severity_scale(&self) -> SeverityScale {
        SeverityScale::new().with_aliases(&self.severity_aliases)
    }

    pub fn detection_context(&self) -> DetectionContext {
        DetectionContext::new(&self.context.tags)
    }

    pub fn weights(&self) -> CategoryWeights {
        CategoryWeights::from(self.weights.clone())
    }

    /// Open the configured event log, creating its directory if needed.
    pub fn open_event_log(&self, run_name: &str) -> Result<Arc<dyn EventLog>> {
        match &self.event_log {
            Some(path) => Ok(Arc::new(JsonlEventLog::open(&expand_tilde(path))?)),
            None => Ok(Arc::new(InMemoryEventLog::named(run_name))),
        }
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
