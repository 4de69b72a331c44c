use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use hpo_core::{DataclassKind, LevelId, ScopedLocation, DEFAULT_CLIENT, DEFAULT_PROJECT};
use serde::{Deserialize, Serialize};

fn default_lock_retries() -> u32 {
    200
}

fn default_lock_backoff_ms() -> u64 {
    5
}

fn default_lock_max_backoff_ms() -> u64 {
    100
}

fn default_stale_lock_secs() -> u64 {
    600
}

fn default_project_name() -> String {
    DEFAULT_PROJECT.to_string()
}

fn default_client_name() -> String {
    DEFAULT_CLIENT.to_string()
}

fn default_n_trials() -> usize {
    10
}

fn default_one() -> usize {
    1
}

fn default_true() -> bool {
    true
}

/// Options handed to repositories and the locks they take.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    #[serde(default = "default_lock_retries")]
    pub lock_retries: u32,
    #[serde(default = "default_lock_backoff_ms")]
    pub lock_backoff_ms: u64,
    #[serde(default = "default_lock_max_backoff_ms")]
    pub lock_max_backoff_ms: u64,
    #[serde(default = "default_stale_lock_secs")]
    pub stale_lock_secs: u64,
    #[serde(default)]
    pub silence_warnings: bool,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            lock_retries: default_lock_retries(),
            lock_backoff_ms: default_lock_backoff_ms(),
            lock_max_backoff_ms: default_lock_max_backoff_ms(),
            stale_lock_secs: default_stale_lock_secs(),
            silence_warnings: false,
        }
    }
}

impl RepositoryConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.lock_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.lock_max_backoff_ms.max(self.lock_backoff_ms))
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_lock_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignConfig {
    #[serde(default = "default_project_name")]
    pub project_name: String,
    #[serde(default = "default_client_name")]
    pub client_name: String,
    pub main_metric_name: String,
    /// Ranking direction of the main metric. A split reporting the main
    /// metric in the other direction fails.
    #[serde(default)]
    pub higher_score_is_better: bool,
    #[serde(default = "default_n_trials")]
    pub n_trials: usize,
    #[serde(default = "default_one")]
    pub n_jobs: usize,
    #[serde(default = "default_one")]
    pub n_splits: usize,
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default)]
    pub continue_on_split_failure: bool,
    #[serde(default = "default_true")]
    pub start_new_round: bool,
}

impl CampaignConfig {
    pub fn new(main_metric_name: impl Into<String>) -> Self {
        Self {
            project_name: default_project_name(),
            client_name: default_client_name(),
            main_metric_name: main_metric_name.into(),
            higher_score_is_better: false,
            n_trials: default_n_trials(),
            n_jobs: 1,
            n_splits: 1,
            continue_on_error: false,
            continue_on_split_failure: false,
            start_new_round: true,
        }
    }

    /// Location of the client every round of this campaign lives under.
    pub fn client_location(&self) -> Result<ScopedLocation> {
        Ok(ScopedLocation::root()
            .push(self.project_name.as_str())?
            .push(self.client_name.as_str())?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.n_jobs == 0 {
            return Err(anyhow!("campaign.n_jobs must be at least 1"));
        }
        if self.n_splits == 0 {
            return Err(anyhow!("campaign.n_splits must be at least 1"));
        }
        hpo_core::location::validate_level_id(
            DataclassKind::MetricResults,
            &LevelId::from(self.main_metric_name.as_str()),
        )
        .context("campaign.main_metric_name")?;
        self.client_location().context("campaign project/client")?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HpoConfig {
    #[serde(default)]
    pub repository: RepositoryConfig,
    pub campaign: CampaignConfig,
}

impl HpoConfig {
    /// Reads a YAML (or JSON) config file and validates it.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config = Self::from_yaml(&text)
            .with_context(|| format!("invalid config {}", path.display()))?;
        Ok(config)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.repository.lock_retries == 0 {
            return Err(anyhow!("repository.lock_retries must be at least 1"));
        }
        self.campaign.validate()
    }
}
