use crate::limiter::BucketParams;
use crate::provider::{HttpGeneratorConfig, HttpSenderConfig};
use crate::worker::{BackoffPolicy, WorkerConfig};
use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: Option<String>,
    pub storage: StorageConfig,
    pub delivery: DeliveryConfig,
    pub retry: RetryConfig,
    pub rate_limits: RateLimitsConfig,
    pub history: HistoryConfig,
    pub generator: GeneratorConfig,
    pub sender: SenderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("dripfeed")
                .join("dripfeed.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Recent fingerprints handed to the generator for dedup
    pub history_limit: usize,
    /// Seconds before an in-progress claim is presumed orphaned
    pub claim_lease_secs: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            history_limit: 10,
            claim_lease_secs: 900,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_secs: 60,
            max_delay_secs: 3600,
            jitter: 0.2,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LimiterMode {
    /// In-process buckets; only correct for single-process deployments
    Local,
    /// SQLite-backed buckets shared across worker processes
    Shared,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitsConfig {
    pub mode: LimiterMode,
    pub resources: HashMap<String, ResourceLimit>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResourceLimit {
    pub capacity: f64,
    pub refill_per_sec: f64,
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        let mut resources = HashMap::new();
        // 100 generation requests/minute, 5 SMS/second
        resources.insert(
            crate::limiter::resource::GENERATION.to_string(),
            ResourceLimit {
                capacity: 100.0,
                refill_per_sec: 100.0 / 60.0,
            },
        );
        resources.insert(
            crate::limiter::resource::SMS.to_string(),
            ResourceLimit {
                capacity: 5.0,
                refill_per_sec: 5.0,
            },
        );
        Self {
            mode: LimiterMode::Shared,
            resources,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub retention_days: u32,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { retention_days: 30 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    pub endpoint: String,
    pub model: String,
    pub max_tokens: u32,
    pub timeout_ms: u64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        let base = HttpGeneratorConfig::default();
        Self {
            endpoint: base.endpoint,
            model: base.model,
            max_tokens: base.max_tokens,
            timeout_ms: base.timeout.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderConfig {
    pub base_url: String,
    pub account_sid: String,
    pub from_number: String,
    pub timeout_ms: u64,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.twilio.com".to_string(),
            account_sid: String::new(),
            from_number: String::new(),
            timeout_ms: 30000,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: Some("info".to_string()),
            storage: StorageConfig::default(),
            delivery: DeliveryConfig::default(),
            retry: RetryConfig::default(),
            rate_limits: RateLimitsConfig::default(),
            history: HistoryConfig::default(),
            generator: GeneratorConfig::default(),
            sender: SenderConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try primary location: ~/.config/<project>/<project>.yml
        if let Some(config_dir) = dirs::config_dir() {
            let project_name = env!("CARGO_PKG_NAME");
            let primary_config = config_dir.join(project_name).join(format!("{}.yml", project_name));
            if primary_config.exists() {
                match Self::load_from_file(&primary_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        log::warn!("Failed to load config from {}: {}", primary_config.display(), e);
                    }
                }
            }
        }

        // Try fallback location: ./<project>.yml
        let project_name = env!("CARGO_PKG_NAME");
        let fallback_config = PathBuf::from(format!("{}.yml", project_name));
        if fallback_config.exists() {
            match Self::load_from_file(&fallback_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    log::warn!("Failed to load config from {}: {}", fallback_config.display(), e);
                }
            }
        }

        // No config file found, use defaults
        log::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        log::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Per-resource bucket parameters for the limiter backends.
    pub fn bucket_params(&self) -> HashMap<String, BucketParams> {
        self.rate_limits
            .resources
            .iter()
            .map(|(name, limit)| {
                (
                    name.clone(),
                    BucketParams {
                        capacity: limit.capacity,
                        refill_per_sec: limit.refill_per_sec,
                    },
                )
            })
            .collect()
    }

    /// Worker tuning assembled from the retry and delivery sections.
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            max_attempts: self.retry.max_attempts,
            backoff: BackoffPolicy {
                base: Duration::from_secs(self.retry.base_delay_secs),
                max: Duration::from_secs(self.retry.max_delay_secs),
                jitter: self.retry.jitter,
            },
            history_limit: self.delivery.history_limit,
            claim_lease: Duration::from_secs(self.delivery.claim_lease_secs),
        }
    }

    pub fn generator_config(&self) -> HttpGeneratorConfig {
        HttpGeneratorConfig {
            endpoint: self.generator.endpoint.clone(),
            model: self.generator.model.clone(),
            max_tokens: self.generator.max_tokens,
            timeout: Duration::from_millis(self.generator.timeout_ms),
        }
    }

    pub fn sender_config(&self) -> HttpSenderConfig {
        HttpSenderConfig {
            base_url: self.sender.base_url.clone(),
            account_sid: self.sender.account_sid.clone(),
            from_number: self.sender.from_number.clone(),
            timeout: Duration::from_millis(self.sender.timeout_ms),
        }
    }
}
