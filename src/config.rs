use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: Option<String>,
    pub claims: ClaimsConfig,
    pub rate_limits: RateLimitsConfig,
    pub strikes: StrikesConfig,
    pub factory: FactoryConfig,
    pub storage: StorageConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: None,
            claims: ClaimsConfig::default(),
            rate_limits: RateLimitsConfig::default(),
            strikes: StrikesConfig::default(),
            factory: FactoryConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClaimsConfig {
    pub ttl_minutes: u64,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for ClaimsConfig {
    fn default() -> Self {
        Self {
            ttl_minutes: 120,
            retry_attempts: 5,
            retry_delay_ms: 500,
        }
    }
}

impl ClaimsConfig {
    pub fn ttl_ms(&self) -> i64 {
        (self.ttl_minutes * 60 * 1000) as i64
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitsConfig {
    pub poll_interval_ms: u64,
    pub budget_timeout_secs: u64,
    pub categories: Vec<RateCategoryConfig>,
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            budget_timeout_secs: 300,
            categories: vec![
                RateCategoryConfig {
                    name: "agent_api".to_string(),
                    window_secs: 3600,
                    max_per_window: 50,
                },
                RateCategoryConfig {
                    name: "github_search".to_string(),
                    window_secs: 60,
                    max_per_window: 30,
                },
            ],
        }
    }
}

impl RateLimitsConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn budget_timeout(&self) -> Duration {
        Duration::from_secs(self.budget_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateCategoryConfig {
    pub name: String,
    pub window_secs: u64,
    pub max_per_window: i64,
}

impl RateCategoryConfig {
    pub fn window_ms(&self) -> i64 {
        (self.window_secs * 1000) as i64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrikesConfig {
    pub max_strikes: u32,
    pub cooldown_days: u64,
}

impl Default for StrikesConfig {
    fn default() -> Self {
        Self {
            max_strikes: 10,
            cooldown_days: 7,
        }
    }
}

impl StrikesConfig {
    pub fn cooldown_ms(&self) -> i64 {
        (self.cooldown_days * 24 * 60 * 60 * 1000) as i64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FactoryConfig {
    pub max_agents: usize,
    pub poll_interval_secs: u64,
    pub spawn_stagger_secs: u64,
    pub max_items: usize,
    pub max_requeues: u32,
    pub model: String,
    pub solve_command: Vec<String>,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            max_agents: 4,
            poll_interval_secs: 5,
            spawn_stagger_secs: 60,
            max_items: 100,
            max_requeues: 3,
            model: "sonnet-low".to_string(),
            solve_command: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("dogood"),
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

    /// Factory settings derived from the factory and rate limit sections.
    pub fn factory_config(&self) -> crate::factory::FactoryConfig {
        crate::factory::FactoryConfig {
            max_agents: self.factory.max_agents,
            poll_interval: Duration::from_secs(self.factory.poll_interval_secs),
            spawn_stagger: Duration::from_secs(self.factory.spawn_stagger_secs),
            max_items: self.factory.max_items,
            budget_timeout: self.rate_limits.budget_timeout(),
            max_requeues: self.factory.max_requeues,
            model: self.factory.model.clone(),
        }
    }
}
