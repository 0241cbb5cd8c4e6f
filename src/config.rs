//! Configuration for the crash table
//!
//! Defaults, then an optional TOML file, then `CRASH_*` environment
//! overrides, then validation.

use crate::{
    errors::{ConfigurationError, CrashError, CrashResult},
    fairness::FairnessParams,
    multiplier::{Multiplier, MultiplierCurve},
    settlement::RetryPolicy,
};
use serde::{Deserialize, Serialize};
use std::{env, path::Path, str::FromStr, time::Duration};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrashConfig {
    pub game: GameConfig,
    pub fairness: FairnessConfig,
    pub timing: TimingConfig,
    pub settlement: SettlementConfig,
    pub storage: StorageConfig,
    pub api: ApiConfig,
    pub monitoring: MonitoringConfig,
}

/// Bet limits and ledger settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GameConfig {
    pub min_bet: u64,
    pub max_bet: u64,
    /// Curve growth constant `k` per second
    pub growth_rate: f64,
    pub store_timeout_ms: u64,
    pub history_default_limit: usize,
    pub history_max_limit: usize,
    pub mailbox_capacity: usize,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            min_bet: 10,
            max_bet: 1000,
            growth_rate: MultiplierCurve::DEFAULT_GROWTH_RATE,
            store_timeout_ms: 2000,
            history_default_limit: 20,
            history_max_limit: 100,
            mailbox_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FairnessConfig {
    pub house_edge: f64,
    pub max_crash_point: f64,
}

impl Default for FairnessConfig {
    fn default() -> Self {
        Self {
            house_edge: 0.03,
            max_crash_point: 10_000.0,
        }
    }
}

/// Round clock
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub betting_window_ms: u64,
    pub tick_interval_ms: u64,
    pub cooldown_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            betting_window_ms: 5000,
            tick_interval_ms: 100,
            cooldown_ms: 3000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettlementConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub max_attempts: u32,
    pub max_concurrency: usize,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 50,
            max_backoff_ms: 2000,
            max_attempts: 5,
            max_concurrency: 16,
        }
    }
}

/// Where balances and history live; no path means in-memory
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub request_timeout_secs: u64,
    /// Empty allows any origin
    pub allowed_origins: Vec<String>,
    pub heartbeat_interval_secs: u64,
    pub event_buffer: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            request_timeout_secs: 30,
            allowed_origins: Vec::new(),
            heartbeat_interval_secs: 30,
            event_buffer: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub log_filter: String,
    pub metrics_enabled: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_filter: "crash_table=info,tower_http=info".to_string(),
            metrics_enabled: true,
        }
    }
}

impl CrashConfig {
    /// Short rounds for local play and tests
    pub fn quick_rounds() -> Self {
        Self {
            timing: TimingConfig {
                betting_window_ms: 1000,
                tick_interval_ms: 50,
                cooldown_ms: 500,
            },
            ..Self::default()
        }
    }

    pub fn betting_window(&self) -> Duration {
        Duration::from_millis(self.timing.betting_window_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.timing.tick_interval_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.timing.cooldown_ms)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.game.store_timeout_ms)
    }

    pub fn curve(&self) -> MultiplierCurve {
        MultiplierCurve::new(self.game.growth_rate)
    }

    pub fn fairness_params(&self) -> FairnessParams {
        FairnessParams {
            house_edge: self.fairness.house_edge,
            max_crash_point: Multiplier::from_f64_floor(self.fairness.max_crash_point)
                .unwrap_or(FairnessParams::default().max_crash_point),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_backoff: Duration::from_millis(self.settlement.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.settlement.max_backoff_ms),
            max_attempts: self.settlement.max_attempts,
            store_timeout: self.store_timeout(),
            max_concurrency: self.settlement.max_concurrency,
        }
    }
}

/// Configuration loader with file and environment support
#[derive(Debug, Default)]
pub struct ConfigLoader {
    config_path: Option<String>,
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> ConfigurationError {
    ConfigurationError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    reason: &str,
) -> CrashResult<Option<T>> {
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| CrashError::Configuration(invalid(name, raw, reason))),
        None => Ok(None),
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    pub fn with_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_path = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Load configuration from file and environment variables
    pub fn load(&self) -> CrashResult<CrashConfig> {
        let mut config = if let Some(ref path) = self.config_path {
            self.load_from_file(path)?
        } else {
            CrashConfig::default()
        };

        self.apply_overrides(&mut config, |name| env::var(name).ok())?;
        self.validate(&config)?;

        Ok(config)
    }

    fn load_from_file(&self, path: &str) -> CrashResult<CrashConfig> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigurationError::LoadFailed(format!("Failed to read {}: {}", path, e)))?;

        toml::from_str(&content)
            .map_err(|e| ConfigurationError::LoadFailed(format!("Failed to parse TOML: {}", e)).into())
    }

    /// Apply `CRASH_*` overrides read through `lookup`
    pub fn apply_overrides(
        &self,
        config: &mut CrashConfig,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> CrashResult<()> {
        if let Some(host) = lookup("CRASH_HOST") {
            config.api.host = host;
        }
        if let Some(port) = parse_var(&lookup, "CRASH_PORT", "Invalid port number")? {
            config.api.port = port;
        }
        if let Some(path) = lookup("CRASH_DB_PATH") {
            config.storage.db_path = Some(path);
        }
        if let Some(filter) = lookup("CRASH_LOG") {
            config.monitoring.log_filter = filter;
        }

        if let Some(min) = parse_var(&lookup, "CRASH_MIN_BET", "Invalid amount")? {
            config.game.min_bet = min;
        }
        if let Some(max) = parse_var(&lookup, "CRASH_MAX_BET", "Invalid amount")? {
            config.game.max_bet = max;
        }
        if let Some(edge) = parse_var(&lookup, "CRASH_HOUSE_EDGE", "Invalid house edge")? {
            config.fairness.house_edge = edge;
        }

        if let Some(ms) = parse_var(&lookup, "CRASH_BETTING_WINDOW_MS", "Invalid duration")? {
            config.timing.betting_window_ms = ms;
        }
        if let Some(ms) = parse_var(&lookup, "CRASH_TICK_MS", "Invalid duration")? {
            config.timing.tick_interval_ms = ms;
        }
        if let Some(ms) = parse_var(&lookup, "CRASH_COOLDOWN_MS", "Invalid duration")? {
            config.timing.cooldown_ms = ms;
        }

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self, config: &CrashConfig) -> CrashResult<()> {
        let game = &config.game;
        if game.min_bet == 0 {
            return Err(invalid("game.min_bet", 0, "Minimum bet must be positive").into());
        }
        if game.max_bet < game.min_bet {
            return Err(invalid("game.max_bet", game.max_bet, "Maximum bet is below the minimum").into());
        }
        if !game.growth_rate.is_finite() || game.growth_rate <= 0.0 {
            return Err(invalid("game.growth_rate", game.growth_rate, "Growth rate must be positive").into());
        }
        if game.store_timeout_ms == 0 {
            return Err(invalid("game.store_timeout_ms", 0, "Store timeout cannot be zero").into());
        }
        if game.history_max_limit == 0 || game.history_default_limit > game.history_max_limit {
            return Err(ConfigurationError::ValidationFailed(format!(
                "history limits {} / {} are inconsistent",
                game.history_default_limit, game.history_max_limit
            ))
            .into());
        }
        if game.mailbox_capacity == 0 {
            return Err(invalid("game.mailbox_capacity", 0, "Mailbox capacity cannot be zero").into());
        }

        let fairness = &config.fairness;
        if !(0.0..1.0).contains(&fairness.house_edge) {
            return Err(invalid("fairness.house_edge", fairness.house_edge, "House edge must be in [0, 1)").into());
        }
        if !fairness.max_crash_point.is_finite() || fairness.max_crash_point < 1.0 {
            return Err(invalid(
                "fairness.max_crash_point",
                fairness.max_crash_point,
                "Ceiling must be at least 1.00",
            )
            .into());
        }

        let timing = &config.timing;
        if timing.betting_window_ms == 0 {
            return Err(invalid("timing.betting_window_ms", 0, "Betting window cannot be zero").into());
        }
        if timing.tick_interval_ms == 0 {
            return Err(invalid("timing.tick_interval_ms", 0, "Tick interval cannot be zero").into());
        }

        if config.settlement.max_attempts == 0 {
            return Err(invalid("settlement.max_attempts", 0, "At least one attempt is required").into());
        }
        if config.settlement.max_concurrency == 0 {
            return Err(invalid("settlement.max_concurrency", 0, "Concurrency cannot be zero").into());
        }

        if config.api.port == 0 {
            return Err(invalid("api.port", 0, "Port cannot be zero").into());
        }
        if config.api.event_buffer == 0 {
            return Err(invalid("api.event_buffer", 0, "Event buffer cannot be zero").into());
        }

        Ok(())
    }

    /// Save configuration to file
    pub fn save(&self, config: &CrashConfig, path: &str) -> CrashResult<()> {
        let toml_string = toml::to_string_pretty(config)
            .map_err(|e| ConfigurationError::SaveFailed(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, toml_string)
            .map_err(|e| ConfigurationError::SaveFailed(format!("Failed to write to {}: {}", path, e)).into())
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config(path: &str) -> CrashResult<()> {
    ConfigLoader::new().save(&CrashConfig::default(), path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = CrashConfig::default();
        assert_eq!(config.game.min_bet, 10);
        assert_eq!(config.game.max_bet, 1000);
        assert_eq!(config.betting_window(), Duration::from_secs(5));
        assert_eq!(config.tick_interval(), Duration::from_millis(100));
        assert_eq!(config.fairness_params(), FairnessParams::default());
        assert!(ConfigLoader::new().validate(&config).is_ok());
    }

    #[test]
    fn test_config_validation() {
        let loader = ConfigLoader::new();
        let mut config = CrashConfig::default();

        config.fairness.house_edge = 1.0;
        assert!(loader.validate(&config).is_err());

        config = CrashConfig::default();
        config.game.max_bet = 5;
        assert!(loader.validate(&config).is_err());

        config = CrashConfig::default();
        config.timing.tick_interval_ms = 0;
        assert!(loader.validate(&config).is_err());
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [("CRASH_PORT", "9100"), ("CRASH_MIN_BET", "25"), ("CRASH_DB_PATH", "/tmp/crash")]
            .into_iter()
            .collect();
        let mut config = CrashConfig::default();
        ConfigLoader::new()
            .apply_overrides(&mut config, |name| vars.get(name).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.api.port, 9100);
        assert_eq!(config.game.min_bet, 25);
        assert_eq!(config.storage.db_path.as_deref(), Some("/tmp/crash"));
    }

    #[test]
    fn test_bad_override_is_rejected() {
        let mut config = CrashConfig::default();
        let result = ConfigLoader::new().apply_overrides(&mut config, |name| {
            (name == "CRASH_TICK_MS").then(|| "fast".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_save_and_load_config() -> CrashResult<()> {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_str().unwrap();

        let original = CrashConfig::quick_rounds();
        ConfigLoader::new().save(&original, path)?;
        let loaded = ConfigLoader::new().with_path(path).load_from_file(path)?;

        assert_eq!(loaded, original);
        Ok(())
    }
}
