use std::path::PathBuf;

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

/// Upper bound for the day-count windows, roughly ten years.
pub const MAX_WINDOW_DAYS: i64 = 3650;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub store: StoreConfig,
    pub network: NetworkConfig,
    pub forecast: ForecastConfig,
}

/// Which data-store collaborator feeds and receives the pipeline.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// Direct PostgreSQL connection.
    #[default]
    Postgres,
    /// PostgREST / Supabase HTTP API.
    Rest,
    /// Directory of CSV files.
    Csv,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub database_url: Option<String>,
    pub rest_url: Option<String>,
    pub rest_key: Option<String>,
    pub csv_dir: PathBuf,
    pub forecast_table: String,
    /// Rows requested per page from the REST backend.
    pub page_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Postgres,
            database_url: None,
            rest_url: None,
            rest_key: None,
            csv_dir: PathBuf::from("data"),
            forecast_table: "session_forecast_next_14_days".to_string(),
            page_size: 1000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct NetworkConfig {
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            connect_timeout_secs: 10,
        }
    }
}

/// How much a held member is subtracted from each session they usually attend.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum HoldContribution {
    /// One full attendee per occurrence.
    #[default]
    FullOccurrence,
    /// The member's historical attendance rate for the slot.
    AttendanceRate,
}

/// Which capacity rule wins when several patterns match a session name.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CapacityTieBreak {
    /// Longest pattern first; equal lengths keep configuration order.
    #[default]
    LongestPattern,
    /// First matching rule in configuration order.
    ConfigOrder,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
pub struct RiskThresholds {
    /// Utilisation at or above this is amber.
    pub amber_from: f64,
    /// Utilisation strictly above this is red.
    pub red_above: f64,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            amber_from: 0.80,
            red_above: 0.95,
        }
    }
}

/// Everything the forecasting engine itself is tuned by.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ForecastConfig {
    pub ridge_penalty: f64,
    pub evaluation_window_days: i64,
    pub forecast_horizon_days: i64,
    pub rolling_window_sizes: Vec<usize>,
    /// Stand-in for lag and rolling features a slot has no history for yet.
    pub missing_feature_value: f64,
    pub risk_thresholds: RiskThresholds,
    pub hold_contribution: HoldContribution,
    pub capacity_tie_break: CapacityTieBreak,
    /// Multiply matched capacity by the slot's usual number of coaches.
    pub scale_capacity_by_coaches: bool,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            ridge_penalty: 1.0,
            evaluation_window_days: 30,
            forecast_horizon_days: 42,
            rolling_window_sizes: vec![4, 8],
            missing_feature_value: 0.0,
            risk_thresholds: RiskThresholds::default(),
            hold_contribution: HoldContribution::FullOccurrence,
            capacity_tie_break: CapacityTieBreak::LongestPattern,
            scale_capacity_by_coaches: false,
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        // Load .env file (silently ignore if not present - production uses env vars directly)
        let _ = dotenvy::dotenv();

        let database_url = std::env::var("DATABASE_URL").ok();
        let rest_url = std::env::var("SUPABASE_URL").ok();
        let rest_key = std::env::var("SUPABASE_SERVICE_ROLE_KEY").ok();

        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("session-forecast");

        let builder = Config::builder()
            // 1. Load default values
            // Store
            .set_default("store.backend", "postgres")?
            .set_default("store.database_url", database_url)?
            .set_default("store.rest_url", rest_url)?
            .set_default("store.rest_key", rest_key)?
            .set_default("store.csv_dir", "data")?
            .set_default("store.forecast_table", "session_forecast_next_14_days")?
            .set_default("store.page_size", 1000)?
            // Network
            .set_default("network.request_timeout_secs", 30)?
            .set_default("network.connect_timeout_secs", 10)?
            // Forecast
            .set_default("forecast.ridge_penalty", 1.0)?
            .set_default("forecast.evaluation_window_days", 30)?
            .set_default("forecast.forecast_horizon_days", 42)?
            .set_default("forecast.rolling_window_sizes", vec![4, 8])?
            .set_default("forecast.missing_feature_value", 0.0)?
            .set_default("forecast.risk_thresholds.amber_from", 0.80)?
            .set_default("forecast.risk_thresholds.red_above", 0.95)?
            .set_default("forecast.hold_contribution", "full_occurrence")?
            .set_default("forecast.capacity_tie_break", "longest_pattern")?
            .set_default("forecast.scale_capacity_by_coaches", false)?

            // 2. Load from local config file (optional, lowest priority)
            .add_source(File::from(PathBuf::from("config.toml")).required(false))

            // 3. Load from user config directory (optional, overrides local)
            .add_source(File::from(config_dir.join("config.toml")).required(false))

            // 4. Load from Environment variables (SESSION_FORECAST__FORECAST__RIDGE_PENALTY=...)
            .add_source(Environment::with_prefix("SESSION_FORECAST").separator("__"));

        let s = builder.build()?;
        let config: Self = s
            .try_deserialize()
            .context("Invalid session-forecast configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let forecast = &self.forecast;
        if !forecast.ridge_penalty.is_finite() || forecast.ridge_penalty < 0.0 {
            anyhow::bail!(
                "forecast.ridge_penalty must be a non-negative number, got {}",
                forecast.ridge_penalty
            );
        }
        for (name, days) in [
            ("evaluation_window_days", forecast.evaluation_window_days),
            ("forecast_horizon_days", forecast.forecast_horizon_days),
        ] {
            if days > MAX_WINDOW_DAYS {
                anyhow::bail!(
                    "forecast.{} must be at most {} days, got {}",
                    name,
                    MAX_WINDOW_DAYS,
                    days
                );
            }
        }
        if forecast.rolling_window_sizes.contains(&0) {
            anyhow::bail!("forecast.rolling_window_sizes must not contain 0");
        }
        let thresholds = forecast.risk_thresholds;
        if thresholds.amber_from > thresholds.red_above {
            anyhow::bail!(
                "forecast.risk_thresholds.amber_from ({}) must not exceed red_above ({})",
                thresholds.amber_from,
                thresholds.red_above
            );
        }
        if self.store.page_size == 0 {
            anyhow::bail!("store.page_size must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== Default Value Tests ====================

    #[test]
    fn test_forecast_config_defaults() {
        let config = ForecastConfig::default();
        assert_eq!(config.ridge_penalty, 1.0);
        assert_eq!(config.evaluation_window_days, 30);
        assert_eq!(config.forecast_horizon_days, 42);
        assert_eq!(config.rolling_window_sizes, vec![4, 8]);
        assert_eq!(config.hold_contribution, HoldContribution::FullOccurrence);
        assert_eq!(config.capacity_tie_break, CapacityTieBreak::LongestPattern);
        assert!(!config.scale_capacity_by_coaches);
    }

    #[test]
    fn test_risk_threshold_defaults() {
        let thresholds = RiskThresholds::default();
        assert_eq!(thresholds.amber_from, 0.80);
        assert_eq!(thresholds.red_above, 0.95);
    }

    #[test]
    fn test_store_config_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.backend, StoreBackend::Postgres);
        assert_eq!(config.forecast_table, "session_forecast_next_14_days");
        assert_eq!(config.page_size, 1000);
    }

    #[test]
    fn test_network_config_defaults() {
        let config = NetworkConfig::default();
        assert_eq!(config.request_timeout_secs, 30);
        assert_eq!(config.connect_timeout_secs, 10);
    }

    // ==================== Config Loading Tests ====================

    #[test]
    fn test_config_load_with_defaults() {
        let config = AppConfig::load().expect("Config should load");

        assert!(config.forecast.ridge_penalty >= 0.0);
        assert!(config.forecast.forecast_horizon_days > 0);
        assert!(!config.forecast.rolling_window_sizes.is_empty());
        assert!(config.store.page_size > 0);
    }

    #[test]
    fn test_enum_values_deserialize_snake_case() {
        let parsed: HoldContribution = serde_json::from_str("\"attendance_rate\"").unwrap();
        assert_eq!(parsed, HoldContribution::AttendanceRate);

        let parsed: CapacityTieBreak = serde_json::from_str("\"config_order\"").unwrap();
        assert_eq!(parsed, CapacityTieBreak::ConfigOrder);

        let parsed: StoreBackend = serde_json::from_str("\"csv\"").unwrap();
        assert_eq!(parsed, StoreBackend::Csv);
    }

    // ==================== Environment Variable Override Tests ====================

    /// Helper to safely set and remove environment variables in tests.
    fn with_env_var<F, R>(key: &str, value: &str, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        // SAFETY: Test environment, keys are unique to each test
        unsafe {
            std::env::set_var(key, value);
        }
        let result = f();
        unsafe {
            std::env::remove_var(key);
        }
        result
    }

    #[test]
    fn test_env_var_overrides_forecast_table() {
        let config = with_env_var(
            "SESSION_FORECAST__STORE__FORECAST_TABLE",
            "session_forecast_next_42_days",
            || AppConfig::load().expect("Config should load"),
        );

        assert_eq!(config.store.forecast_table, "session_forecast_next_42_days");
    }

    #[test]
    fn test_env_var_overrides_evaluation_window() {
        let config = with_env_var(
            "SESSION_FORECAST__FORECAST__EVALUATION_WINDOW_DAYS",
            "14",
            || AppConfig::load().expect("Config should load"),
        );

        assert_eq!(config.forecast.evaluation_window_days, 14);
    }

    #[test]
    fn test_validate_rejects_inverted_thresholds() {
        let config = AppConfig {
            store: StoreConfig::default(),
            network: NetworkConfig::default(),
            forecast: ForecastConfig {
                risk_thresholds: RiskThresholds {
                    amber_from: 0.9,
                    red_above: 0.8,
                },
                ..Default::default()
            },
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_rolling_window() {
        let config = AppConfig {
            store: StoreConfig::default(),
            network: NetworkConfig::default(),
            forecast: ForecastConfig {
                rolling_window_sizes: vec![0, 4],
                ..Default::default()
            },
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_bounds_day_windows() {
        let mut config = AppConfig {
            store: StoreConfig::default(),
            network: NetworkConfig::default(),
            forecast: ForecastConfig {
                evaluation_window_days: MAX_WINDOW_DAYS,
                forecast_horizon_days: MAX_WINDOW_DAYS,
                ..Default::default()
            },
        };
        assert!(config.validate().is_ok());

        config.forecast.evaluation_window_days = i64::MAX;
        assert!(config.validate().is_err());

        config.forecast.evaluation_window_days = 30;
        config.forecast.forecast_horizon_days = MAX_WINDOW_DAYS + 1;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("forecast_horizon_days"));
    }
}
