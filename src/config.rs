//! Configuration module for the ConnectedRoot telemetry service.
//!
//! Both binaries read their settings from environment variables prefixed with
//! `CONNECTED_ROOT_`. Every value has a default so a bare `cargo run` works.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::generator::OptimalBand;
use crate::ingest::{SensorCheck, ValueBounds};

/// Default listen address for the HTTP API
const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";

/// Default API URL used by the standalone simulator
const DEFAULT_API_URL: &str = "http://localhost:3000";

/// Default seconds between two simulated readings of one sensor
const DEFAULT_SIM_INTERVAL_SECS: u64 = 10;

/// Bounds for the simulation interval
const MIN_SIM_INTERVAL_SECS: u64 = 1;
const MAX_SIM_INTERVAL_SECS: u64 = 3_600;

/// Default pause after a failed tick
const DEFAULT_SIM_ERROR_BACKOFF_MS: u64 = 2_000;

/// A zero backoff would spin a failing loop
const MIN_SIM_ERROR_BACKOFF_MS: u64 = 100;
const MAX_SIM_ERROR_BACKOFF_MS: u64 = 60_000;

/// Default bound on how long `stop` waits for a loop to exit
const DEFAULT_SIM_STOP_TIMEOUT_SECS: u64 = 5;

const MIN_SIM_STOP_TIMEOUT_SECS: u64 = 1;
const MAX_SIM_STOP_TIMEOUT_SECS: u64 = 60;

/// Default offline buffer sweep interval in seconds
const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 30;

/// Minimum flush interval to prevent hammering the API
const MIN_FLUSH_INTERVAL_SECS: u64 = 1;

/// Maximum flush interval so buffered readings do not go stale
const MAX_FLUSH_INTERVAL_SECS: u64 = 300;

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_RETRIES: u32 = 3;

const DEFAULT_OFFLINE_BUFFER_PATH: &str = "offline-readings.json";

/// A sensor declared on the simulator command line environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedSensor {
    pub id: String,
    pub tipo: String,
}

/// Configuration shared by the server and the standalone simulator.
///
/// All settings can be configured via environment variables:
/// - `CONNECTED_ROOT_BIND_ADDR`: HTTP listen address (default: 0.0.0.0:3000)
/// - `CONNECTED_ROOT_API_URL`: API base URL for the simulator (default: http://localhost:3000)
/// - `CONNECTED_ROOT_SIM_INTERVAL_SECS`: seconds between readings per sensor (default: 10)
/// - `CONNECTED_ROOT_SIM_ERROR_BACKOFF_MS`: pause after a failed tick (default: 2000, 100-60000)
/// - `CONNECTED_ROOT_SIM_STOP_TIMEOUT_SECS`: bounded wait on stop (default: 5, 1-60)
/// - `CONNECTED_ROOT_FLUSH_INTERVAL_SECS`: offline buffer sweep interval (default: 30)
/// - `CONNECTED_ROOT_REQUEST_TIMEOUT_SECS`: HTTP request timeout (default: 30)
/// - `CONNECTED_ROOT_MAX_RETRIES`: client retry attempts (default: 3)
/// - `CONNECTED_ROOT_TEMP_OPTIMAL_MIN` / `_MAX`: optimal temperature band (default: 20 / 23)
/// - `CONNECTED_ROOT_HUMIDITY_OPTIMAL_MIN` / `_MAX`: optimal humidity band (default: 40 / 70)
/// - `CONNECTED_ROOT_TEMP_VALID_MIN` / `_MAX`: accepted temperature range (default: -50 / 100)
/// - `CONNECTED_ROOT_SENSOR_CHECK`: `none`, `exists` or `active` (default: none)
/// - `CONNECTED_ROOT_SENSORS_FILE`: JSON file seeding the sensor registry
/// - `CONNECTED_ROOT_OFFLINE_BUFFER_PATH`: simulator offline queue file
/// - `CONNECTED_ROOT_SIM_SENSORS`: simulator sensors as `id:tipo,id:tipo`
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub api_url: String,
    pub sim_interval: Duration,
    pub sim_error_backoff: Duration,
    pub sim_stop_timeout: Duration,
    pub flush_interval: Duration,
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub temperature_band: OptimalBand,
    pub humidity_band: OptimalBand,
    pub temperature_bounds: ValueBounds,
    pub sensor_check: SensorCheck,
    pub sensors_file: Option<PathBuf>,
    pub offline_buffer_path: PathBuf,
    pub sim_sensors: Vec<SimulatedSensor>,
}

/// Error type for configuration loading failures
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub env_var: Option<String>,
}

impl ConfigError {
    fn for_var(env_var: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            env_var: Some(env_var.to_string()),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.env_var {
            Some(var) => write!(f, "Configuration error for {}: {}", var, self.message),
            None => write!(f, "Configuration error: {}", self.message),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when a variable is set but cannot be parsed, falls
    /// outside its allowed range, or when a band has `min > max`.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use connected_root::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Listening on {}", config.bind_addr);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_addr = {
            let var = "CONNECTED_ROOT_BIND_ADDR";
            let raw = env::var(var).unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string());
            raw.parse::<SocketAddr>()
                .map_err(|_| ConfigError::for_var(var, format!("'{}' is not a valid socket address", raw)))?
        };

        let api_url = env::var("CONNECTED_ROOT_API_URL")
            .unwrap_or_else(|_| DEFAULT_API_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        let sim_interval = Duration::from_secs(parse_bounded(
            "CONNECTED_ROOT_SIM_INTERVAL_SECS",
            DEFAULT_SIM_INTERVAL_SECS,
            MIN_SIM_INTERVAL_SECS,
            MAX_SIM_INTERVAL_SECS,
        )?);

        let sim_error_backoff = Duration::from_millis(parse_bounded(
            "CONNECTED_ROOT_SIM_ERROR_BACKOFF_MS",
            DEFAULT_SIM_ERROR_BACKOFF_MS,
            MIN_SIM_ERROR_BACKOFF_MS,
            MAX_SIM_ERROR_BACKOFF_MS,
        )?);

        let sim_stop_timeout = Duration::from_secs(parse_bounded(
            "CONNECTED_ROOT_SIM_STOP_TIMEOUT_SECS",
            DEFAULT_SIM_STOP_TIMEOUT_SECS,
            MIN_SIM_STOP_TIMEOUT_SECS,
            MAX_SIM_STOP_TIMEOUT_SECS,
        )?);

        let flush_interval = Duration::from_secs(parse_bounded(
            "CONNECTED_ROOT_FLUSH_INTERVAL_SECS",
            DEFAULT_FLUSH_INTERVAL_SECS,
            MIN_FLUSH_INTERVAL_SECS,
            MAX_FLUSH_INTERVAL_SECS,
        )?);

        let request_timeout = Duration::from_secs(parse_or(
            "CONNECTED_ROOT_REQUEST_TIMEOUT_SECS",
            DEFAULT_REQUEST_TIMEOUT_SECS,
        )?);

        let max_retries = parse_or("CONNECTED_ROOT_MAX_RETRIES", DEFAULT_MAX_RETRIES)?;

        let temperature_band = parse_band(
            "CONNECTED_ROOT_TEMP_OPTIMAL",
            OptimalBand::TEMPERATURE_DEFAULT,
        )?;
        let humidity_band = parse_band(
            "CONNECTED_ROOT_HUMIDITY_OPTIMAL",
            OptimalBand::HUMIDITY_DEFAULT,
        )?;

        let temperature_bounds = {
            let default = ValueBounds::TEMPERATURE_DEFAULT;
            let min = parse_or("CONNECTED_ROOT_TEMP_VALID_MIN", default.min)?;
            let max = parse_or("CONNECTED_ROOT_TEMP_VALID_MAX", default.max)?;
            if min > max {
                return Err(ConfigError::for_var(
                    "CONNECTED_ROOT_TEMP_VALID_MIN",
                    format!("minimum {} is greater than maximum {}", min, max),
                ));
            }
            ValueBounds { min, max }
        };

        let sensor_check = match env::var("CONNECTED_ROOT_SENSOR_CHECK") {
            Ok(value) => value.parse::<SensorCheck>().map_err(|message| {
                ConfigError::for_var("CONNECTED_ROOT_SENSOR_CHECK", message)
            })?,
            Err(_) => SensorCheck::None,
        };

        let sensors_file = env::var("CONNECTED_ROOT_SENSORS_FILE").ok().map(PathBuf::from);

        let offline_buffer_path = env::var("CONNECTED_ROOT_OFFLINE_BUFFER_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_OFFLINE_BUFFER_PATH));

        let sim_sensors = match env::var("CONNECTED_ROOT_SIM_SENSORS") {
            Ok(value) => parse_sim_sensors(&value)
                .map_err(|message| ConfigError::for_var("CONNECTED_ROOT_SIM_SENSORS", message))?,
            Err(_) => Vec::new(),
        };

        Ok(Self {
            bind_addr,
            api_url,
            sim_interval,
            sim_error_backoff,
            sim_stop_timeout,
            flush_interval,
            request_timeout,
            max_retries,
            temperature_band,
            humidity_band,
            temperature_bounds,
            sensor_check,
            sensors_file,
            offline_buffer_path,
            sim_sensors,
        })
    }

    /// URL of the reading ingestion endpoint.
    pub fn ingest_url(&self) -> String {
        format!("{}/lecturas", self.api_url)
    }

    /// URL of the health check.
    pub fn health_url(&self) -> String {
        format!("{}/health", self.api_url)
    }
}

impl Default for Config {
    /// Create a configuration from default values only.
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            api_url: DEFAULT_API_URL.to_string(),
            sim_interval: Duration::from_secs(DEFAULT_SIM_INTERVAL_SECS),
            sim_error_backoff: Duration::from_millis(DEFAULT_SIM_ERROR_BACKOFF_MS),
            sim_stop_timeout: Duration::from_secs(DEFAULT_SIM_STOP_TIMEOUT_SECS),
            flush_interval: Duration::from_secs(DEFAULT_FLUSH_INTERVAL_SECS),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            max_retries: DEFAULT_MAX_RETRIES,
            temperature_band: OptimalBand::TEMPERATURE_DEFAULT,
            humidity_band: OptimalBand::HUMIDITY_DEFAULT,
            temperature_bounds: ValueBounds::TEMPERATURE_DEFAULT,
            sensor_check: SensorCheck::None,
            sensors_file: None,
            offline_buffer_path: PathBuf::from(DEFAULT_OFFLINE_BUFFER_PATH),
            sim_sensors: Vec::new(),
        }
    }
}

/// Parse an optional variable, falling back to `default` when unset.
fn parse_or<T: std::str::FromStr>(env_var: &str, default: T) -> Result<T, ConfigError> {
    match env::var(env_var) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::for_var(env_var, format!("'{}' is not a valid number", value))),
        Err(_) => Ok(default),
    }
}

/// Parse an optional integer variable and check it against `[min, max]`.
fn parse_bounded(env_var: &str, default: u64, min: u64, max: u64) -> Result<u64, ConfigError> {
    let value = parse_or(env_var, default)?;

    if value < min {
        return Err(ConfigError::for_var(
            env_var,
            format!("{} is below minimum ({})", value, min),
        ));
    }

    if value > max {
        return Err(ConfigError::for_var(
            env_var,
            format!("{} exceeds maximum ({})", value, max),
        ));
    }

    Ok(value)
}

/// Parse `<prefix>_MIN` / `<prefix>_MAX` into an optimal band.
fn parse_band(prefix: &str, default: OptimalBand) -> Result<OptimalBand, ConfigError> {
    let min_var = format!("{}_MIN", prefix);
    let max_var = format!("{}_MAX", prefix);
    let min = parse_or(&min_var, default.min)?;
    let max = parse_or(&max_var, default.max)?;

    OptimalBand::new(min, max).ok_or_else(|| {
        ConfigError::for_var(&min_var, format!("minimum {} is greater than maximum {}", min, max))
    })
}

/// Parse `id:tipo,id:tipo` into simulator sensors. A missing `tipo` means mixed.
pub fn parse_sim_sensors(value: &str) -> Result<Vec<SimulatedSensor>, String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            let (id, tipo) = match item.split_once(':') {
                Some((id, tipo)) => (id.trim(), tipo.trim()),
                None => (item, "mixto"),
            };
            if id.is_empty() {
                return Err(format!("'{}' has an empty sensor id", item));
            }
            Ok(SimulatedSensor {
                id: id.to_string(),
                tipo: tipo.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Tests below mutate the process environment
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    // Helper to temporarily set environment variables for testing
    struct EnvGuard {
        key: String,
        original: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &str, value: &str) -> Self {
            let original = env::var(key).ok();
            env::set_var(key, value);
            Self {
                key: key.to_string(),
                original,
            }
        }

        fn remove(key: &str) -> Self {
            let original = env::var(key).ok();
            env::remove_var(key);
            Self {
                key: key.to_string(),
                original,
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.original {
                Some(val) => env::set_var(&self.key, val),
                None => env::remove_var(&self.key),
            }
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.api_url, "http://localhost:3000");
        assert_eq!(config.sim_interval, Duration::from_secs(10));
        assert_eq!(config.sim_error_backoff, Duration::from_millis(2000));
        assert_eq!(config.sim_stop_timeout, Duration::from_secs(5));
        assert_eq!(config.flush_interval, Duration::from_secs(30));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.sensor_check, SensorCheck::None);
        assert_eq!(config.ingest_url(), "http://localhost:3000/lecturas");
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let _guard1 = EnvGuard::remove("CONNECTED_ROOT_API_URL");
        let _guard2 = EnvGuard::remove("CONNECTED_ROOT_SIM_INTERVAL_SECS");
        let _guard3 = EnvGuard::remove("CONNECTED_ROOT_FLUSH_INTERVAL_SECS");
        let _guard4 = EnvGuard::remove("CONNECTED_ROOT_SENSOR_CHECK");

        let config = Config::from_env().expect("Should load with defaults");
        assert_eq!(config.api_url, "http://localhost:3000");
        assert_eq!(config.sim_interval, Duration::from_secs(10));
        assert_eq!(config.flush_interval, Duration::from_secs(30));
        assert_eq!(config.temperature_band, OptimalBand::TEMPERATURE_DEFAULT);
    }

    #[test]
    fn test_config_from_env_custom_values() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let _guard1 = EnvGuard::set("CONNECTED_ROOT_API_URL", "http://huerto:9000/");
        let _guard2 = EnvGuard::set("CONNECTED_ROOT_SIM_INTERVAL_SECS", "4");
        let _guard3 = EnvGuard::set("CONNECTED_ROOT_SENSOR_CHECK", "active");
        let _guard4 = EnvGuard::set("CONNECTED_ROOT_TEMP_OPTIMAL_MIN", "18");
        let _guard5 = EnvGuard::set("CONNECTED_ROOT_TEMP_OPTIMAL_MAX", "24.5");

        let config = Config::from_env().expect("Should load custom values");
        assert_eq!(config.api_url, "http://huerto:9000"); // Trailing slash removed
        assert_eq!(config.ingest_url(), "http://huerto:9000/lecturas");
        assert_eq!(config.sim_interval, Duration::from_secs(4));
        assert_eq!(config.sensor_check, SensorCheck::ExistsAndActive);
        assert_eq!(config.temperature_band.min, 18.0);
        assert_eq!(config.temperature_band.max, 24.5);
    }

    #[test]
    fn test_invalid_interval() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let _guard = EnvGuard::set("CONNECTED_ROOT_SIM_INTERVAL_SECS", "not_a_number");

        let err = Config::from_env().unwrap_err();
        assert!(err.message.contains("not a valid number"));
        assert_eq!(err.env_var.as_deref(), Some("CONNECTED_ROOT_SIM_INTERVAL_SECS"));
    }

    #[test]
    fn test_flush_interval_bounds() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        {
            let _guard = EnvGuard::set("CONNECTED_ROOT_FLUSH_INTERVAL_SECS", "0");
            let err = Config::from_env().unwrap_err();
            assert!(err.message.contains("below minimum"));
        }
        {
            let _guard = EnvGuard::set("CONNECTED_ROOT_FLUSH_INTERVAL_SECS", "999");
            let err = Config::from_env().unwrap_err();
            assert!(err.message.contains("exceeds maximum"));
        }
    }

    #[test]
    fn test_zero_backoff_and_stop_timeout_rejected() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        {
            let _guard = EnvGuard::set("CONNECTED_ROOT_SIM_ERROR_BACKOFF_MS", "0");
            let err = Config::from_env().unwrap_err();
            assert!(err.message.contains("below minimum"));
            assert_eq!(err.env_var.as_deref(), Some("CONNECTED_ROOT_SIM_ERROR_BACKOFF_MS"));
        }
        {
            let _guard = EnvGuard::set("CONNECTED_ROOT_SIM_STOP_TIMEOUT_SECS", "0");
            let err = Config::from_env().unwrap_err();
            assert!(err.message.contains("below minimum"));
            assert_eq!(err.env_var.as_deref(), Some("CONNECTED_ROOT_SIM_STOP_TIMEOUT_SECS"));
        }
        {
            let _guard = EnvGuard::set("CONNECTED_ROOT_SIM_ERROR_BACKOFF_MS", "500");
            let config = Config::from_env().expect("500ms backoff is in range");
            assert_eq!(config.sim_error_backoff, Duration::from_millis(500));
        }
    }

    #[test]
    fn test_inverted_band_rejected() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let _guard1 = EnvGuard::set("CONNECTED_ROOT_HUMIDITY_OPTIMAL_MIN", "80");
        let _guard2 = EnvGuard::set("CONNECTED_ROOT_HUMIDITY_OPTIMAL_MAX", "40");

        let err = Config::from_env().unwrap_err();
        assert!(err.message.contains("greater than maximum"));
    }

    #[test]
    fn test_unknown_sensor_check() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let _guard = EnvGuard::set("CONNECTED_ROOT_SENSOR_CHECK", "sometimes");

        let err = Config::from_env().unwrap_err();
        assert_eq!(err.env_var.as_deref(), Some("CONNECTED_ROOT_SENSOR_CHECK"));
    }

    #[test]
    fn test_parse_sim_sensors() {
        let sensors = parse_sim_sensors("s1:temperatura, s2:humedad,s3").unwrap();
        assert_eq!(sensors.len(), 3);
        assert_eq!(sensors[0], SimulatedSensor { id: "s1".into(), tipo: "temperatura".into() });
        assert_eq!(sensors[2].tipo, "mixto");

        assert!(parse_sim_sensors(":humedad").is_err());
        assert!(parse_sim_sensors("").unwrap().is_empty());
    }

    #[test]
    fn test_config_error_display() {
        let error = ConfigError {
            message: "test error".to_string(),
            env_var: Some("TEST_VAR".to_string()),
        };
        assert_eq!(
            format!("{}", error),
            "Configuration error for TEST_VAR: test error"
        );

        let error_no_var = ConfigError {
            message: "general error".to_string(),
            env_var: None,
        };
        assert_eq!(
            format!("{}", error_no_var),
            "Configuration error: general error"
        );
    }
}
