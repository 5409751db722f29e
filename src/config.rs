use dotenvy::dotenv;
use std::env;
use std::time::Duration;
use thiserror::Error;
use tracing::Level;

pub const APP_NAME: &str = "laporte-mqtt";

#[derive(Debug, Clone)]
pub struct Config {
    pub hub_host: String,
    pub hub_port: u16,
    pub hub_path: String,
    pub hub_reconnect_wait_ms: u64,

    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_keepalive_secs: u64,
    pub mqtt_client_prefix: String,
    pub mqtt_poll_interval_ms: u64,
    pub mqtt_reconnect_wait_ms: u64,

    pub config_file: String,
    pub log_level: Level,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Environment variable {0} is missing or invalid.")]
    MissingOrInvalid(String),
    #[error("Parsing error: {0}")]
    ParsingError(String),
}

impl Config {
    /// Validate ports, keepalive and the supervisory intervals.
    fn validate(&self) -> Result<(), ConfigError> {
        const MIN_INTERVAL: u64 = 100;
        const MAX_INTERVAL: u64 = 1_000_000;

        if self.mqtt_port == 0 {
            return Err(ConfigError::MissingOrInvalid("MQTT_BROKER_PORT".to_string()));
        }
        if self.hub_port == 0 {
            return Err(ConfigError::MissingOrInvalid("HUB_PORT".to_string()));
        }
        if self.mqtt_keepalive_secs == 0 {
            return Err(ConfigError::ParsingError(
                "MQTT_KEEPALIVE must be at least 1 second".to_string(),
            ));
        }

        for (name, value) in [
            ("MQTT_POLL_INTERVAL_MS", self.mqtt_poll_interval_ms),
            ("MQTT_RECONNECT_WAIT_MS", self.mqtt_reconnect_wait_ms),
            ("HUB_RECONNECT_WAIT_MS", self.hub_reconnect_wait_ms),
        ] {
            if !(MIN_INTERVAL..=MAX_INTERVAL).contains(&value) {
                return Err(ConfigError::ParsingError(format!(
                    "{} must be between {} and {} ms",
                    name, MIN_INTERVAL, MAX_INTERVAL
                )));
            }
        }

        Ok(())
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok(); // Load environment variables from .env file

        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let string_or = |name: &str, default: &str| lookup(name).unwrap_or_else(|| default.to_string());

        let verbose = parse_bool(&string_or("LOG_VERBOSE", "false"));
        let log_level = if verbose {
            Level::DEBUG
        } else {
            parse_log_level(&string_or("LOG_LEVEL", "INFO"))?
        };

        let config = Self {
            // Hub
            hub_host: string_or("HUB_HOST", "127.0.0.1"),
            hub_port: parse_number(&lookup, "HUB_PORT", 1883)?,
            hub_path: string_or("HUB_PATH", "/"),
            hub_reconnect_wait_ms: parse_number(&lookup, "HUB_RECONNECT_WAIT_MS", 10_000)?,

            // MQTT broker
            mqtt_host: string_or("MQTT_BROKER_HOST", "127.0.0.1"),
            mqtt_port: parse_number(&lookup, "MQTT_BROKER_PORT", 1883)?,
            mqtt_keepalive_secs: parse_number(&lookup, "MQTT_KEEPALIVE", 30)?,
            mqtt_client_prefix: string_or("MQTT_CLIENT_PREFIX", APP_NAME),
            mqtt_poll_interval_ms: parse_number(&lookup, "MQTT_POLL_INTERVAL_MS", 1_000)?,
            mqtt_reconnect_wait_ms: parse_number(&lookup, "MQTT_RECONNECT_WAIT_MS", 10_000)?,

            config_file: string_or("CONFIG_FILE", "conf/gateways.yml"),
            log_level,
        };

        config.validate()?;

        Ok(config)
    }

    pub fn hub_url(&self) -> String {
        format!(
            "ws://{}:{}/{}",
            self.hub_host,
            self.hub_port,
            self.hub_path.trim_start_matches('/')
        )
    }

    /// MQTT client id: the configured prefix plus a per-process instance id.
    pub fn client_id(&self) -> String {
        format!("{}_{}", self.mqtt_client_prefix, instance_id())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.mqtt_poll_interval_ms)
    }

    pub fn mqtt_reconnect_wait(&self) -> Duration {
        Duration::from_millis(self.mqtt_reconnect_wait_ms)
    }

    pub fn hub_reconnect_wait(&self) -> Duration {
        Duration::from_millis(self.hub_reconnect_wait_ms)
    }
}

/// Ten hex digits derived from the start time in 1/256 s ticks.
fn instance_id() -> String {
    let ticks = time::OffsetDateTime::now_utc().unix_timestamp_nanos() * 256 / 1_000_000_000;
    let hex = format!("{:010x}", ticks);
    hex[..10].to_string()
}

fn parse_number<F, T>(lookup: &F, name: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::ParsingError(format!("{} must be a valid number", name))),
        None => Ok(default),
    }
}

fn parse_bool(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn parse_log_level(raw: &str) -> Result<Level, ConfigError> {
    match raw.trim().to_ascii_uppercase().as_str() {
        "CRITICAL" | "ERROR" => Ok(Level::ERROR),
        "WARNING" | "WARN" => Ok(Level::WARN),
        "INFO" => Ok(Level::INFO),
        "DEBUG" => Ok(Level::DEBUG),
        "TRACE" => Ok(Level::TRACE),
        other => Err(ConfigError::ParsingError(format!(
            "invalid LOG_LEVEL {} (choose from CRITICAL, ERROR, WARNING, INFO, DEBUG, TRACE)",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = from_pairs(&[]).unwrap();
        assert_eq!(config.mqtt_host, "127.0.0.1");
        assert_eq!(config.mqtt_port, 1883);
        assert_eq!(config.mqtt_keepalive_secs, 30);
        assert_eq!(config.config_file, "conf/gateways.yml");
        assert_eq!(config.log_level, Level::INFO);
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.mqtt_reconnect_wait(), Duration::from_secs(10));
        assert_eq!(config.hub_url(), "ws://127.0.0.1:1883/");
    }

    #[test]
    fn test_overrides() {
        let config = from_pairs(&[
            ("MQTT_BROKER_HOST", "broker.local"),
            ("MQTT_BROKER_PORT", "8883"),
            ("HUB_HOST", "hub.local"),
            ("HUB_PORT", "5000"),
            ("HUB_PATH", "/events"),
            ("LOG_LEVEL", "warning"),
        ])
        .unwrap();
        assert_eq!(config.mqtt_host, "broker.local");
        assert_eq!(config.mqtt_port, 8883);
        assert_eq!(config.hub_url(), "ws://hub.local:5000/events");
        assert_eq!(config.log_level, Level::WARN);
    }

    #[test]
    fn test_verbose_forces_debug() {
        let config = from_pairs(&[("LOG_LEVEL", "ERROR"), ("LOG_VERBOSE", "true")]).unwrap();
        assert_eq!(config.log_level, Level::DEBUG);
    }

    #[test]
    fn test_invalid_port() {
        assert!(matches!(
            from_pairs(&[("MQTT_BROKER_PORT", "not-a-port")]),
            Err(ConfigError::ParsingError(_))
        ));
        assert!(matches!(
            from_pairs(&[("MQTT_BROKER_PORT", "0")]),
            Err(ConfigError::MissingOrInvalid(_))
        ));
    }

    #[test]
    fn test_invalid_log_level() {
        assert!(from_pairs(&[("LOG_LEVEL", "LOUD")]).is_err());
    }

    #[test]
    fn test_interval_out_of_range() {
        assert!(from_pairs(&[("MQTT_POLL_INTERVAL_MS", "5")]).is_err());
    }

    #[test]
    fn test_client_id_format() {
        let config = from_pairs(&[("MQTT_CLIENT_PREFIX", "bridge")]).unwrap();
        let id = config.client_id();
        let (prefix, instance) = id.split_once('_').unwrap();
        assert_eq!(prefix, "bridge");
        assert_eq!(instance.len(), 10);
        assert!(instance.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
