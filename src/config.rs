use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;
use std::time::Duration;
use validator::{Validate, ValidationError};

use crate::modbus::{ConnectionOptions, Endpoint};
use crate::registers::PollGroup;
use crate::scheduler::{RetryPolicy, DEFAULT_QUEUE_CAPACITY};
use crate::session::{Credentials, SessionOptions};

/// Environment variable naming an extra TOML file layered over the defaults.
pub const CONFIG_PATH_ENV: &str = "SUN2000_CONFIG";
/// Prefix for per-key environment overrides, e.g. `SUN2000__SESSION__PASSWORD`.
pub const ENV_PREFIX: &str = "SUN2000__";

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct Config {
    #[validate(nested)]
    pub transport: TransportConfig,
    #[serde(default)]
    #[validate(nested)]
    pub session: SessionConfig,
    #[serde(default)]
    #[validate(nested)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub poll: PollConfig,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct TransportConfig {
    pub endpoint: Endpoint,
    /// Units reachable over the endpoint. The first is the primary inverter;
    /// the rest (a cascaded inverter, say) share its link.
    #[serde(default = "default_slave_ids")]
    #[validate(length(min = 1), custom(function = "validate_slave_ids"))]
    pub slave_ids: Vec<u8>,
}

impl TransportConfig {
    pub fn primary_slave(&self) -> u8 {
        self.slave_ids.first().copied().unwrap_or(DEFAULT_SLAVE_ID)
    }
}

const DEFAULT_SLAVE_ID: u8 = 1;
const MAX_SLAVE_ID: u8 = 247;

fn validate_slave_ids(ids: &[u8]) -> std::result::Result<(), ValidationError> {
    if ids.iter().any(|id| *id > MAX_SLAVE_ID) {
        return Err(ValidationError::new("slave_id_out_of_range"));
    }
    let mut seen = ids.to_vec();
    seen.sort_unstable();
    seen.dedup();
    if seen.len() != ids.len() {
        return Err(ValidationError::new("duplicate_slave_id"));
    }
    Ok(())
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SessionConfig {
    #[serde(default = "default_username")]
    pub username: String,
    /// Without a password every privileged write fails.
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_expiry_seconds")]
    #[validate(range(min = 1))]
    pub expiry_seconds: u64,
    #[serde(default = "default_heartbeat_seconds")]
    #[validate(range(min = 1))]
    pub heartbeat_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SchedulerConfig {
    #[serde(default = "default_request_timeout_ms")]
    #[validate(range(min = 1))]
    pub request_timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    #[validate(range(max = 10))]
    pub max_retries: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_reconnect_attempts")]
    #[validate(range(min = 1, max = 10))]
    pub reconnect_attempts: u32,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_queue_capacity")]
    #[validate(range(min = 1))]
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollConfig {
    #[serde(default = "default_groups")]
    pub groups: Vec<PollGroup>,
    /// Extra quantities polled with the inverter group.
    #[serde(default)]
    pub extra: Vec<String>,
}

fn default_slave_ids() -> Vec<u8> {
    vec![DEFAULT_SLAVE_ID]
}
fn default_username() -> String {
    "installer".into()
}
fn default_expiry_seconds() -> u64 {
    600
}
fn default_heartbeat_seconds() -> u64 {
    15
}
fn default_request_timeout_ms() -> u64 {
    5_000
}
fn default_max_retries() -> u32 {
    2
}
fn default_backoff_ms() -> u64 {
    500
}
fn default_reconnect_attempts() -> u32 {
    2
}
fn default_reconnect_delay_ms() -> u64 {
    500
}
fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}
fn default_groups() -> Vec<PollGroup> {
    vec![PollGroup::Inverter, PollGroup::PowerMeter, PollGroup::Battery]
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            username: default_username(),
            password: None,
            expiry_seconds: default_expiry_seconds(),
            heartbeat_seconds: default_heartbeat_seconds(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
            reconnect_attempts: default_reconnect_attempts(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            groups: default_groups(),
            extra: Vec::new(),
        }
    }
}

impl SessionConfig {
    pub fn credentials(&self) -> Option<Credentials> {
        self.password
            .as_ref()
            .map(|password| Credentials::new(self.username.clone(), password.clone()))
    }

    pub fn options(&self) -> SessionOptions {
        SessionOptions {
            expiry: Duration::from_secs(self.expiry_seconds),
            heartbeat_interval: Duration::from_secs(self.heartbeat_seconds),
        }
    }
}

impl SchedulerConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff: Duration::from_millis(self.backoff_ms),
        }
    }
}

impl Config {
    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            request_timeout: Duration::from_millis(self.scheduler.request_timeout_ms),
            reconnect_attempts: self.scheduler.reconnect_attempts,
            reconnect_delay: Duration::from_millis(self.scheduler.reconnect_delay_ms),
        }
    }

    /// `config/default.toml`, then `$SUN2000_CONFIG`, then `SUN2000__*` env vars.
    pub fn load() -> Result<Self> {
        let mut figment = Figment::new().merge(Toml::file("config/default.toml"));
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            figment = figment.merge(Toml::file(path));
        }
        Self::from_figment(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: Config = figment.extract().context("invalid configuration")?;
        config.validate().context("configuration out of range")?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::Parity;
    use rstest::rstest;

    const TCP: &str = r#"
        [transport]
        slave_ids = [1]

        [transport.endpoint]
        kind = "tcp"
        host = "192.168.200.1"
        port = 6607

        [session]
        password = "00000a"
    "#;

    #[test]
    fn test_tcp_config_with_defaults() {
        let config = Config::from_figment(Figment::new().merge(Toml::string(TCP))).unwrap();
        assert_eq!(
            config.transport.endpoint,
            Endpoint::Tcp {
                host: "192.168.200.1".into(),
                port: 6607
            }
        );
        assert_eq!(config.transport.slave_ids, vec![1]);
        assert_eq!(config.session.username, "installer");
        assert!(config.session.credentials().is_some());
        assert_eq!(config.scheduler.max_retries, 2);
        assert_eq!(config.session.options().heartbeat_interval, Duration::from_secs(15));
        assert_eq!(config.poll.groups.len(), 3);
    }

    #[test]
    fn test_serial_config() {
        let toml = r#"
            [transport.endpoint]
            kind = "serial"
            path = "/dev/ttyUSB0"
            parity = "even"
        "#;
        let config = Config::from_figment(Figment::new().merge(Toml::string(toml))).unwrap();
        let Endpoint::Serial(ref serial) = config.transport.endpoint else {
            panic!("expected serial endpoint");
        };
        assert_eq!(serial.baud_rate, 9600);
        assert_eq!(serial.data_bits, 8);
        assert_eq!(serial.parity, Parity::Even);
        assert!(config.session.credentials().is_none());
        assert_eq!(config.transport.primary_slave(), 1);
    }

    fn with_slaves(ids: &str) -> Result<Config> {
        let toml = format!(
            r#"
            [transport]
            slave_ids = {ids}
            [transport.endpoint]
            kind = "tcp"
            host = "inverter"
        "#
        );
        Config::from_figment(Figment::new().merge(Toml::string(&toml)))
    }

    #[rstest]
    #[case("[250]")]
    #[case("[1, 248]")]
    #[case("[]")]
    #[case("[1, 2, 1]")]
    fn test_bad_slave_ids_rejected(#[case] ids: &str) {
        assert!(with_slaves(ids).is_err(), "{ids}");
    }

    #[test]
    fn test_several_slave_ids() {
        let config = with_slaves("[16, 1]").unwrap();
        assert_eq!(config.transport.slave_ids, vec![16, 1]);
        assert_eq!(config.transport.primary_slave(), 16);
    }

    #[test]
    fn test_env_overrides_file() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("SUN2000__SCHEDULER__MAX_RETRIES", "5");
            jail.set_env("SUN2000__SESSION__PASSWORD", "secret");
            let figment = Figment::new()
                .merge(Toml::string(TCP))
                .merge(Env::prefixed(ENV_PREFIX).split("__"));
            let config = Config::from_figment(figment).map_err(|e| e.to_string())?;
            assert_eq!(config.scheduler.max_retries, 5);
            assert_eq!(config.session.password.as_deref(), Some("secret"));
            Ok(())
        });
    }
}
