use std::fmt;
use std::fs;

use serde::Deserialize;
use tpu_client::domain::ServiceKind;

#[derive(Clone, Deserialize)]
pub struct PortalConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for PortalConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortalConfig")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// One meter selected for polling, identified the way the portal's usage
/// endpoint wants it.
#[derive(Debug, Clone, Deserialize)]
pub struct MeterConfig {
    pub kind: ServiceKind,
    pub meter_number: String,
    pub service_id: String,
    pub service_number: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollConfig {
    #[serde(default = "default_interval_hours")]
    pub interval_hours: u64,
    #[serde(default = "default_lookback_days")]
    pub lookback_days: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_hours: default_interval_hours(),
            lookback_days: default_lookback_days(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub uri: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SinkConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            flush_interval_ms: default_flush_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub portal: PortalConfig,
    #[serde(default)]
    pub poll: PollConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub sink: SinkConfig,
    pub meters: Vec<MeterConfig>,
    pub metrics: Option<MetricsConfig>,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        use std::env;

        let path = env::var("POLLER_CONFIG").unwrap_or_else(|_| "poller-config.toml".to_string());
        let contents = fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("failed to read config file '{path}': {e}"))?;
        let cfg: AppConfig = toml::from_str(&contents)?;
        Ok(cfg)
    }
}

fn default_base_url() -> String {
    tpu_client::DEFAULT_BASE_URL.to_string()
}

fn default_interval_hours() -> u64 {
    1
}

fn default_lookback_days() -> u32 {
    7
}

fn default_max_connections() -> u32 {
    4
}

fn default_batch_size() -> usize {
    64
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_flush_interval_ms() -> u64 {
    5000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_full_config() {
        let cfg: AppConfig = toml::from_str(
            r#"
            [portal]
            base_url = "https://portal.test"
            username = "user@example.com"
            password = "hunter2"

            [poll]
            interval_hours = 2
            lookback_days = 14

            [database]
            uri = "postgres://localhost/statistics"
            max_connections = 8

            [sink]
            batch_size = 100
            max_retries = 5
            retry_backoff_ms = 250
            flush_interval_ms = 1000

            [[meters]]
            kind = "power"
            meter_number = "11399586"
            service_id = "800366496"
            service_number = "AESBYKH2"

            [[meters]]
            kind = "water"
            meter_number = "11189080"
            service_id = "800365849"
            service_number = "AW43XCF1"

            [metrics]
            bind_addr = "127.0.0.1:9187"
            "#,
        )
        .unwrap();

        assert_eq!(cfg.portal.base_url, "https://portal.test");
        assert_eq!(cfg.poll.interval_hours, 2);
        assert_eq!(cfg.meters.len(), 2);
        assert_eq!(cfg.meters[0].kind, ServiceKind::Power);
        assert_eq!(cfg.meters[1].kind, ServiceKind::Water);
        assert_eq!(cfg.metrics.unwrap().bind_addr, "127.0.0.1:9187");
    }

    #[test]
    fn minimal_config_falls_back_to_defaults() {
        let cfg: AppConfig = toml::from_str(
            r#"
            [portal]
            username = "user@example.com"
            password = "hunter2"

            [database]
            uri = "postgres://localhost/statistics"

            [[meters]]
            kind = "power"
            meter_number = "1"
            service_id = "2"
            service_number = "3"
            "#,
        )
        .unwrap();

        assert_eq!(cfg.portal.base_url, tpu_client::DEFAULT_BASE_URL);
        assert_eq!(cfg.poll.interval_hours, 1);
        assert_eq!(cfg.poll.lookback_days, 7);
        assert_eq!(cfg.sink.batch_size, 64);
        assert!(cfg.metrics.is_none());
    }

    #[test]
    fn config_debug_redacts_the_password() {
        let cfg: PortalConfig = toml::from_str(
            r#"
            username = "user@example.com"
            password = "hunter2"
            "#,
        )
        .unwrap();
        let rendered = format!("{cfg:?}");
        assert!(!rendered.contains("hunter2"));
    }
}
