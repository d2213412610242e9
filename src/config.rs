use std::{net::SocketAddr, time::Duration};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::dns::{client::Timeouts, health, transport::Network};

#[derive(Debug, Deserialize)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub metrics_bind_addr: SocketAddr,
    pub upstream: Upstream,
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default)]
    pub health_check: HealthCheck,
}

impl Config {
    pub fn init() -> Result<Self> {
        let config_name = std::env::args()
            .nth(1)
            .context("Config file should be specified as first argument")?;
        Self::load(config::File::with_name(&config_name))
    }

    pub fn load(source: impl config::Source + Send + Sync + 'static) -> Result<Self> {
        let settings = config::Config::builder().add_source(source).build()?;
        Ok(settings.try_deserialize::<Self>()?)
    }
}

#[derive(Debug, Deserialize)]
pub struct Upstream {
    pub addr: String,
    pub network: Network,
}

#[derive(Debug, Deserialize)]
pub struct HealthCheck {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,
    pub max_fails: u32,
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            probe_timeout: health::PROBE_TIMEOUT,
            max_fails: health::MAX_FAILS,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anyhow::Result;
    use config::{File, FileFormat};
    use pretty_assertions::assert_eq;

    use super::Config;
    use crate::dns::{client::Timeouts, transport::Network};

    #[test]
    fn should_read_yaml() -> Result<()> {
        let yaml = r#"
bind_addr: 127.0.0.1:5353
metrics_bind_addr: 127.0.0.1:9153
upstream:
  addr: 1.1.1.1:853
  network: tcp-tls
timeouts:
  write: 3s
  read: 500ms
health_check:
  interval: 30s
  probe_timeout: 2s
  max_fails: 5
"#;

        let config = Config::load(File::from_str(yaml, FileFormat::Yaml))?;

        assert_eq!(config.upstream.addr, "1.1.1.1:853");
        assert_eq!(config.upstream.network, Network::TcpTls);
        assert_eq!(
            config.timeouts,
            Timeouts {
                write: Duration::from_secs(3),
                read: Duration::from_millis(500),
            }
        );
        assert_eq!(config.health_check.interval, Duration::from_secs(30));
        assert_eq!(config.health_check.max_fails, 5);
        Ok(())
    }

    #[test]
    fn should_default_optional_sections() -> Result<()> {
        let yaml = r#"
bind_addr: 127.0.0.1:5353
metrics_bind_addr: 127.0.0.1:9153
upstream:
  addr: 8.8.8.8:53
  network: udp
"#;

        let config = Config::load(File::from_str(yaml, FileFormat::Yaml))?;

        assert_eq!(config.upstream.network, Network::Udp);
        assert_eq!(config.timeouts, Timeouts::default());
        assert_eq!(config.health_check.interval, Duration::from_secs(10));
        Ok(())
    }
}
