use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, PoisonError, RwLock,
    },
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use log::{info, warn};
use rustls::ClientConfig;
use tokio::time::timeout;

use super::{
    message::{Query, Response, TYPE_NS},
    transport::{Network, Stream},
};

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(1);
pub const MAX_FAILS: u32 = 2;

/// Liveness of one upstream, as seen by an upstream-selection policy.
#[async_trait]
pub trait Health: Send + Sync {
    /// Probes the upstream once and updates the failure count.
    async fn check(&self) -> Result<()>;

    fn is_healthy(&self) -> bool;

    fn set_tls_config(&self, config: Option<Arc<ClientConfig>>);
}

pub struct UpstreamHealth {
    addr: String,
    network: RwLock<Network>,
    tls_config: ArcSwapOption<ClientConfig>,
    fails: AtomicU32,
    max_fails: u32,
    probe_timeout: Duration,
}

impl UpstreamHealth {
    pub fn new(addr: impl Into<String>, network: Network) -> Self {
        Self {
            addr: addr.into(),
            network: RwLock::new(network),
            tls_config: ArcSwapOption::empty(),
            fails: AtomicU32::new(0),
            max_fails: MAX_FAILS,
            probe_timeout: PROBE_TIMEOUT,
        }
    }

    pub fn with_probe(mut self, probe_timeout: Duration, max_fails: u32) -> Self {
        self.probe_timeout = probe_timeout;
        self.max_fails = max_fails;
        self
    }

    pub fn network(&self) -> Network {
        *self.network.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn fails(&self) -> u32 {
        self.fails.load(Ordering::SeqCst)
    }

    async fn probe(&self, network: Network) -> Result<()> {
        let query = Query::build(fastrand::u16(..), ".", TYPE_NS, false)?;
        timeout(self.probe_timeout, self.exchange_probe(network, &query))
            .await
            .map_err(|_| anyhow!("no reply within {:?}", self.probe_timeout))?
    }

    async fn exchange_probe(&self, network: Network, query: &Query) -> Result<()> {
        let mut stream = Stream::connect(&self.addr, network, self.tls_config.load_full()).await?;
        stream.write_message(query.bytes()).await?;
        loop {
            let response = Response::from_bytes(stream.read_message().await?)?;
            if response.id() == query.id() {
                return Ok(());
            }
        }
    }
}

#[async_trait]
impl Health for UpstreamHealth {
    async fn check(&self) -> Result<()> {
        let network = self.network();
        let result = self
            .probe(network)
            .await
            .with_context(|| format!("Health check of {} over {}", self.addr, network));
        match &result {
            Ok(()) => {
                if self.fails.swap(0, Ordering::SeqCst) >= self.max_fails {
                    info!("Upstream {} is alive again", self.addr);
                }
            }
            Err(err) => {
                let fails = self.fails.fetch_add(1, Ordering::SeqCst) + 1;
                warn!("{:#} ({} failures in a row)", err, fails);
            }
        }
        result
    }

    fn is_healthy(&self) -> bool {
        self.fails() < self.max_fails
    }

    fn set_tls_config(&self, config: Option<Arc<ClientConfig>>) {
        if config.is_some() {
            *self.network.write().unwrap_or_else(PoisonError::into_inner) = Network::TcpTls;
        }
        self.tls_config.store(config);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anyhow::Result;
    use bytes::Bytes;
    use pretty_assertions::assert_eq;
    use tokio::net::UdpSocket;

    use super::{Health, UpstreamHealth};
    use crate::dns::{
        message::{response_bytes, Query},
        transport::{default_tls_config, Network},
    };

    async fn udp_responder(answer: bool) -> Result<String> {
        let socket = UdpSocket::bind("127.0.0.1:0").await?;
        let addr = socket.local_addr()?.to_string();
        tokio::spawn(async move {
            let mut buf = [0; 512];
            while let Ok((read, peer)) = socket.recv_from(&mut buf).await {
                let Ok(query) = Query::from_bytes(Bytes::copy_from_slice(&buf[..read])) else {
                    continue;
                };
                if answer {
                    let _ = socket.send_to(&response_bytes(query.id().wrapping_add(1), 0), peer).await;
                    let _ = socket.send_to(&response_bytes(query.id(), 0), peer).await;
                }
            }
        });
        Ok(addr)
    }

    #[tokio::test]
    async fn should_pass_when_upstream_answers() -> Result<()> {
        let addr = udp_responder(true).await?;
        let health = UpstreamHealth::new(addr, Network::Udp);

        health.check().await?;

        assert!(health.is_healthy());
        assert_eq!(health.fails(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn should_become_unhealthy_after_max_fails() -> Result<()> {
        let addr = udp_responder(false).await?;
        let health =
            UpstreamHealth::new(addr, Network::Udp).with_probe(Duration::from_millis(20), 2);

        assert!(health.check().await.is_err());
        assert!(health.is_healthy());
        assert!(health.check().await.is_err());

        assert!(!health.is_healthy());
        assert_eq!(health.fails(), 2);
        Ok(())
    }

    #[test]
    fn should_switch_to_tls_only_with_config() {
        let health = UpstreamHealth::new("9.9.9.9:853", Network::Tcp);

        health.set_tls_config(None);
        assert_eq!(health.network(), Network::Tcp);

        health.set_tls_config(Some(default_tls_config()));
        assert_eq!(health.network(), Network::TcpTls);
    }
}
