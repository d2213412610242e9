use std::{
    io,
    ops::{Deref, DerefMut},
    sync::Arc,
    time::Duration,
};

use anyhow::{ensure, Result};
use async_trait::async_trait;
use log::debug;
use rustls::ClientConfig;
use serde::Deserialize;
use tokio::time::Instant;

use super::DnsClient;
use crate::dns::{
    health::{Health, UpstreamHealth},
    message::{rcode_name, Query, Response},
    metrics::MetricsSink,
    transport::{Connection, Network, PooledTransport, Transport},
};

pub const MAX_TIMEOUT: Duration = Duration::from_secs(2);
pub const READ_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, Eq, PartialEq, Deserialize)]
pub struct Timeouts {
    #[serde(with = "humantime_serde")]
    pub write: Duration,
    #[serde(with = "humantime_serde")]
    pub read: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            write: MAX_TIMEOUT,
            read: READ_TIMEOUT,
        }
    }
}

/// A query together with the protocol it arrived over.
#[derive(Debug, Clone)]
pub struct Request {
    query: Query,
    protocol: Network,
}

impl Request {
    pub fn new(query: Query, protocol: Network) -> Self {
        Self { query, protocol }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn protocol(&self) -> Network {
        self.protocol
    }

    pub fn id(&self) -> u16 {
        self.query.id()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    #[error("failed to connect to {addr}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to send request to {addr}")]
    Write {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to read response from {addr}")]
    Read {
        addr: String,
        #[source]
        source: io::Error,
    },
}

impl ExchangeError {
    pub fn is_timeout(&self) -> bool {
        let source = match self {
            ExchangeError::Connect { source, .. }
            | ExchangeError::Write { source, .. }
            | ExchangeError::Read { source, .. } => source,
        };
        source.kind() == io::ErrorKind::TimedOut
    }
}

/// Client of a single upstream nameserver. One instance serves any number of
/// concurrent exchanges.
pub struct UpstreamClient {
    addr: String,
    network: Network,
    transport: Box<dyn Transport>,
    health: Arc<dyn Health>,
    metrics: Arc<dyn MetricsSink>,
    timeouts: Timeouts,
}

impl UpstreamClient {
    /// Does no network i/o; connections are dialed by the first exchange.
    pub fn new(addr: impl Into<String>, network: Network, metrics: Arc<dyn MetricsSink>) -> Self {
        let addr = addr.into();
        let transport = Box::new(PooledTransport::new(addr.clone()));
        let health = Arc::new(UpstreamHealth::new(addr.clone(), network));
        Self::with_parts(addr, network, transport, health, metrics)
    }

    pub fn with_parts(
        addr: impl Into<String>,
        network: Network,
        transport: Box<dyn Transport>,
        health: Arc<dyn Health>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            addr: addr.into(),
            network,
            transport,
            health,
            metrics,
            timeouts: Timeouts::default(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Result<Self> {
        ensure!(
            timeouts.read < timeouts.write,
            "Read timeout {:?} should be shorter than write timeout {:?}",
            timeouts.read,
            timeouts.write
        );
        self.timeouts = timeouts;
        Ok(self)
    }

    /// `Some` switches further exchanges to `tcp-tls`. The config reaches the
    /// transport and the health tracker either way.
    pub fn set_tls_config(&mut self, config: Option<Arc<ClientConfig>>) {
        if config.is_some() {
            self.network = Network::TcpTls;
        }
        self.transport.set_tls_config(config.clone());
        self.health.set_tls_config(config);
    }

    pub fn endpoint(&self) -> &str {
        &self.addr
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn health(&self) -> Arc<dyn Health> {
        self.health.clone()
    }

    /// Sends `request` and waits for the response carrying the same id.
    ///
    /// Connections are pooled, so replies to earlier, abandoned requests may
    /// arrive first; they are skipped. Skipping does not extend the read
    /// deadline.
    pub async fn exchange(&self, request: &Request) -> Result<Response, ExchangeError> {
        let start = Instant::now();
        let mut conn = self
            .transport
            .dial(self.network)
            .await
            .map(Release)
            .map_err(|source| ExchangeError::Connect {
                addr: self.addr.clone(),
                source,
            })?;

        conn.set_write_deadline(Instant::now() + self.timeouts.write);
        conn.write_message(request.query().bytes())
            .await
            .map_err(|source| ExchangeError::Write {
                addr: self.addr.clone(),
                source,
            })?;

        conn.set_read_deadline(Instant::now() + self.timeouts.read);
        let response = loop {
            let message = conn
                .read_message()
                .await
                .map_err(|source| self.read_error(source))?;
            let response = Response::from_bytes(message)
                .map_err(|err| self.read_error(io::Error::new(io::ErrorKind::InvalidData, err)))?;
            if response.id() == request.id() {
                break response;
            }
            debug!(
                "Skipping stale response {} from {} while waiting for {}",
                response.id(),
                self.addr,
                request.id()
            );
        };

        let rcode = rcode_name(response.rcode());
        self.metrics
            .record_exchange(&self.addr, &rcode, start.elapsed());
        Ok(response)
    }

    fn read_error(&self, source: io::Error) -> ExchangeError {
        ExchangeError::Read {
            addr: self.addr.clone(),
            source,
        }
    }
}

#[async_trait]
impl DnsClient for UpstreamClient {
    async fn send(&self, request: Request) -> Result<Response> {
        Ok(self.exchange(&request).await?)
    }
}

/// Closes the wrapped connection when dropped.
struct Release(Box<dyn Connection>);

impl Deref for Release {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl DerefMut for Release {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.0.as_mut()
    }
}

impl Drop for Release {
    fn drop(&mut self) {
        self.0.close();
    }
}
