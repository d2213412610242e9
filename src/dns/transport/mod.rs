use std::{
    collections::HashMap,
    fmt,
    future::Future,
    io,
    str::FromStr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use anyhow::anyhow;
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use bytes::Bytes;
use log::debug;
use rustls::ClientConfig;
use serde::Deserialize;
use tokio::time::{timeout, timeout_at, Instant};

mod stream;

pub use stream::default_tls_config;
pub(crate) use stream::Stream;

pub const DIAL_TIMEOUT: Duration = Duration::from_secs(2);
pub const IDLE_EXPIRE: Duration = Duration::from_secs(10);
pub const MAX_IDLE_PER_NETWORK: usize = 4;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Network {
    Udp,
    Tcp,
    TcpTls,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Network::Udp => "udp",
            Network::Tcp => "tcp",
            Network::TcpTls => "tcp-tls",
        })
    }
}

impl FromStr for Network {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "udp" => Ok(Network::Udp),
            "tcp" => Ok(Network::Tcp),
            "tcp-tls" => Ok(Network::TcpTls),
            other => Err(anyhow!("Unknown network {}", other)),
        }
    }
}

/// Source of message-oriented connections to one upstream address.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn dial(&self, network: Network) -> io::Result<Box<dyn Connection>>;

    /// Used by subsequent `tcp-tls` dials. `None` clears it.
    fn set_tls_config(&self, config: Option<Arc<ClientConfig>>);
}

#[async_trait]
pub trait Connection: Send {
    fn set_write_deadline(&mut self, deadline: Instant);

    fn set_read_deadline(&mut self, deadline: Instant);

    async fn write_message(&mut self, message: &[u8]) -> io::Result<()>;

    async fn read_message(&mut self) -> io::Result<Bytes>;

    /// Gives the connection back to its transport. The connection is unusable afterwards.
    fn close(&mut self);
}

pub struct PooledTransport {
    addr: String,
    tls_config: ArcSwapOption<ClientConfig>,
    pool: Arc<Pool>,
}

impl PooledTransport {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            tls_config: ArcSwapOption::empty(),
            pool: Arc::default(),
        }
    }

    pub fn idle_connections(&self, network: Network) -> usize {
        self.pool.len(network)
    }
}

#[async_trait]
impl Transport for PooledTransport {
    async fn dial(&self, network: Network) -> io::Result<Box<dyn Connection>> {
        let (stream, generation) = match self.pool.take(network) {
            Some(pooled) => {
                debug!("Reusing pooled {} connection to {}", network, self.addr);
                pooled
            }
            None => {
                // Read before the config, so a racing config change marks the stream stale.
                let generation = self.pool.generation();
                let stream = timeout(
                    DIAL_TIMEOUT,
                    Stream::connect(&self.addr, network, self.tls_config.load_full()),
                )
                .await
                .map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("dial {} {} timed out", network, self.addr),
                    )
                })??;
                (stream, generation)
            }
        };
        Ok(Box::new(PooledConnection {
            stream: Some(stream),
            network,
            generation,
            pool: self.pool.clone(),
            write_deadline: None,
            read_deadline: None,
            dirty: false,
        }))
    }

    fn set_tls_config(&self, config: Option<Arc<ClientConfig>>) {
        self.tls_config.store(config);
        self.pool.renew_tls();
    }
}

struct PooledConnection {
    stream: Option<Stream>,
    network: Network,
    generation: u64,
    pool: Arc<Pool>,
    write_deadline: Option<Instant>,
    read_deadline: Option<Instant>,
    // Set while an operation is in flight and kept on failure; dirty streams are not pooled.
    dirty: bool,
}

#[async_trait]
impl Connection for PooledConnection {
    fn set_write_deadline(&mut self, deadline: Instant) {
        self.write_deadline = Some(deadline);
    }

    fn set_read_deadline(&mut self, deadline: Instant) {
        self.read_deadline = Some(deadline);
    }

    async fn write_message(&mut self, message: &[u8]) -> io::Result<()> {
        let stream = self.stream.as_mut().ok_or_else(closed)?;
        self.dirty = true;
        with_deadline(self.write_deadline, stream.write_message(message)).await?;
        self.dirty = false;
        Ok(())
    }

    async fn read_message(&mut self) -> io::Result<Bytes> {
        let stream = self.stream.as_mut().ok_or_else(closed)?;
        self.dirty = true;
        let message = with_deadline(self.read_deadline, stream.read_message()).await?;
        self.dirty = false;
        Ok(message)
    }

    fn close(&mut self) {
        let Some(stream) = self.stream.take() else {
            return;
        };
        if self.dirty {
            debug!("Dropping faulted {} connection", self.network);
        } else {
            self.pool.put(self.network, stream, self.generation);
        }
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection is closed")
}

async fn with_deadline<T>(
    deadline: Option<Instant>,
    operation: impl Future<Output = io::Result<T>>,
) -> io::Result<T> {
    match deadline {
        Some(deadline) => timeout_at(deadline, operation)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "i/o deadline exceeded"))?,
        None => operation.await,
    }
}

struct IdleStream {
    stream: Stream,
    generation: u64,
    since: Instant,
}

#[derive(Default)]
struct Pool {
    idle: Mutex<HashMap<Network, Vec<IdleStream>>>,
    // Bumped on every tls config change.
    tls_generation: AtomicU64,
}

impl Pool {
    fn generation(&self) -> u64 {
        self.tls_generation.load(Ordering::SeqCst)
    }

    fn is_current(&self, network: Network, generation: u64) -> bool {
        network != Network::TcpTls || generation == self.generation()
    }

    fn take(&self, network: Network) -> Option<(Stream, u64)> {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        let streams = idle.get_mut(&network)?;
        while let Some(idle_stream) = streams.pop() {
            if self.is_current(network, idle_stream.generation)
                && idle_stream.since.elapsed() < IDLE_EXPIRE
            {
                return Some((idle_stream.stream, idle_stream.generation));
            }
        }
        None
    }

    fn put(&self, network: Network, stream: Stream, generation: u64) {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.is_current(network, generation) {
            debug!("Dropping {} connection built with a replaced tls config", network);
            return;
        }
        let streams = idle.entry(network).or_default();
        if streams.len() < MAX_IDLE_PER_NETWORK {
            streams.push(IdleStream {
                stream,
                generation,
                since: Instant::now(),
            });
        }
    }

    fn renew_tls(&self) {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        self.tls_generation.fetch_add(1, Ordering::SeqCst);
        idle.remove(&Network::TcpTls);
    }

    fn len(&self, network: Network) -> usize {
        let idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        idle.get(&network).map_or(0, Vec::len)
    }
}
