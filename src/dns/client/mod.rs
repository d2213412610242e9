use anyhow::Result;

use async_trait::async_trait;

mod upstream;

pub use upstream::*;

use super::message::Response;

#[async_trait]
pub trait DnsClient: Send + Sync {
    async fn send(&self, request: Request) -> Result<Response>;
}
