use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use fanout::{
    config::Config,
    dns::{
        self,
        client::{DnsClient, UpstreamClient},
        health::{Health, UpstreamHealth},
        metrics::PrometheusMetrics,
        transport::{default_tls_config, Network, PooledTransport},
    },
};
use log::{error, info};
use prometheus::{Encoder, Registry, TextEncoder};
use warp::Filter;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let config = Config::init()?;
    info!(
        "Starting service, forwarding to {} over {}",
        config.upstream.addr, config.upstream.network
    );

    let registry = Registry::new();
    let client = create_upstream_client(&config, &registry)?;
    tokio::spawn(run_health_checks(
        client.health(),
        config.health_check.interval,
    ));
    tokio::spawn(run_metrics_server(config.metrics_bind_addr, registry));

    let client: Arc<dyn DnsClient> = Arc::new(client);
    let server = dns::server::create_udp_server(config.bind_addr, move |request| {
        let client = client.clone();
        async move { client.send(request).await }
    })
    .await?;
    server.await;
    Ok(())
}

fn create_upstream_client(config: &Config, registry: &Registry) -> Result<UpstreamClient> {
    let upstream = &config.upstream;
    let metrics = Arc::new(PrometheusMetrics::new(registry)?);
    let health = UpstreamHealth::new(upstream.addr.clone(), upstream.network).with_probe(
        config.health_check.probe_timeout,
        config.health_check.max_fails,
    );
    let mut client = UpstreamClient::with_parts(
        upstream.addr.clone(),
        upstream.network,
        Box::new(PooledTransport::new(upstream.addr.clone())),
        Arc::new(health),
        metrics,
    )
    .with_timeouts(config.timeouts)?;
    if upstream.network == Network::TcpTls {
        client.set_tls_config(Some(default_tls_config()));
    }
    Ok(client)
}

async fn run_health_checks(health: Arc<dyn Health>, interval: Duration) {
    let mut ticks = tokio::time::interval(interval);
    loop {
        ticks.tick().await;
        // failures are logged by the tracker itself
        let _ = health.check().await;
    }
}

async fn run_metrics_server(bind_addr: SocketAddr, registry: Registry) {
    let metrics = warp::path("metrics").map(move || {
        let mut buffer = Vec::new();
        if let Err(err) = TextEncoder::new().encode(&registry.gather(), &mut buffer) {
            error!("Failed to encode metrics: {:#}", err);
        }
        String::from_utf8_lossy(&buffer).into_owned()
    });
    info!("Serving metrics on {}", bind_addr);
    warp::serve(metrics).run(bind_addr).await
}
