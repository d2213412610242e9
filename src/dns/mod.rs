use std::{net::SocketAddr, sync::Arc};

use anyhow::Result;
use bytes::{Bytes, BytesMut};
use tokio::net::UdpSocket;
use tokio_stream::Stream;

pub mod client;
pub mod health;
pub mod message;
pub mod metrics;
pub mod server;
pub mod transport;

const MAX_UDP_PACKET_SIZE: usize = 4096;

/// Endless stream of datagrams received on `socket`, with their senders.
pub fn create_udp_dns_stream(
    socket: Arc<UdpSocket>,
) -> impl Stream<Item = Result<(SocketAddr, Bytes)>> {
    futures_util::stream::unfold(socket, |socket| async move {
        let mut buf = BytesMut::zeroed(MAX_UDP_PACKET_SIZE);
        let received = socket
            .recv_from(&mut buf)
            .await
            .map(|(read, sender)| {
                buf.truncate(read);
                (sender, buf.freeze())
            })
            .map_err(anyhow::Error::from);
        Some((received, socket))
    })
}
