use std::{
    io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
};

use bytes::{Bytes, BytesMut};
use log::debug;
use rustls::{pki_types::ServerName, ClientConfig, RootCertStore};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{lookup_host, TcpStream, UdpSocket},
};
use tokio_rustls::{client::TlsStream, TlsConnector};

use super::Network;

const MAX_MESSAGE_SIZE: usize = u16::MAX as usize;

pub enum Stream {
    Udp(UdpSocket),
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Stream {
    pub async fn connect(
        addr: &str,
        network: Network,
        tls_config: Option<Arc<ClientConfig>>,
    ) -> io::Result<Self> {
        let remote = lookup_host(addr).await?.next().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("{} resolved to no addresses", addr),
            )
        })?;
        let stream = match network {
            Network::Udp => {
                let local: SocketAddr = if remote.is_ipv4() {
                    (Ipv4Addr::UNSPECIFIED, 0).into()
                } else {
                    (Ipv6Addr::UNSPECIFIED, 0).into()
                };
                let socket = UdpSocket::bind(local).await?;
                socket.connect(remote).await?;
                Stream::Udp(socket)
            }
            Network::Tcp => Stream::Tcp(connect_tcp(remote).await?),
            Network::TcpTls => {
                let tls_config = tls_config.ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("tls config is not set for {}", addr),
                    )
                })?;
                let server_name = server_name(addr)?;
                let tcp = connect_tcp(remote).await?;
                let tls = TlsConnector::from(tls_config)
                    .connect(server_name, tcp)
                    .await?;
                Stream::Tls(Box::new(tls))
            }
        };
        debug!("Connected to {} over {}", remote, network);
        Ok(stream)
    }

    pub async fn write_message(&mut self, message: &[u8]) -> io::Result<()> {
        match self {
            Stream::Udp(socket) => {
                socket.send(message).await?;
                Ok(())
            }
            Stream::Tcp(stream) => write_with_length_prefix(stream, message).await,
            Stream::Tls(stream) => write_with_length_prefix(&mut **stream, message).await,
        }
    }

    pub async fn read_message(&mut self) -> io::Result<Bytes> {
        match self {
            Stream::Udp(socket) => {
                let mut buf = BytesMut::zeroed(MAX_MESSAGE_SIZE);
                let read = socket.recv(&mut buf).await?;
                buf.truncate(read);
                Ok(buf.freeze())
            }
            Stream::Tcp(stream) => read_with_length_prefix(stream).await,
            Stream::Tls(stream) => read_with_length_prefix(&mut **stream).await,
        }
    }
}

/// Root store built from the bundled webpki roots.
pub fn default_tls_config() -> Arc<ClientConfig> {
    let mut root_store = RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    Arc::new(config)
}

async fn connect_tcp(remote: SocketAddr) -> io::Result<TcpStream> {
    let stream = TcpStream::connect(remote).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

fn server_name(addr: &str) -> io::Result<ServerName<'static>> {
    let host = match addr.rsplit_once(':') {
        Some((host, _port)) => host,
        None => addr,
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    ServerName::try_from(host.to_owned())
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))
}

async fn write_with_length_prefix<S>(stream: &mut S, message: &[u8]) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let length = u16::try_from(message.len()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("message of {} bytes does not fit the length prefix", message.len()),
        )
    })?;
    let mut framed = BytesMut::with_capacity(message.len() + 2);
    framed.extend_from_slice(&length.to_be_bytes());
    framed.extend_from_slice(message);
    stream.write_all(&framed).await?;
    stream.flush().await
}

async fn read_with_length_prefix<S>(stream: &mut S) -> io::Result<Bytes>
where
    S: AsyncRead + Unpin,
{
    let length = stream.read_u16().await? as usize;
    let mut message = BytesMut::zeroed(length);
    stream.read_exact(&mut message).await?;
    Ok(message.freeze())
}

#[cfg(test)]
mod tests {
    use super::{read_with_length_prefix, server_name, write_with_length_prefix};
    use pretty_assertions::assert_eq;
    use rustls::pki_types::ServerName;

    #[tokio::test]
    async fn should_frame_messages_with_length() {
        let (mut client, mut server) = tokio::io::duplex(64);

        write_with_length_prefix(&mut client, b"hello").await.unwrap();
        let message = read_with_length_prefix(&mut server).await.unwrap();

        assert_eq!(message.as_ref(), b"hello");
    }

    #[tokio::test]
    async fn should_fail_on_truncated_frame() {
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::io::AsyncWriteExt::write_all(&mut client, &[0, 10, 1, 2])
            .await
            .unwrap();
        drop(client);

        assert!(read_with_length_prefix(&mut server).await.is_err());
    }

    #[test]
    fn should_take_server_name_from_address() {
        assert!(matches!(
            server_name("1.1.1.1:853").unwrap(),
            ServerName::IpAddress(_)
        ));
        assert!(matches!(
            server_name("[2606:4700:4700::1111]:853").unwrap(),
            ServerName::IpAddress(_)
        ));
        assert_eq!(
            server_name("dns.quad9.net:853").unwrap(),
            ServerName::try_from("dns.quad9.net").unwrap()
        );
    }
}
