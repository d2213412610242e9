use anyhow::Result;
use log::{debug, error};
use std::{future::Future, net::SocketAddr, sync::Arc};
use tokio::net::UdpSocket;
use tokio_stream::StreamExt;

use super::{
    client::Request,
    create_udp_dns_stream,
    message::{Query, Response},
    transport::Network,
};

pub async fn create_udp_server<Handler, HandlerResp>(
    bind_addr: SocketAddr,
    request_handler: Handler,
) -> Result<impl Future<Output = ()> + Send + 'static>
where
    Handler: Fn(Request) -> HandlerResp + Send + Sync + 'static,
    HandlerResp: Future<Output = Result<Response>> + Send + 'static,
{
    let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
    Ok(serve(socket, request_handler))
}

pub fn serve<Handler, HandlerResp>(
    socket: Arc<UdpSocket>,
    request_handler: Handler,
) -> impl Future<Output = ()> + Send + 'static
where
    Handler: Fn(Request) -> HandlerResp + Send + Sync + 'static,
    HandlerResp: Future<Output = Result<Response>> + Send + 'static,
{
    let mut requests = Box::pin(create_udp_dns_stream(socket.clone()));

    async move {
        while let Some(request) = requests.next().await {
            let handler = || {
                let (sender, request) = request?;
                let query = Query::from_bytes(request)?;
                debug!("Got query {} from {}", query.id(), sender);
                let handler_fut = request_handler(Request::new(query, Network::Udp));
                let socket = socket.clone();
                tokio::spawn(async move {
                    let handle_and_send = async {
                        let response = handler_fut.await?;
                        socket.send_to(response.bytes(), &sender).await?;
                        Ok::<_, anyhow::Error>(())
                    };
                    if let Err(err) = handle_and_send.await {
                        error!("Error occured while sending response: {:#}", err);
                    }
                });
                Ok::<_, anyhow::Error>(())
            };
            if let Err(err) = handler() {
                error!("Error occured while receiving dns request: {:?}", err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::Result;
    use bytes::Bytes;
    use pretty_assertions::assert_eq;
    use tokio::net::UdpSocket;

    use super::serve;
    use crate::dns::message::{response_bytes, Query, Response};

    #[tokio::test]
    async fn should_answer_each_query() -> Result<()> {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await?);
        let server_addr = socket.local_addr()?;
        let server = serve(socket, |request| async move {
            Response::from_bytes(response_bytes(request.id(), 0))
        });
        tokio::spawn(server);

        let client = UdpSocket::bind("127.0.0.1:0").await?;
        client.connect(server_addr).await?;
        for id in [1u16, 2, 3] {
            let query = Query::build(id, "example.com", 1, true)?;
            client.send(query.bytes()).await?;
            let mut buf = [0; 512];
            let read = client.recv(&mut buf).await?;
            let response = Response::from_bytes(Bytes::copy_from_slice(&buf[..read]))?;
            assert_eq!(response.id(), id);
        }
        Ok(())
    }
}
