//! UDP front end for [`CommandDispatcher`].

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::task::spawn_blocking;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::CommandDispatcher;

/// Bind the command channel on every interface.
pub async fn bind(port: u16) -> io::Result<UdpSocket> {
    UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))).await
}

/// Receive datagrams until `cancel` fires, answering each one the dispatcher
/// has a reply for. Datagrams are handled one at a time; longer datagrams
/// than `buffer_size` are truncated by the socket.
pub async fn serve(
    socket: UdpSocket,
    dispatcher: Arc<CommandDispatcher>,
    buffer_size: usize,
    cancel: CancellationToken,
) -> io::Result<()> {
    let mut buf = vec![0u8; buffer_size.max(1)];
    info!("command channel listening on {}", socket.local_addr()?);

    loop {
        let (len, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(err) => {
                    warn!("recv failed: {}", err);
                    continue;
                }
            },
        };
        debug!(%peer, len, "datagram received");

        let datagram = buf[..len].to_vec();
        let handler = Arc::clone(&dispatcher);
        let reply = match spawn_blocking(move || handler.handle(&datagram)).await {
            Ok(reply) => reply,
            Err(err) => {
                warn!("dispatcher worker failed: {}", err);
                continue;
            }
        };

        if let Some(reply) = reply {
            if let Err(err) = socket.send_to(&reply, peer).await {
                warn!(%peer, "reply failed: {}", err);
            }
        }
    }

    info!("command channel stopped");
    Ok(())
}
