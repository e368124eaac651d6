use futures::Stream;
use std::{io, net::SocketAddr, sync::Arc};
use tokio::net::UdpSocket;

/// One result read off a discovery socket, tagged with the bind epoch of
/// the socket it came from so results from a torn down socket are ignored
pub(crate) struct Datagram {
    pub epoch: u64,
    pub result: io::Result<(Vec<u8>, SocketAddr)>,
}

pub(crate) async fn bind_broadcast(addr: SocketAddr) -> io::Result<Arc<UdpSocket>> {
    let socket = UdpSocket::bind(addr).await.map_err(|e| {
        log::error!("Unable to bind to socket {addr:}");
        e
    })?;
    socket.set_broadcast(true)?;
    Ok(Arc::new(socket))
}

/// Stream of datagrams read from `socket`. The stream ends after yielding
/// the first receive error
pub(crate) fn datagrams(socket: Arc<UdpSocket>, epoch: u64) -> impl Stream<Item = Datagram> {
    futures::stream::unfold(Some(socket), move |socket| async move {
        let socket = socket?;
        let mut buffer = [0u8; 512];
        match socket.recv_from(&mut buffer).await {
            Ok((len, from)) => Some((
                Datagram {
                    epoch,
                    result: Ok((buffer[..len].to_vec(), from)),
                },
                Some(socket),
            )),
            Err(e) => Some((
                Datagram {
                    epoch,
                    result: Err(e),
                },
                None,
            )),
        }
    })
}

/// Fire and forget send, failures are logged but do not tear the socket
/// down
pub(crate) fn send_datagram(socket: Arc<UdpSocket>, packet: Vec<u8>, target: SocketAddr) {
    actix::spawn(async move {
        if let Err(e) = socket.send_to(&packet, target).await {
            log::error!("Error sending to {target:}: {e:}");
        }
    });
}
