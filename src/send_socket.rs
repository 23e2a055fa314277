use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use tokio::net::UdpSocket;
use tracing::{error, trace};

/// Abstraction over sending a finished datagram, introduced so the send paths can be
///  exercised against a mock in tests.
///
/// Socket errors are not propagated to callers: a transient failure is logged and the
///  datagram is lost, which the reliability layer recovers from like any other loss.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]);

    fn local_addr(&self) -> Option<SocketAddr>;
}

#[async_trait]
impl SendSocket for Arc<UdpSocket> {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) {
        trace!("sending {} byte datagram to {:?}", packet_buf.len(), to);

        if let Err(e) = self.send_to(packet_buf, to).await {
            error!("error sending datagram to {:?}: {}", to, e);
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        UdpSocket::local_addr(self.as_ref()).ok()
    }
}

/// The send path shared by every connection of one transport socket. The inner UDP
///  socket is swappable so a rebind does not invalidate the handles held by running
///  send queues.
pub struct SharedUdpSocket {
    socket: RwLock<Arc<UdpSocket>>,
}

impl SharedUdpSocket {
    pub fn new(socket: Arc<UdpSocket>) -> SharedUdpSocket {
        SharedUdpSocket {
            socket: RwLock::new(socket),
        }
    }

    pub fn current(&self) -> Arc<UdpSocket> {
        self.socket.read().unwrap().clone()
    }

    pub fn replace(&self, socket: Arc<UdpSocket>) {
        *self.socket.write().unwrap() = socket;
    }
}

#[async_trait]
impl SendSocket for SharedUdpSocket {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) {
        let socket = self.current();
        socket.do_send_packet(to, packet_buf).await
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        UdpSocket::local_addr(&self.current()).ok()
    }
}
