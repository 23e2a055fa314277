use crate::packet::{MessageNumber, Packet};
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

/// Receives standalone data packets, reliable or not, once the receiver path has
///  accepted them.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PacketHandler: Send + Sync + 'static {
    async fn on_packet(&self, packet: Packet);
}

/// Receives the packets of multi-packet messages, in part order within each message.
///  `on_message_failure` fires when a partially received reliable message is abandoned
///  (connection reset, teardown, or no progress for the configured interval).
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn on_message_packet(&self, packet: Packet);

    async fn on_message_failure(&self, peer_addr: SocketAddr, message_number: MessageNumber);
}

/// Raw access to datagrams from one specific peer address, bypassing all connection
///  processing. Registered per address on the socket.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramHandler: Send + Sync + 'static {
    async fn on_datagram(&self, data: Vec<u8>, sender_addr: SocketAddr);
}

/// Notified when the local UDP socket fails persistently (transient errors are
///  retried without surfacing). Connections are unaffected; the application decides
///  whether to rebind or tear down.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SocketErrorHandler: Send + Sync + 'static {
    async fn on_socket_error(&self, error: std::io::Error);
}

/// Decides whether an incoming packet from an unknown peer may create a connection.
#[cfg_attr(test, automock)]
pub trait ConnectionCreationFilter: Send + Sync + 'static {
    fn allow_connection(&self, peer_addr: &SocketAddr) -> bool;
}

/// Inspects parsed data packets before any connection processing; rejected packets
///  are dropped silently.
#[cfg_attr(test, automock)]
pub trait PacketFilter: Send + Sync + 'static {
    fn allow_packet(&self, packet: &Packet) -> bool;
}

/// The application callbacks of one transport socket, shared with its connections so
///  handler changes take effect immediately. All handlers are optional: without a
///  handler, packets and messages are dropped and every filter accepts.
#[derive(Default)]
pub struct HandlerRegistry {
    packet_handler: RwLock<Option<Arc<dyn PacketHandler>>>,
    message_handler: RwLock<Option<Arc<dyn MessageHandler>>>,
    socket_error_handler: RwLock<Option<Arc<dyn SocketErrorHandler>>>,
    connection_creation_filter: RwLock<Option<Arc<dyn ConnectionCreationFilter>>>,
    packet_filter: RwLock<Option<Arc<dyn PacketFilter>>>,
}

impl HandlerRegistry {
    pub fn set_packet_handler(&self, handler: Arc<dyn PacketHandler>) {
        *self.packet_handler.write().unwrap() = Some(handler);
    }

    pub fn set_message_handler(&self, handler: Arc<dyn MessageHandler>) {
        *self.message_handler.write().unwrap() = Some(handler);
    }

    pub fn set_socket_error_handler(&self, handler: Arc<dyn SocketErrorHandler>) {
        *self.socket_error_handler.write().unwrap() = Some(handler);
    }

    pub fn set_connection_creation_filter(&self, filter: Arc<dyn ConnectionCreationFilter>) {
        *self.connection_creation_filter.write().unwrap() = Some(filter);
    }

    pub fn set_packet_filter(&self, filter: Arc<dyn PacketFilter>) {
        *self.packet_filter.write().unwrap() = Some(filter);
    }

    pub fn packet_handler(&self) -> Option<Arc<dyn PacketHandler>> {
        self.packet_handler.read().unwrap().clone()
    }

    pub fn message_handler(&self) -> Option<Arc<dyn MessageHandler>> {
        self.message_handler.read().unwrap().clone()
    }

    pub fn socket_error_handler(&self) -> Option<Arc<dyn SocketErrorHandler>> {
        self.socket_error_handler.read().unwrap().clone()
    }

    /// Whether the creation filter admits a connection to `peer_addr` (no filter
    ///  admits everyone).
    pub fn allows_connection(&self, peer_addr: &SocketAddr) -> bool {
        match self.connection_creation_filter.read().unwrap().as_ref() {
            Some(filter) => filter.allow_connection(peer_addr),
            None => true,
        }
    }

    /// Whether the packet filter accepts `packet` (no filter accepts everything).
    pub fn allows_packet(&self, packet: &Packet) -> bool {
        match self.packet_filter.read().unwrap().as_ref() {
            Some(filter) => filter.allow_packet(packet),
            None => true,
        }
    }
}
