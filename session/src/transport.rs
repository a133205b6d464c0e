//! The seam between the session engine and whatever moves bytes around
//!
//! A transport delivers messages reliably or not, in order or not, on numbered
//! channels, and reports connection status changes. The engine never blocks on
//! it: everything arrives through [`TransportPeer::read_message`] which is
//! drained once per `update`.

use shared::DeliveryMethod;
use std::net::SocketAddr;
use thiserror::Error;

/// Channel used for session control messages
pub const CONTROL_CHANNEL: u8 = 0;
/// Channel used for application data
pub const USER_CHANNEL: u8 = 1;

/// Transport-level handle of one remote connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// `hail` is whatever the accepting side passed to `approve`
    Connected { hail: Vec<u8> },
    Disconnected { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncomingMessage {
    /// A remote wants to connect; answer with `approve` or `deny`
    ConnectionApproval {
        connection: ConnectionId,
        remote: SocketAddr,
        hail: Vec<u8>,
    },
    StatusChanged {
        connection: ConnectionId,
        status: ConnectionStatus,
    },
    Data {
        connection: ConnectionId,
        method: DeliveryMethod,
        channel: u8,
        bytes: Vec<u8>,
    },
    DiscoveryRequest {
        from: SocketAddr,
        payload: Vec<u8>,
    },
    DiscoveryResponse {
        from: SocketAddr,
        payload: Vec<u8>,
    },
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is not running")]
    NotRunning,
    #[error("address {0} is already in use")]
    AddressInUse(SocketAddr),
    #[error("unknown connection {0:?}")]
    UnknownConnection(ConnectionId),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub trait TransportPeer: Send {
    fn local_addr(&self) -> SocketAddr;

    /// Starts listening. Calling it on a running peer does nothing.
    fn start(&mut self) -> Result<(), TransportError>;

    /// Drops every connection with `reason` and stops listening.
    fn shutdown(&mut self, reason: &str);

    fn connect(&mut self, remote: SocketAddr, hail: &[u8]) -> Result<ConnectionId, TransportError>;

    fn approve(&mut self, connection: ConnectionId, hail: &[u8]) -> Result<(), TransportError>;

    fn deny(&mut self, connection: ConnectionId, reason: &str);

    fn disconnect(&mut self, connection: ConnectionId, reason: &str);

    fn send(
        &mut self,
        bytes: &[u8],
        connections: &[ConnectionId],
        method: DeliveryMethod,
        channel: u8,
    ) -> Result<(), TransportError>;

    /// Next pending message, or `None` once drained.
    fn read_message(&mut self) -> Option<IncomingMessage>;

    /// Broadcasts a discovery request to every peer listening on `port`.
    fn discover_local_peers(&mut self, port: u16, payload: &[u8]) -> Result<(), TransportError>;

    fn send_discovery_response(&mut self, to: SocketAddr, payload: &[u8]) -> Result<(), TransportError>;
}
