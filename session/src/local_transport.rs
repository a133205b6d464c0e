//! In-process transport
//!
//! Every [`LocalPeer`] created from the same [`LocalNetwork`] can reach every
//! other one by address. Each peer owns an unbounded channel; sending pushes an
//! envelope into the destination's channel, so delivery is reliable and ordered
//! per sender no matter which delivery method is requested. Used by the demo
//! binary and by the tests.

use crate::transport::{ConnectionId, ConnectionStatus, IncomingMessage, TransportError, TransportPeer};
use log::{debug, info};
use shared::DeliveryMethod;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Connection id carried by discovery traffic, which has no connection.
const NO_CONNECTION: ConnectionId = ConnectionId(0);

#[derive(Debug)]
struct Envelope {
    from: SocketAddr,
    connection: ConnectionId,
    event: LinkEvent,
}

#[derive(Debug)]
enum LinkEvent {
    ConnectRequest { hail: Vec<u8> },
    Approved { hail: Vec<u8> },
    Denied { reason: String },
    Disconnected { reason: String },
    Data { method: DeliveryMethod, channel: u8, bytes: Vec<u8> },
    DiscoveryRequest { payload: Vec<u8> },
    DiscoveryResponse { payload: Vec<u8> },
}

#[derive(Debug, Default)]
struct Hub {
    peers: HashMap<SocketAddr, UnboundedSender<Envelope>>,
    next_connection: u64,
    // Data messages handed to each address so far
    data_delivered: HashMap<SocketAddr, usize>,
}

/// Shared registry of in-process peers
#[derive(Debug, Clone, Default)]
pub struct LocalNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a peer bound to `addr`. It is reachable once started.
    pub fn peer(&self, addr: SocketAddr) -> LocalPeer {
        LocalPeer {
            network: self.clone(),
            addr,
            inbox: None,
            links: HashMap::new(),
            pending: VecDeque::new(),
        }
    }

    /// Number of started peers
    pub fn peer_count(&self) -> usize {
        self.hub().peers.len()
    }

    /// Data messages delivered to `addr` since the network was created
    pub fn data_delivered_to(&self, addr: SocketAddr) -> usize {
        self.hub().data_delivered.get(&addr).copied().unwrap_or(0)
    }

    fn hub(&self) -> MutexGuard<'_, Hub> {
        self.hub.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, addr: SocketAddr) -> Result<UnboundedReceiver<Envelope>, TransportError> {
        let mut hub = self.hub();
        if hub.peers.contains_key(&addr) {
            return Err(TransportError::AddressInUse(addr));
        }
        let (sender, receiver) = mpsc::unbounded_channel();
        hub.peers.insert(addr, sender);
        Ok(receiver)
    }

    fn unregister(&self, addr: SocketAddr) {
        self.hub().peers.remove(&addr);
    }

    fn next_connection_id(&self) -> ConnectionId {
        let mut hub = self.hub();
        hub.next_connection += 1;
        ConnectionId(hub.next_connection)
    }

    /// Returns false when nobody is listening on `to`.
    fn deliver(&self, to: SocketAddr, envelope: Envelope) -> bool {
        let mut hub = self.hub();
        let is_data = matches!(envelope.event, LinkEvent::Data { .. });
        let delivered = match hub.peers.get(&to) {
            Some(sender) => sender.send(envelope).is_ok(),
            None => false,
        };
        if delivered && is_data {
            *hub.data_delivered.entry(to).or_insert(0) += 1;
        }
        delivered
    }

    fn listeners_on_port(&self, port: u16) -> Vec<SocketAddr> {
        self.hub()
            .peers
            .keys()
            .filter(|addr| addr.port() == port)
            .copied()
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Connecting,
    AwaitingApproval,
    Connected,
}

#[derive(Debug)]
struct Link {
    remote: SocketAddr,
    state: LinkState,
}

/// One endpoint on a [`LocalNetwork`]
#[derive(Debug)]
pub struct LocalPeer {
    network: LocalNetwork,
    addr: SocketAddr,
    inbox: Option<UnboundedReceiver<Envelope>>,
    links: HashMap<ConnectionId, Link>,
    // Status changes this peer caused itself
    pending: VecDeque<IncomingMessage>,
}

impl LocalPeer {
    pub fn is_running(&self) -> bool {
        self.inbox.is_some()
    }

    pub fn connection_count(&self) -> usize {
        self.links
            .values()
            .filter(|link| link.state == LinkState::Connected)
            .count()
    }

    fn ensure_running(&self) -> Result<(), TransportError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(TransportError::NotRunning)
        }
    }

    fn post(&self, to: SocketAddr, connection: ConnectionId, event: LinkEvent) -> bool {
        let envelope = Envelope {
            from: self.addr,
            connection,
            event,
        };
        self.network.deliver(to, envelope)
    }

    fn accept(&mut self, envelope: Envelope) -> Option<IncomingMessage> {
        let Envelope {
            from,
            connection,
            event,
        } = envelope;

        match event {
            LinkEvent::ConnectRequest { hail } => {
                self.links.insert(
                    connection,
                    Link {
                        remote: from,
                        state: LinkState::AwaitingApproval,
                    },
                );
                Some(IncomingMessage::ConnectionApproval {
                    connection,
                    remote: from,
                    hail,
                })
            }
            LinkEvent::Approved { hail } => {
                let link = self.links.get_mut(&connection)?;
                if link.state != LinkState::Connecting {
                    return None;
                }
                link.state = LinkState::Connected;
                Some(IncomingMessage::StatusChanged {
                    connection,
                    status: ConnectionStatus::Connected { hail },
                })
            }
            LinkEvent::Denied { reason } | LinkEvent::Disconnected { reason } => {
                self.links.remove(&connection)?;
                Some(IncomingMessage::StatusChanged {
                    connection,
                    status: ConnectionStatus::Disconnected { reason },
                })
            }
            LinkEvent::Data {
                method,
                channel,
                bytes,
            } => {
                let link = self.links.get(&connection)?;
                if link.state != LinkState::Connected {
                    debug!("{}: dropping data on unconnected link {:?}", self.addr, connection);
                    return None;
                }
                Some(IncomingMessage::Data {
                    connection,
                    method,
                    channel,
                    bytes,
                })
            }
            LinkEvent::DiscoveryRequest { payload } => {
                Some(IncomingMessage::DiscoveryRequest { from, payload })
            }
            LinkEvent::DiscoveryResponse { payload } => {
                Some(IncomingMessage::DiscoveryResponse { from, payload })
            }
        }
    }
}

impl TransportPeer for LocalPeer {
    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    fn start(&mut self) -> Result<(), TransportError> {
        if self.inbox.is_none() {
            self.inbox = Some(self.network.register(self.addr)?);
            debug!("Local peer listening on {}", self.addr);
        }
        Ok(())
    }

    fn shutdown(&mut self, reason: &str) {
        if self.inbox.is_none() {
            return;
        }
        for (connection, link) in self.links.drain() {
            let envelope = Envelope {
                from: self.addr,
                connection,
                event: LinkEvent::Disconnected {
                    reason: reason.to_string(),
                },
            };
            self.network.deliver(link.remote, envelope);
        }
        self.network.unregister(self.addr);
        self.inbox = None;
        self.pending.clear();
        info!("Local peer {} shut down: {}", self.addr, reason);
    }

    fn connect(&mut self, remote: SocketAddr, hail: &[u8]) -> Result<ConnectionId, TransportError> {
        self.ensure_running()?;
        let connection = self.network.next_connection_id();
        self.links.insert(
            connection,
            Link {
                remote,
                state: LinkState::Connecting,
            },
        );
        // Nobody listening behaves like a lost packet: the caller times out.
        if !self.post(remote, connection, LinkEvent::ConnectRequest { hail: hail.to_vec() }) {
            debug!("{}: nobody listening on {}", self.addr, remote);
        }
        Ok(connection)
    }

    fn approve(&mut self, connection: ConnectionId, hail: &[u8]) -> Result<(), TransportError> {
        self.ensure_running()?;
        let link = self
            .links
            .get_mut(&connection)
            .filter(|link| link.state == LinkState::AwaitingApproval)
            .ok_or(TransportError::UnknownConnection(connection))?;
        link.state = LinkState::Connected;
        let remote = link.remote;

        self.post(remote, connection, LinkEvent::Approved { hail: hail.to_vec() });
        self.pending.push_back(IncomingMessage::StatusChanged {
            connection,
            status: ConnectionStatus::Connected { hail: Vec::new() },
        });
        Ok(())
    }

    fn deny(&mut self, connection: ConnectionId, reason: &str) {
        if let Some(link) = self.links.remove(&connection) {
            self.post(
                link.remote,
                connection,
                LinkEvent::Denied {
                    reason: reason.to_string(),
                },
            );
        }
    }

    fn disconnect(&mut self, connection: ConnectionId, reason: &str) {
        if let Some(link) = self.links.remove(&connection) {
            self.post(
                link.remote,
                connection,
                LinkEvent::Disconnected {
                    reason: reason.to_string(),
                },
            );
            self.pending.push_back(IncomingMessage::StatusChanged {
                connection,
                status: ConnectionStatus::Disconnected {
                    reason: reason.to_string(),
                },
            });
        }
    }

    fn send(
        &mut self,
        bytes: &[u8],
        connections: &[ConnectionId],
        method: DeliveryMethod,
        channel: u8,
    ) -> Result<(), TransportError> {
        self.ensure_running()?;
        for connection in connections {
            match self.links.get(connection) {
                Some(link) if link.state == LinkState::Connected => {
                    let event = LinkEvent::Data {
                        method,
                        channel,
                        bytes: bytes.to_vec(),
                    };
                    self.post(link.remote, *connection, event);
                }
                _ => debug!("{}: skipping send on {:?}", self.addr, connection),
            }
        }
        Ok(())
    }

    fn read_message(&mut self) -> Option<IncomingMessage> {
        if let Some(message) = self.pending.pop_front() {
            return Some(message);
        }
        loop {
            let envelope = self.inbox.as_mut()?.try_recv().ok()?;
            if let Some(message) = self.accept(envelope) {
                return Some(message);
            }
        }
    }

    fn discover_local_peers(&mut self, port: u16, payload: &[u8]) -> Result<(), TransportError> {
        self.ensure_running()?;
        for addr in self.network.listeners_on_port(port) {
            if addr != self.addr {
                let event = LinkEvent::DiscoveryRequest {
                    payload: payload.to_vec(),
                };
                self.post(addr, NO_CONNECTION, event);
            }
        }
        Ok(())
    }

    fn send_discovery_response(&mut self, to: SocketAddr, payload: &[u8]) -> Result<(), TransportError> {
        self.ensure_running()?;
        let event = LinkEvent::DiscoveryResponse {
            payload: payload.to_vec(),
        };
        self.post(to, NO_CONNECTION, event);
        Ok(())
    }
}

impl Drop for LocalPeer {
    fn drop(&mut self) {
        self.shutdown("peer dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8, port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, last], port))
    }

    fn connected_pair(network: &LocalNetwork) -> (LocalPeer, LocalPeer, ConnectionId, ConnectionId) {
        let mut host = network.peer(addr(1, 3074));
        let mut client = network.peer(addr(2, 4000));
        host.start().unwrap();
        client.start().unwrap();

        let client_side = client.connect(host.local_addr(), b"hello").unwrap();
        let host_side = match host.read_message() {
            Some(IncomingMessage::ConnectionApproval {
                connection, hail, ..
            }) => {
                assert_eq!(hail, b"hello");
                connection
            }
            other => panic!("Expected approval request, got {:?}", other),
        };
        host.approve(host_side, b"welcome").unwrap();

        assert!(matches!(
            host.read_message(),
            Some(IncomingMessage::StatusChanged {
                status: ConnectionStatus::Connected { .. },
                ..
            })
        ));
        match client.read_message() {
            Some(IncomingMessage::StatusChanged {
                status: ConnectionStatus::Connected { hail },
                ..
            }) => assert_eq!(hail, b"welcome"),
            other => panic!("Expected connected status, got {:?}", other),
        }
        (host, client, host_side, client_side)
    }

    #[test]
    fn test_handshake_and_data() {
        let network = LocalNetwork::new();
        let (mut host, mut client, host_side, client_side) = connected_pair(&network);
        assert_eq!(host.connection_count(), 1);

        client
            .send(&[1, 2, 3], &[client_side], DeliveryMethod::ReliableOrdered, 1)
            .unwrap();
        match host.read_message() {
            Some(IncomingMessage::Data {
                connection,
                bytes,
                channel,
                ..
            }) => {
                assert_eq!(connection, host_side);
                assert_eq!(bytes, vec![1, 2, 3]);
                assert_eq!(channel, 1);
            }
            other => panic!("Expected data, got {:?}", other),
        }
        assert!(host.read_message().is_none());
    }

    #[test]
    fn test_data_deliveries_are_counted_per_address() {
        let network = LocalNetwork::new();
        let (host, mut client, _, client_side) = connected_pair(&network);

        client
            .send(&[1], &[client_side], DeliveryMethod::Unreliable, 1)
            .unwrap();
        client
            .send(&[2], &[client_side], DeliveryMethod::Unreliable, 1)
            .unwrap();
        assert_eq!(network.data_delivered_to(host.local_addr()), 2);
        // Handshake traffic is not data
        assert_eq!(network.data_delivered_to(client.local_addr()), 0);
    }

    #[test]
    fn test_address_in_use() {
        let network = LocalNetwork::new();
        let mut first = network.peer(addr(1, 3074));
        let mut second = network.peer(addr(1, 3074));
        first.start().unwrap();
        assert!(matches!(second.start(), Err(TransportError::AddressInUse(_))));
        assert_eq!(network.peer_count(), 1);
    }

    #[test]
    fn test_deny_reaches_requester() {
        let network = LocalNetwork::new();
        let mut host = network.peer(addr(1, 3074));
        let mut client = network.peer(addr(2, 4000));
        host.start().unwrap();
        client.start().unwrap();

        client.connect(host.local_addr(), &[]).unwrap();
        let Some(IncomingMessage::ConnectionApproval { connection, .. }) = host.read_message() else {
            panic!("Expected approval request");
        };
        host.deny(connection, "SessionFull");

        match client.read_message() {
            Some(IncomingMessage::StatusChanged {
                status: ConnectionStatus::Disconnected { reason },
                ..
            }) => assert_eq!(reason, "SessionFull"),
            other => panic!("Expected disconnect, got {:?}", other),
        }
    }

    #[test]
    fn test_connect_to_nobody_is_silent() {
        let network = LocalNetwork::new();
        let mut client = network.peer(addr(2, 4000));
        client.start().unwrap();
        client.connect(addr(9, 3074), &[]).unwrap();
        assert!(client.read_message().is_none());
    }

    #[test]
    fn test_drop_disconnects_remote() {
        let network = LocalNetwork::new();
        let (mut host, client, host_side, _) = connected_pair(&network);
        drop(client);

        match host.read_message() {
            Some(IncomingMessage::StatusChanged {
                connection,
                status: ConnectionStatus::Disconnected { .. },
            }) => assert_eq!(connection, host_side),
            other => panic!("Expected disconnect, got {:?}", other),
        }
        assert_eq!(network.peer_count(), 1);
    }

    #[test]
    fn test_discovery_reaches_listeners_on_port() {
        let network = LocalNetwork::new();
        let mut host = network.peer(addr(1, 3074));
        let mut other_app = network.peer(addr(3, 5000));
        let mut searcher = network.peer(addr(2, 4000));
        host.start().unwrap();
        other_app.start().unwrap();
        searcher.start().unwrap();

        searcher.discover_local_peers(3074, b"who").unwrap();
        assert!(other_app.read_message().is_none());
        let Some(IncomingMessage::DiscoveryRequest { from, payload }) = host.read_message() else {
            panic!("Expected discovery request");
        };
        assert_eq!(payload, b"who");

        host.send_discovery_response(from, b"me").unwrap();
        assert_eq!(
            searcher.read_message(),
            Some(IncomingMessage::DiscoveryResponse {
                from: addr(1, 3074),
                payload: b"me".to_vec()
            })
        );
    }
}
