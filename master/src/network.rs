//! UDP front end of the master server
//!
//! A receiver task decodes datagrams and hands them to the main loop over a
//! channel; the main loop owns the registry, answers requests and expires
//! hosts that stopped re-registering.

use crate::registry::{HostRegistry, RegisterOutcome};
use log::{debug, error, info, warn};
use shared::{MasterServerMessage, MASTER_DATAGRAM_SIZE};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};

/// Most hosts returned in a single host list
pub const MAX_HOSTS_PER_LIST: usize = 64;

/// Messages sent from the receiver task to the main loop
#[derive(Debug)]
pub enum ServerMessage {
    DatagramReceived {
        message: MasterServerMessage,
        addr: SocketAddr,
    },
}

pub struct MasterServer {
    socket: Arc<UdpSocket>,
    registry: HostRegistry,
    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
}

impl MasterServer {
    pub async fn new(addr: &str, max_hosts: usize, expiry: Duration) -> std::io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("Master server listening on {}", socket.local_addr()?);

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        Ok(Self {
            socket,
            registry: HostRegistry::new(max_hosts, expiry),
            server_tx,
            server_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn registry(&self) -> &HostRegistry {
        &self.registry
    }

    /// Spawns task that continuously listens for incoming datagrams
    fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut buffer = vec![0u8; MASTER_DATAGRAM_SIZE];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => match MasterServerMessage::from_bytes(&buffer[..len]) {
                        Ok(message) => {
                            if let Err(e) = server_tx.send(ServerMessage::DatagramReceived { message, addr }) {
                                error!("Failed to hand datagram to main loop: {}", e);
                                break;
                            }
                        }
                        Err(e) => warn!("Failed to decode datagram from {}: {}", addr, e),
                    },
                    Err(e) => {
                        error!("Error receiving datagram: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    async fn send(&self, message: &MasterServerMessage, addr: SocketAddr) {
        match message.to_bytes() {
            Ok(bytes) => {
                if let Err(e) = self.socket.send_to(&bytes, addr).await {
                    error!("Failed to send to {}: {}", addr, e);
                }
            }
            Err(e) => error!("Failed to encode {:?}: {}", message, e),
        }
    }

    async fn handle_message(&mut self, message: MasterServerMessage, addr: SocketAddr) {
        match message {
            MasterServerMessage::RegisterHost {
                app_id,
                guid,
                internal,
                info,
            } => {
                if self.registry.upsert(&app_id, guid, internal, addr, info) == RegisterOutcome::Refreshed {
                    debug!("Refreshed session {} from {}", guid, addr);
                }
            }

            MasterServerMessage::UnregisterHost { app_id, guid } => {
                self.registry.unregister(&app_id, guid, addr);
            }

            MasterServerMessage::RequestHosts { app_id } => {
                let mut hosts = self.registry.hosts_for(&app_id);
                hosts.truncate(MAX_HOSTS_PER_LIST);
                debug!("Sending {} {} host(s) to {}", hosts.len(), app_id, addr);
                self.send(&MasterServerMessage::HostList { hosts }, addr).await;
            }

            MasterServerMessage::RequestIntroduction { app_id, guid, internal } => {
                let Some(host) = self.registry.get(&app_id, guid).cloned() else {
                    warn!("Introduction to unknown session {} requested by {}", guid, addr);
                    return;
                };
                info!("Introducing {} to host {} of session {}", addr, host.external, guid);

                // Each side learns where to find the other
                let to_joiner = MasterServerMessage::Introduction {
                    guid,
                    internal: host.internal,
                    external: host.external,
                };
                let to_host = MasterServerMessage::Introduction {
                    guid,
                    internal,
                    external: addr,
                };
                self.send(&to_joiner, addr).await;
                self.send(&to_host, host.external).await;
            }

            MasterServerMessage::HostList { .. } | MasterServerMessage::Introduction { .. } => {
                warn!("Unexpected message from {}", addr);
            }
        }
    }

    /// Main server loop: answers requests and expires stale hosts
    pub async fn run(&mut self) -> std::io::Result<()> {
        self.spawn_network_receiver();

        let period = (self.registry.expiry() / 2).max(Duration::from_millis(100));
        let mut expiry_interval = interval(period);
        expiry_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Master server started");

        loop {
            tokio::select! {
                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::DatagramReceived { message, addr }) => {
                            self.handle_message(message, addr).await;
                        }
                        None => {
                            info!("Master server shutting down");
                            break;
                        }
                    }
                },

                _ = expiry_interval.tick() => {
                    let expired = self.registry.expire();
                    if !expired.is_empty() {
                        debug!("{} host(s) expired, {} still registered", expired.len(), self.registry.len());
                    }
                },
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{NetworkSessionProperties, NetworkSessionPublicInfo, NetworkSessionType, SessionGuid};

    fn info() -> NetworkSessionPublicInfo {
        NetworkSessionPublicInfo {
            session_type: NetworkSessionType::Ranked,
            properties: NetworkSessionProperties::new(),
            host_gamertag: "Host".to_string(),
            max_gamers: 4,
            private_gamer_slots: 0,
            current_gamer_count: 1,
            open_private_gamer_slots: 0,
            open_public_gamer_slots: 3,
        }
    }

    async fn receive(socket: &UdpSocket) -> MasterServerMessage {
        let mut buffer = vec![0u8; MASTER_DATAGRAM_SIZE];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buffer))
            .await
            .expect("no datagram within two seconds")
            .unwrap();
        MasterServerMessage::from_bytes(&buffer[..len]).unwrap()
    }

    #[tokio::test]
    async fn test_register_then_request_hosts() {
        let mut server = MasterServer::new("127.0.0.1:0", 16, Duration::from_secs(60))
            .await
            .unwrap();
        let host = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let searcher = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let register = MasterServerMessage::RegisterHost {
            app_id: "game".to_string(),
            guid: SessionGuid(7),
            internal: "192.168.0.2:3074".parse().unwrap(),
            info: info(),
        };
        server.handle_message(register, host.local_addr().unwrap()).await;
        assert_eq!(server.registry().len(), 1);

        let searcher_addr = searcher.local_addr().unwrap();
        let request = MasterServerMessage::RequestHosts {
            app_id: "game".to_string(),
        };
        server.handle_message(request, searcher_addr).await;

        match receive(&searcher).await {
            MasterServerMessage::HostList { hosts } => {
                assert_eq!(hosts.len(), 1);
                assert_eq!(hosts[0].external, host.local_addr().unwrap());
            }
            other => panic!("Expected a host list, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_introduction_reaches_both_sides() {
        let mut server = MasterServer::new("127.0.0.1:0", 16, Duration::from_secs(60))
            .await
            .unwrap();
        let host = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let joiner = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let host_internal: SocketAddr = "192.168.0.2:3074".parse().unwrap();
        let joiner_internal: SocketAddr = "192.168.5.9:3074".parse().unwrap();

        let register = MasterServerMessage::RegisterHost {
            app_id: "game".to_string(),
            guid: SessionGuid(7),
            internal: host_internal,
            info: info(),
        };
        server.handle_message(register, host.local_addr().unwrap()).await;

        let request = MasterServerMessage::RequestIntroduction {
            app_id: "game".to_string(),
            guid: SessionGuid(7),
            internal: joiner_internal,
        };
        server.handle_message(request, joiner.local_addr().unwrap()).await;

        assert_eq!(
            receive(&joiner).await,
            MasterServerMessage::Introduction {
                guid: SessionGuid(7),
                internal: host_internal,
                external: host.local_addr().unwrap(),
            }
        );
        assert_eq!(
            receive(&host).await,
            MasterServerMessage::Introduction {
                guid: SessionGuid(7),
                internal: joiner_internal,
                external: joiner.local_addr().unwrap(),
            }
        );
    }

    #[test]
    fn test_unregister_from_other_endpoint_is_ignored() {
        tokio_test::block_on(async {
            let mut server = MasterServer::new("127.0.0.1:0", 16, Duration::from_secs(60))
                .await
                .unwrap();
            let host: SocketAddr = "127.0.0.1:40001".parse().unwrap();
            let stranger: SocketAddr = "127.0.0.1:40002".parse().unwrap();

            let register = MasterServerMessage::RegisterHost {
                app_id: "game".to_string(),
                guid: SessionGuid(1),
                internal: host,
                info: info(),
            };
            server.handle_message(register, host).await;

            let unregister = MasterServerMessage::UnregisterHost {
                app_id: "game".to_string(),
                guid: SessionGuid(1),
            };
            server.handle_message(unregister.clone(), stranger).await;
            assert_eq!(server.registry().len(), 1);

            server.handle_message(unregister, host).await;
            assert!(server.registry().is_empty());
        });
    }
}
