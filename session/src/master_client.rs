//! Client side of the master server protocol
//!
//! Hosts of online sessions keep themselves registered from a background task;
//! searchers ask for the host list and for introductions.

use log::{debug, info, warn};
use shared::{
    HostEntry, MasterServerMessage, NetworkSessionPublicInfo, SessionGuid, MASTER_DATAGRAM_SIZE,
};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};

#[derive(Debug, Error)]
pub enum MasterServerError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("no answer from master server within {0:?}")]
    Timeout(Duration),
}

/// UDP endpoint talking to one master server
#[derive(Debug)]
pub struct MasterServerClient {
    socket: UdpSocket,
    master: SocketAddr,
}

impl MasterServerClient {
    /// Binds an ephemeral local port for talking to `master`.
    pub async fn bind(master: SocketAddr) -> Result<Self, MasterServerError> {
        let local: SocketAddr = if master.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        Ok(Self { socket, master })
    }

    pub fn master_addr(&self) -> SocketAddr {
        self.master
    }

    pub fn local_addr(&self) -> Result<SocketAddr, MasterServerError> {
        Ok(self.socket.local_addr()?)
    }

    async fn send(&self, message: &MasterServerMessage) -> Result<(), MasterServerError> {
        let bytes = message.to_bytes()?;
        self.socket.send_to(&bytes, self.master).await?;
        Ok(())
    }

    /// Waits for the next message from the master server, skipping anything
    /// that came from elsewhere or does not decode.
    pub async fn receive(&self) -> Result<MasterServerMessage, MasterServerError> {
        let mut buffer = vec![0u8; MASTER_DATAGRAM_SIZE];
        loop {
            let (len, from) = self.socket.recv_from(&mut buffer).await?;
            if from != self.master {
                debug!("Ignoring datagram from {}", from);
                continue;
            }
            match MasterServerMessage::from_bytes(&buffer[..len]) {
                Ok(message) => return Ok(message),
                Err(e) => warn!("Malformed master server datagram: {}", e),
            }
        }
    }

    pub async fn register_host(
        &self,
        app_id: &str,
        guid: SessionGuid,
        internal: SocketAddr,
        info: NetworkSessionPublicInfo,
    ) -> Result<(), MasterServerError> {
        self.send(&MasterServerMessage::RegisterHost {
            app_id: app_id.to_string(),
            guid,
            internal,
            info,
        })
        .await
    }

    pub async fn unregister_host(&self, app_id: &str, guid: SessionGuid) -> Result<(), MasterServerError> {
        self.send(&MasterServerMessage::UnregisterHost {
            app_id: app_id.to_string(),
            guid,
        })
        .await
    }

    /// Asks for every host registered under `app_id`.
    pub async fn request_hosts(&self, app_id: &str, wait: Duration) -> Result<Vec<HostEntry>, MasterServerError> {
        self.send(&MasterServerMessage::RequestHosts {
            app_id: app_id.to_string(),
        })
        .await?;

        let answer = timeout(wait, async {
            loop {
                if let MasterServerMessage::HostList { hosts } = self.receive().await? {
                    return Ok::<_, MasterServerError>(hosts);
                }
            }
        })
        .await
        .map_err(|_| MasterServerError::Timeout(wait))??;
        Ok(answer)
    }

    /// Asks the master server to introduce us to the host of `guid`.
    /// Returns the host's external endpoint.
    pub async fn request_introduction(
        &self,
        app_id: &str,
        guid: SessionGuid,
        internal: SocketAddr,
        wait: Duration,
    ) -> Result<SocketAddr, MasterServerError> {
        self.send(&MasterServerMessage::RequestIntroduction {
            app_id: app_id.to_string(),
            guid,
            internal,
        })
        .await?;

        timeout(wait, async {
            loop {
                match self.receive().await? {
                    MasterServerMessage::Introduction {
                        guid: introduced,
                        external,
                        ..
                    } if introduced == guid => return Ok::<_, MasterServerError>(external),
                    other => debug!("Ignoring {:?} while waiting for an introduction", other),
                }
            }
        })
        .await
        .map_err(|_| MasterServerError::Timeout(wait))?
    }
}

/// Identity a host registers under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRegistration {
    pub app_id: String,
    pub guid: SessionGuid,
    pub internal: SocketAddr,
}

/// Background task keeping one session registered with the master server.
///
/// Dropping the handle makes the task unregister and stop.
#[derive(Debug)]
pub struct RegistrationHandle {
    info: watch::Sender<NetworkSessionPublicInfo>,
    task: JoinHandle<()>,
}

impl RegistrationHandle {
    pub fn spawn(
        runtime: &Handle,
        client: MasterServerClient,
        registration: HostRegistration,
        info: NetworkSessionPublicInfo,
        period: Duration,
    ) -> Self {
        let (info_tx, info_rx) = watch::channel(info);
        let task = runtime.spawn(keep_registered(client, registration, info_rx, period));
        Self { info: info_tx, task }
    }

    /// Publishes a new snapshot; the task re-registers only if it changed.
    pub fn update(&self, info: NetworkSessionPublicInfo) {
        self.info.send_if_modified(|current| {
            if *current == info {
                false
            } else {
                *current = info;
                true
            }
        });
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

async fn keep_registered(
    client: MasterServerClient,
    registration: HostRegistration,
    mut info: watch::Receiver<NetworkSessionPublicInfo>,
    period: Duration,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(
        "Registering session {} with master server {}",
        registration.guid,
        client.master_addr()
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = info.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            received = client.receive() => {
                match received {
                    Ok(MasterServerMessage::Introduction { internal, external, .. }) => {
                        info!("Introduced to a joining machine at {} (internal {})", external, internal);
                    }
                    Ok(other) => debug!("Ignoring {:?} from master server", other),
                    Err(e) => {
                        warn!("Master server receive failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
                continue;
            }
        }

        let snapshot = info.borrow_and_update().clone();
        if let Err(e) = client
            .register_host(&registration.app_id, registration.guid, registration.internal, snapshot)
            .await
        {
            warn!("Failed to register with master server: {}", e);
        }
    }

    if let Err(e) = client
        .unregister_host(&registration.app_id, registration.guid)
        .await
    {
        warn!("Failed to unregister from master server: {}", e);
    }
    info!("Session {} no longer advertised", registration.guid);
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{NetworkSessionProperties, NetworkSessionType};

    fn info(count: u8) -> NetworkSessionPublicInfo {
        NetworkSessionPublicInfo {
            session_type: NetworkSessionType::PlayerMatch,
            properties: NetworkSessionProperties::new(),
            host_gamertag: "Host".to_string(),
            max_gamers: 4,
            private_gamer_slots: 0,
            current_gamer_count: count,
            open_private_gamer_slots: 0,
            open_public_gamer_slots: 4 - count,
        }
    }

    #[test]
    fn test_request_hosts_times_out_without_answer() {
        tokio_test::block_on(async {
            // A bound socket that never answers
            let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let client = MasterServerClient::bind(silent.local_addr().unwrap()).await.unwrap();

            let result = client.request_hosts("app", Duration::from_millis(50)).await;
            assert!(matches!(result, Err(MasterServerError::Timeout(_))));
        });
    }

    #[tokio::test]
    async fn test_registration_task_registers_and_unregisters() {
        let master = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = MasterServerClient::bind(master.local_addr().unwrap()).await.unwrap();
        let registration = HostRegistration {
            app_id: "app".to_string(),
            guid: SessionGuid(5),
            internal: "10.0.0.1:3074".parse().unwrap(),
        };

        let handle = RegistrationHandle::spawn(
            &Handle::current(),
            client,
            registration,
            info(1),
            Duration::from_secs(60),
        );

        let mut buffer = vec![0u8; MASTER_DATAGRAM_SIZE];
        let (len, _) = master.recv_from(&mut buffer).await.unwrap();
        match MasterServerMessage::from_bytes(&buffer[..len]).unwrap() {
            MasterServerMessage::RegisterHost { guid, info: sent, .. } => {
                assert_eq!(guid, SessionGuid(5));
                assert_eq!(sent.current_gamer_count, 1);
            }
            other => panic!("Expected a registration, got {:?}", other),
        }

        handle.update(info(2));
        let (len, _) = master.recv_from(&mut buffer).await.unwrap();
        match MasterServerMessage::from_bytes(&buffer[..len]).unwrap() {
            MasterServerMessage::RegisterHost { info: sent, .. } => assert_eq!(sent.current_gamer_count, 2),
            other => panic!("Expected a registration, got {:?}", other),
        }

        drop(handle);
        let (len, _) = master.recv_from(&mut buffer).await.unwrap();
        assert!(matches!(
            MasterServerMessage::from_bytes(&buffer[..len]).unwrap(),
            MasterServerMessage::UnregisterHost { guid, .. } if guid == SessionGuid(5)
        ));
    }
}
