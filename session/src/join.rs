//! Finding sessions and joining them
//!
//! A join goes through two stages. First the transport connects and the host
//! approves or denies the hail; an approval carries a [`JoinGrant`] with the
//! machine id and the session shape. Then one `GamerIdRequest` per local
//! profile goes to the host, and the join completes once every request got an
//! answer. [`JoinAttempt`] drives both stages without blocking;
//! [`NetworkSession::join`] wraps it in a tokio polling loop.

use crate::config::{SessionConfig, SessionSettings};
use crate::error::{CodecError, JoinError, SessionError};
use crate::gamer::SignedInGamer;
use crate::master_client::{MasterServerClient, MasterServerError};
use crate::session::NetworkSession;
use crate::state::{SessionEndReason, SessionState};
use crate::transport::{ConnectionId, ConnectionStatus, IncomingMessage, TransportPeer};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use shared::{
    MachineId, NetworkSessionPublicInfo, SessionGuid, SessionQuery, MAX_LOCAL_GAMERS,
    SESSION_PROPERTY_COUNT,
};
use std::net::SocketAddr;
use std::time::Instant;

/// Hail sent with the connection request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct JoinRequest {
    pub app_id: String,
    pub property_count: u8,
    pub local_gamers: u8,
    pub private_gamers: u8,
}

/// Hail sent back with the approval
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct JoinGrant {
    pub machine: MachineId,
    pub host_machine: MachineId,
    pub guid: SessionGuid,
    pub settings: SessionSettings,
    pub state: SessionState,
}

/// Payload of a LAN discovery request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct DiscoveryQuery {
    pub app_id: String,
}

/// Reason strings the host denies a connection with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    SessionFull,
    SessionNotJoinable,
    ProtocolMismatch,
}

impl DenyReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DenyReason::SessionFull => "SessionFull",
            DenyReason::SessionNotJoinable => "SessionNotJoinable",
            DenyReason::ProtocolMismatch => "ProtocolMismatch",
        }
    }

    pub fn parse(reason: &str) -> Option<Self> {
        match reason {
            "SessionFull" => Some(DenyReason::SessionFull),
            "SessionNotJoinable" => Some(DenyReason::SessionNotJoinable),
            "ProtocolMismatch" => Some(DenyReason::ProtocolMismatch),
            _ => None,
        }
    }
}

fn join_error_for(reason: &str) -> JoinError {
    match DenyReason::parse(reason) {
        Some(DenyReason::SessionFull) => JoinError::SessionFull,
        Some(DenyReason::SessionNotJoinable) => JoinError::SessionNotJoinable,
        Some(DenyReason::ProtocolMismatch) => JoinError::ProtocolMismatch(reason.to_string()),
        None => JoinError::Denied(reason.to_string()),
    }
}

/// A session found by LAN discovery or through the master server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailableNetworkSession {
    /// Where to connect
    pub host_endpoint: SocketAddr,
    /// Address the host sees itself under, known for master server results
    pub internal_endpoint: Option<SocketAddr>,
    pub guid: Option<SessionGuid>,
    pub info: NetworkSessionPublicInfo,
}

#[derive(Debug)]
pub enum JoinProgress {
    Pending,
    Joined(NetworkSession),
}

enum JoinStage {
    Connecting {
        peer: Box<dyn TransportPeer>,
        connection: ConnectionId,
        profiles: Vec<SignedInGamer>,
    },
    AwaitingGamerIds(Box<NetworkSession>),
    Finished,
}

/// A join in progress. Call [`JoinAttempt::poll`] until it stops returning
/// [`JoinProgress::Pending`].
pub struct JoinAttempt {
    stage: JoinStage,
    config: SessionConfig,
    host: SocketAddr,
    started: Instant,
}

impl JoinAttempt {
    pub fn start(
        mut peer: Box<dyn TransportPeer>,
        host: SocketAddr,
        config: SessionConfig,
        profiles: Vec<SignedInGamer>,
    ) -> Result<Self, JoinError> {
        if profiles.is_empty() || profiles.len() > MAX_LOCAL_GAMERS {
            return Err(SessionError::InvalidSettings(format!(
                "between 1 and {} local gamers required, got {}",
                MAX_LOCAL_GAMERS,
                profiles.len()
            ))
            .into());
        }

        let request = JoinRequest {
            app_id: config.app_id.clone(),
            property_count: SESSION_PROPERTY_COUNT as u8,
            local_gamers: profiles.len() as u8,
            private_gamers: profiles.iter().filter(|p| p.wants_private_slot).count() as u8,
        };
        let hail = bincode::serialize(&request).map_err(|e| SessionError::from(CodecError::from(e)))?;

        peer.start()?;
        let connection = peer.connect(host, &hail)?;
        info!("Joining session at {} with {} gamer(s)", host, profiles.len());

        Ok(Self {
            stage: JoinStage::Connecting {
                peer,
                connection,
                profiles,
            },
            config,
            host,
            started: Instant::now(),
        })
    }

    pub fn host(&self) -> SocketAddr {
        self.host
    }

    pub fn poll(&mut self) -> Result<JoinProgress, JoinError> {
        match std::mem::replace(&mut self.stage, JoinStage::Finished) {
            JoinStage::Connecting {
                peer,
                connection,
                profiles,
            } => self.poll_connecting(peer, connection, profiles),
            JoinStage::AwaitingGamerIds(session) => self.poll_gamer_ids(session),
            JoinStage::Finished => Err(SessionError::InvalidOperation(
                "join attempt already finished".to_string(),
            )
            .into()),
        }
    }

    fn timed_out(&self) -> bool {
        self.started.elapsed() >= self.config.join_timeout
    }

    fn poll_connecting(
        &mut self,
        mut peer: Box<dyn TransportPeer>,
        connection: ConnectionId,
        profiles: Vec<SignedInGamer>,
    ) -> Result<JoinProgress, JoinError> {
        while let Some(message) = peer.read_message() {
            match message {
                IncomingMessage::StatusChanged {
                    connection: changed,
                    status,
                } if changed == connection => match status {
                    ConnectionStatus::Connected { hail } => {
                        let grant: JoinGrant = bincode::deserialize(&hail)
                            .map_err(|e| JoinError::ProtocolMismatch(e.to_string()))?;
                        let session =
                            NetworkSession::from_grant(peer, self.config.clone(), grant, connection, profiles);
                        return self.poll_gamer_ids(Box::new(session));
                    }
                    ConnectionStatus::Disconnected { reason } => {
                        info!("Join to {} refused: {}", self.host, reason);
                        return Err(join_error_for(&reason));
                    }
                },
                other => debug!("Ignoring {:?} while joining {}", other, self.host),
            }
        }

        if self.timed_out() {
            peer.shutdown("join timed out");
            return Err(JoinError::Timeout(self.config.join_timeout));
        }
        self.stage = JoinStage::Connecting {
            peer,
            connection,
            profiles,
        };
        Ok(JoinProgress::Pending)
    }

    fn poll_gamer_ids(&mut self, mut session: Box<NetworkSession>) -> Result<JoinProgress, JoinError> {
        if session.state() != SessionState::Ended {
            session.update()?;
        }
        if session.state() == SessionState::Ended {
            let reason = session.end_reason().map_or("unknown", SessionEndReason::as_str);
            return Err(JoinError::HostDisconnected(reason.to_string()));
        }
        if session.denied_gamer_ids() > 0 {
            session.end();
            return Err(JoinError::SessionFull);
        }
        if session.pending_gamer_ids() == 0 {
            info!(
                "Joined session at {} as machine {}",
                self.host,
                session.local_machine()
            );
            return Ok(JoinProgress::Joined(*session));
        }
        if self.timed_out() {
            session.end();
            return Err(JoinError::Timeout(self.config.join_timeout));
        }
        self.stage = JoinStage::AwaitingGamerIds(session);
        Ok(JoinProgress::Pending)
    }
}

fn collect_discovery_responses(
    peer: &mut dyn TransportPeer,
    query: &SessionQuery,
    found: &mut Vec<AvailableNetworkSession>,
) {
    while let Some(message) = peer.read_message() {
        let (from, payload) = match message {
            IncomingMessage::DiscoveryResponse { from, payload } => (from, payload),
            other => {
                debug!("Ignoring {:?} while searching", other);
                continue;
            }
        };
        match NetworkSessionPublicInfo::from_bytes(&payload) {
            Ok(info) if info.matches(query) => {
                if !found.iter().any(|session| session.host_endpoint == from) {
                    debug!("Found session hosted by {} at {}", info.host_gamertag, from);
                    found.push(AvailableNetworkSession {
                        host_endpoint: from,
                        internal_endpoint: None,
                        guid: None,
                        info,
                    });
                }
            }
            Ok(_) => debug!("Session at {} does not match the query", from),
            Err(e) => warn!("Malformed discovery response from {}: {}", from, e),
        }
    }
}

impl NetworkSession {
    /// Joins the session hosted at `host`, polling until done or timed out.
    pub async fn join(
        peer: Box<dyn TransportPeer>,
        host: SocketAddr,
        config: SessionConfig,
        profiles: Vec<SignedInGamer>,
    ) -> Result<NetworkSession, JoinError> {
        let poll_interval = config.poll_interval;
        let mut attempt = JoinAttempt::start(peer, host, config, profiles)?;
        loop {
            if let JoinProgress::Joined(session) = attempt.poll()? {
                return Ok(session);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    pub async fn join_available(
        peer: Box<dyn TransportPeer>,
        available: &AvailableNetworkSession,
        config: SessionConfig,
        profiles: Vec<SignedInGamer>,
    ) -> Result<NetworkSession, JoinError> {
        Self::join(peer, available.host_endpoint, config, profiles).await
    }

    /// Broadcasts a discovery request on the configured port and collects
    /// every matching answer that arrives within the discovery timeout.
    pub async fn find_local(
        peer: &mut dyn TransportPeer,
        config: &SessionConfig,
        query: &SessionQuery,
    ) -> Result<Vec<AvailableNetworkSession>, SessionError> {
        peer.start()?;
        let request = DiscoveryQuery {
            app_id: config.app_id.clone(),
        };
        let payload = bincode::serialize(&request).map_err(CodecError::from)?;
        peer.discover_local_peers(config.port, &payload)?;

        let deadline = Instant::now() + config.discovery_timeout;
        let mut found = Vec::new();
        loop {
            collect_discovery_responses(peer, query, &mut found);
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(config.poll_interval).await;
        }
        info!("LAN search found {} session(s)", found.len());
        Ok(found)
    }

    /// Asks the master server for hosts of this application matching `query`.
    pub async fn find_online(
        client: &MasterServerClient,
        config: &SessionConfig,
        query: &SessionQuery,
    ) -> Result<Vec<AvailableNetworkSession>, MasterServerError> {
        let hosts = client
            .request_hosts(&config.app_id, config.discovery_timeout)
            .await?;
        let found: Vec<AvailableNetworkSession> = hosts
            .into_iter()
            .filter(|host| host.info.matches(query))
            .map(|host| AvailableNetworkSession {
                host_endpoint: host.external,
                internal_endpoint: Some(host.internal),
                guid: Some(host.guid),
                info: host.info,
            })
            .collect();
        info!("Master server reported {} matching session(s)", found.len());
        Ok(found)
    }
}
