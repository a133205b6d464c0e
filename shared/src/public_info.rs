use crate::properties::NetworkSessionProperties;
use serde::{Deserialize, Serialize};

/// Kind of session, deciding how it is discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NetworkSessionType {
    /// Split-screen only, never advertised
    Local,
    /// Discoverable on the local network
    SystemLink,
    /// Advertised through the master server
    PlayerMatch,
    /// Advertised through the master server
    Ranked,
}

impl NetworkSessionType {
    pub fn is_online(self) -> bool {
        matches!(self, NetworkSessionType::PlayerMatch | NetworkSessionType::Ranked)
    }
}

/// Snapshot of a session as advertised to searchers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSessionPublicInfo {
    pub session_type: NetworkSessionType,
    pub properties: NetworkSessionProperties,
    pub host_gamertag: String,
    pub max_gamers: u8,
    pub private_gamer_slots: u8,
    pub current_gamer_count: u8,
    pub open_private_gamer_slots: u8,
    pub open_public_gamer_slots: u8,
}

impl NetworkSessionPublicInfo {
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    pub fn matches(&self, query: &SessionQuery) -> bool {
        self.session_type == query.session_type
            && self.properties.matches(&query.properties)
            && self.open_public_gamer_slots >= query.local_gamers
    }
}

/// Search filter used by both LAN discovery and the master server lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionQuery {
    pub session_type: NetworkSessionType,
    pub properties: NetworkSessionProperties,
    /// Number of local gamers that must fit into the session
    pub local_gamers: u8,
}

impl SessionQuery {
    pub fn new(session_type: NetworkSessionType, local_gamers: u8) -> Self {
        Self {
            session_type,
            properties: NetworkSessionProperties::default(),
            local_gamers,
        }
    }

    pub fn with_properties(mut self, properties: NetworkSessionProperties) -> Self {
        self.properties = properties;
        self
    }
}
