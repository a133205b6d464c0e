use crate::ids::SessionGuid;
use crate::public_info::NetworkSessionPublicInfo;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

pub const DEFAULT_MASTER_SERVER_PORT: u16 = 6000;

/// Receive buffer size for master server datagrams
pub const MASTER_DATAGRAM_SIZE: usize = 8192;

/// One advertised host as reported by the master server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostEntry {
    pub guid: SessionGuid,
    /// Address the host sees itself under
    pub internal: SocketAddr,
    /// Address the master server saw the registration come from
    pub external: SocketAddr,
    pub info: NetworkSessionPublicInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MasterServerMessage {
    // Host -> master
    RegisterHost {
        app_id: String,
        guid: SessionGuid,
        internal: SocketAddr,
        info: NetworkSessionPublicInfo,
    },
    UnregisterHost {
        app_id: String,
        guid: SessionGuid,
    },

    // Searcher -> master
    RequestHosts {
        app_id: String,
    },
    RequestIntroduction {
        app_id: String,
        guid: SessionGuid,
        internal: SocketAddr,
    },

    // Master -> host/searcher
    HostList {
        hosts: Vec<HostEntry>,
    },
    /// Endpoints of the other side of a requested introduction
    Introduction {
        guid: SessionGuid,
        internal: SocketAddr,
        external: SocketAddr,
    },
}

impl MasterServerMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}
