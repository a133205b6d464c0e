use crate::transport::ConnectionId;
use shared::{GamerId, MachineId};

/// One participating device.
///
/// Only the host holds a connection to every remote machine; a client only
/// knows the connection of the host.
#[derive(Debug, Clone)]
pub struct NetworkMachine {
    id: MachineId,
    is_host: bool,
    is_local: bool,
    connection: Option<ConnectionId>,
    gamers: Vec<GamerId>,
}

impl NetworkMachine {
    pub(crate) fn local(id: MachineId, is_host: bool) -> Self {
        Self {
            id,
            is_host,
            is_local: true,
            connection: None,
            gamers: Vec::new(),
        }
    }

    pub(crate) fn remote(id: MachineId, is_host: bool, connection: Option<ConnectionId>) -> Self {
        Self {
            id,
            is_host,
            is_local: false,
            connection,
            gamers: Vec::new(),
        }
    }

    pub fn id(&self) -> MachineId {
        self.id
    }

    pub fn is_host(&self) -> bool {
        self.is_host
    }

    pub fn is_local(&self) -> bool {
        self.is_local
    }

    pub fn connection(&self) -> Option<ConnectionId> {
        self.connection
    }

    /// Gamers on this machine in the order they joined
    pub fn gamers(&self) -> &[GamerId] {
        &self.gamers
    }

    pub(crate) fn add_gamer(&mut self, gamer: GamerId) {
        if !self.gamers.contains(&gamer) {
            self.gamers.push(gamer);
        }
    }

    pub(crate) fn remove_gamer(&mut self, gamer: GamerId) {
        self.gamers.retain(|&id| id != gamer);
    }
}
