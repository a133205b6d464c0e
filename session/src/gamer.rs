use crate::error::SessionError;
use crate::message::{GamerInfo, GamerStateUpdate};
use crate::queue::LocalGamerQueues;
use crate::session::NetworkSession;
use shared::{GamerId, MachineId, SendDataOptions};

/// A signed-in local profile that wants to take part in a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedInGamer {
    pub gamertag: String,
    pub display_name: String,
    pub wants_private_slot: bool,
}

impl SignedInGamer {
    pub fn new(gamertag: impl Into<String>) -> Self {
        let gamertag = gamertag.into();
        Self {
            display_name: gamertag.clone(),
            gamertag,
            wants_private_slot: false,
        }
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }

    /// Asks for one of the host's private slots, falling back to a public one.
    pub fn private(mut self) -> Self {
        self.wants_private_slot = true;
        self
    }
}

/// One player in the session, local or remote
#[derive(Debug)]
pub struct NetworkGamer {
    id: GamerId,
    gamertag: String,
    display_name: String,
    is_private_slot: bool,
    is_ready: bool,
    has_left_session: bool,
    machine: MachineId,
    local: Option<LocalGamerQueues>,
}

impl NetworkGamer {
    pub(crate) fn local(id: GamerId, machine: MachineId, profile: &SignedInGamer, is_private_slot: bool) -> Self {
        Self {
            id,
            gamertag: profile.gamertag.clone(),
            display_name: profile.display_name.clone(),
            is_private_slot,
            is_ready: false,
            has_left_session: false,
            machine,
            local: Some(LocalGamerQueues::default()),
        }
    }

    pub(crate) fn remote(machine: MachineId, info: GamerInfo) -> Self {
        Self {
            id: info.id,
            gamertag: info.gamertag,
            display_name: info.display_name,
            is_private_slot: info.is_private_slot,
            is_ready: info.is_ready,
            has_left_session: false,
            machine,
            local: None,
        }
    }

    pub fn id(&self) -> GamerId {
        self.id
    }

    pub fn gamertag(&self) -> &str {
        &self.gamertag
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn is_private_slot(&self) -> bool {
        self.is_private_slot
    }

    pub fn is_ready(&self) -> bool {
        self.is_ready
    }

    pub fn has_left_session(&self) -> bool {
        self.has_left_session
    }

    pub fn machine(&self) -> MachineId {
        self.machine
    }

    pub fn is_local(&self) -> bool {
        self.local.is_some()
    }

    pub fn queues(&self) -> Option<&LocalGamerQueues> {
        self.local.as_ref()
    }

    pub(crate) fn queues_mut(&mut self) -> Option<&mut LocalGamerQueues> {
        self.local.as_mut()
    }

    pub(crate) fn set_ready_flag(&mut self, ready: bool) {
        self.is_ready = ready;
    }

    pub(crate) fn mark_left(&mut self) {
        self.has_left_session = true;
    }

    pub(crate) fn info(&self) -> GamerInfo {
        GamerInfo {
            id: self.id,
            gamertag: self.gamertag.clone(),
            display_name: self.display_name.clone(),
            is_private_slot: self.is_private_slot,
            is_ready: self.is_ready,
        }
    }

    pub(crate) fn state_update(&self) -> GamerStateUpdate {
        GamerStateUpdate {
            id: self.id,
            gamertag: self.gamertag.clone(),
            display_name: self.display_name.clone(),
            is_ready: self.is_ready,
        }
    }

    /// Refreshes a remote record from a repeated `GamerJoined`.
    pub(crate) fn apply_info(&mut self, info: GamerInfo) {
        self.gamertag = info.gamertag;
        self.display_name = info.display_name;
        self.is_private_slot = info.is_private_slot;
        self.is_ready = info.is_ready;
    }

    pub(crate) fn apply_update(&mut self, update: GamerStateUpdate) {
        self.gamertag = update.gamertag;
        self.display_name = update.display_name;
        self.is_ready = update.is_ready;
    }
}

/// Borrowed handle for acting as one local gamer.
///
/// Obtained from [`NetworkSession::local_gamer`].
pub struct LocalNetworkGamer<'a> {
    session: &'a mut NetworkSession,
    id: GamerId,
}

impl<'a> LocalNetworkGamer<'a> {
    pub(crate) fn new(session: &'a mut NetworkSession, id: GamerId) -> Self {
        Self { session, id }
    }

    pub fn id(&self) -> GamerId {
        self.id
    }

    pub fn gamer(&self) -> Option<&NetworkGamer> {
        self.session.gamer(self.id)
    }

    /// Queues `data` for every other gamer in the session.
    pub fn send_data(&mut self, data: &[u8], options: SendDataOptions) -> Result<(), SessionError> {
        self.session.send_data_from(self.id, data, options, None)
    }

    pub fn send_data_to(
        &mut self,
        data: &[u8],
        options: SendDataOptions,
        recipient: GamerId,
    ) -> Result<(), SessionError> {
        self.session.send_data_from(self.id, data, options, Some(recipient))
    }

    /// Copies the oldest pending packet into `buffer`.
    ///
    /// Returns its length and sender, or `(0, None)` when nothing is pending.
    pub fn receive_data(&mut self, buffer: &mut [u8]) -> Result<(usize, Option<GamerId>), SessionError> {
        self.session.receive_data_for(self.id, buffer)
    }

    pub fn is_data_available(&self) -> bool {
        self.gamer()
            .and_then(NetworkGamer::queues)
            .map_or(false, |queues| queues.inbound_len() > 0)
    }

    pub fn set_ready(&mut self, ready: bool) -> Result<(), SessionError> {
        self.session.set_ready(self.id, ready)
    }
}
