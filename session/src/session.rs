//! The session object applications hold on to
//!
//! A `NetworkSession` is single-threaded: the application calls
//! [`NetworkSession::update`] once per frame, which drains the transport,
//! dispatches every message, releases parked packets and flushes whatever the
//! local gamers queued since the last frame. Message routing and the protocol
//! handlers live in the `dispatch` submodule.

mod dispatch;

use crate::config::{SessionConfig, SessionSettings};
use crate::error::SessionError;
use crate::gamer::{LocalNetworkGamer, NetworkGamer, SignedInGamer};
use crate::join::JoinGrant;
use crate::machine::NetworkMachine;
use crate::master_client::{HostRegistration, MasterServerClient, RegistrationHandle};
use crate::message::{GamerInfo, Message};
use crate::pool::PacketPool;
use crate::queue::OutboundPacket;
use crate::registry::{GamerRegistry, MachineRegistry, Registry, SlotUsage};
use crate::state::{SessionEndReason, SessionEvent, SessionState, Transition};
use crate::transport::{ConnectionId, TransportPeer};
use log::{info, warn};
use shared::{
    Address, GamerId, MachineId, NetworkSessionProperties, NetworkSessionPublicInfo, SendDataOptions,
    SessionGuid,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

/// The host always takes the first machine id.
pub const HOST_MACHINE_ID: MachineId = MachineId::FIRST;

/// A gamer id the host handed out but whose `GamerJoined` has not arrived yet
#[derive(Debug, Clone, Copy)]
struct Reservation {
    machine: MachineId,
    private_slot: bool,
}

/// Slots set aside for an approved machine that has not asked for its ids yet
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct SlotPromise {
    pub private: u8,
    pub public: u8,
}

impl SlotPromise {
    pub fn total(&self) -> u8 {
        self.private + self.public
    }

    /// Consumes one promised slot, preferring the kind asked for.
    /// Returns whether the slot is private.
    fn take(&mut self, wants_private: bool) -> Option<bool> {
        if wants_private && self.private > 0 {
            self.private -= 1;
            Some(true)
        } else if self.public > 0 {
            self.public -= 1;
            Some(false)
        } else if self.private > 0 {
            self.private -= 1;
            Some(true)
        } else {
            None
        }
    }
}

/// Picks a slot for a new gamer: private if wanted and open, else public,
/// else any private slot left. `None` when the session is full.
fn choose_slot(usage: SlotUsage, wants_private: bool) -> Option<bool> {
    if wants_private && usage.open_private() > 0 {
        Some(true)
    } else if usage.open_public() > 0 {
        Some(false)
    } else if usage.open_private() > 0 {
        Some(true)
    } else {
        None
    }
}

pub struct NetworkSession {
    peer: Box<dyn TransportPeer>,
    config: SessionConfig,
    settings: SessionSettings,
    state: SessionState,
    guid: SessionGuid,
    local_machine: MachineId,
    host_machine: MachineId,
    machines: MachineRegistry,
    gamers: GamerRegistry,
    pool: PacketPool,
    reservations: HashMap<GamerId, Reservation>,
    promises: HashMap<MachineId, SlotPromise>,
    // Local profiles waiting for a GamerIdResponse, in request order
    pending_profiles: VecDeque<SignedInGamer>,
    denied_profiles: usize,
    departed: HashSet<GamerId>,
    violations: HashMap<MachineId, u32>,
    events: VecDeque<SessionEvent>,
    end_reason: Option<SessionEndReason>,
    registration: Option<RegistrationHandle>,
    scratch: Vec<u8>,
}

impl NetworkSession {
    fn with_parts(
        peer: Box<dyn TransportPeer>,
        config: SessionConfig,
        settings: SessionSettings,
        state: SessionState,
        guid: SessionGuid,
        local_machine: MachineId,
        host_machine: MachineId,
    ) -> Self {
        Self {
            peer,
            config,
            settings,
            state,
            guid,
            local_machine,
            host_machine,
            machines: Registry::new(),
            gamers: Registry::new(),
            pool: PacketPool::new(),
            reservations: HashMap::new(),
            promises: HashMap::new(),
            pending_profiles: VecDeque::new(),
            denied_profiles: 0,
            departed: HashSet::new(),
            violations: HashMap::new(),
            events: VecDeque::new(),
            end_reason: None,
            registration: None,
            scratch: Vec::new(),
        }
    }

    /// Hosts a new session with `profiles` as the host's local gamers.
    pub fn create(
        mut peer: Box<dyn TransportPeer>,
        settings: SessionSettings,
        config: SessionConfig,
        profiles: Vec<SignedInGamer>,
    ) -> Result<Self, SessionError> {
        settings.validate(profiles.len())?;
        peer.start()?;

        let mut session = Self::with_parts(
            peer,
            config,
            settings,
            SessionState::Lobby,
            SessionGuid::random(),
            HOST_MACHINE_ID,
            HOST_MACHINE_ID,
        );
        session
            .machines
            .insert(HOST_MACHINE_ID, NetworkMachine::local(HOST_MACHINE_ID, true));

        for profile in &profiles {
            let private_slot = choose_slot(session.slot_usage(), profile.wants_private_slot)
                .ok_or_else(|| SessionError::InvalidSettings("no slot left for a host gamer".to_string()))?;
            let id = session
                .gamers
                .first_free(|_| false)
                .ok_or_else(|| SessionError::InvalidSettings("gamer ids exhausted".to_string()))?;
            session.add_local_gamer(id, profile, private_slot);
        }

        info!(
            "Created {:?} session {} on {} ({} max gamers, {} private)",
            session.settings.session_type,
            session.guid,
            session.peer.local_addr(),
            session.settings.max_gamers,
            session.settings.private_gamer_slots
        );
        Ok(session)
    }

    /// Builds the client side once the host approved the connection, and asks
    /// for one gamer id per local profile.
    pub(crate) fn from_grant(
        peer: Box<dyn TransportPeer>,
        config: SessionConfig,
        grant: JoinGrant,
        host_connection: ConnectionId,
        profiles: Vec<SignedInGamer>,
    ) -> Self {
        let mut session = Self::with_parts(
            peer,
            config,
            grant.settings,
            grant.state,
            grant.guid,
            grant.machine,
            grant.host_machine,
        );
        session.machines.insert(
            grant.host_machine,
            NetworkMachine::remote(grant.host_machine, true, Some(host_connection)),
        );
        session
            .machines
            .insert(grant.machine, NetworkMachine::local(grant.machine, false));

        for profile in profiles {
            let request = Message::GamerIdRequest {
                private_slot: profile.wants_private_slot,
            };
            session.send_control(Address::To(grant.host_machine), request, false, None);
            session.pending_profiles.push_back(profile);
        }
        info!(
            "Joined session {} as machine {}, waiting for {} gamer id(s)",
            session.guid,
            session.local_machine,
            session.pending_profiles.len()
        );
        session
    }

    /// Runs one frame of networking.
    pub fn update(&mut self) -> Result<(), SessionError> {
        self.ensure_active()?;
        while let Some(message) = self.peer.read_message() {
            self.handle_transport_message(message);
            if self.state == SessionState::Ended {
                return Ok(());
            }
        }
        self.release_delayed_packets();
        self.flush_outbound();
        self.refresh_registration();
        Ok(())
    }

    pub fn is_host(&self) -> bool {
        self.local_machine == self.host_machine
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn guid(&self) -> SessionGuid {
        self.guid
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn local_machine(&self) -> MachineId {
        self.local_machine
    }

    pub fn host_machine(&self) -> MachineId {
        self.host_machine
    }

    pub fn machine(&self, id: MachineId) -> Option<&NetworkMachine> {
        self.machines.get(id)
    }

    pub fn machines(&self) -> impl Iterator<Item = &NetworkMachine> + '_ {
        self.machines.iter()
    }

    pub fn gamer(&self, id: GamerId) -> Option<&NetworkGamer> {
        self.gamers.get(id)
    }

    /// Every gamer in the order this machine learned about them
    pub fn gamers(&self) -> impl Iterator<Item = &NetworkGamer> + '_ {
        self.gamers.iter()
    }

    pub fn gamer_count(&self) -> usize {
        self.gamers.len()
    }

    pub fn local_gamer_ids(&self) -> Vec<GamerId> {
        self.machines
            .get(self.local_machine)
            .map(|machine| machine.gamers().to_vec())
            .unwrap_or_default()
    }

    pub fn remote_gamers(&self) -> impl Iterator<Item = &NetworkGamer> + '_ {
        self.gamers.iter().filter(|gamer| !gamer.is_local())
    }

    /// First gamer of the host machine
    pub fn host_gamer(&self) -> Option<&NetworkGamer> {
        self.machines
            .get(self.host_machine)
            .and_then(|machine| machine.gamers().first())
            .and_then(|&id| self.gamers.get(id))
    }

    pub fn local_gamer(&mut self, id: GamerId) -> Result<LocalNetworkGamer<'_>, SessionError> {
        self.ensure_active()?;
        if !self.gamers.get(id).map_or(false, NetworkGamer::is_local) {
            return Err(SessionError::NotLocalGamer(id));
        }
        Ok(LocalNetworkGamer::new(self, id))
    }

    pub fn is_everyone_ready(&self) -> bool {
        !self.gamers.is_empty() && self.gamers.iter().all(NetworkGamer::is_ready)
    }

    pub fn properties(&self) -> &NetworkSessionProperties {
        &self.settings.properties
    }

    /// Changes an advertised property. Only affects what searchers see.
    pub fn set_property(&mut self, index: usize, value: Option<i32>) -> Result<(), SessionError> {
        self.ensure_host("change session properties")?;
        self.settings.properties.set(index, value)?;
        Ok(())
    }

    pub fn set_allow_join_in_progress(&mut self, allow: bool) -> Result<(), SessionError> {
        self.ensure_host("change join-in-progress")?;
        self.settings.allow_join_in_progress = allow;
        Ok(())
    }

    pub fn max_gamers(&self) -> u8 {
        self.settings.max_gamers
    }

    pub fn private_gamer_slots(&self) -> u8 {
        self.settings.private_gamer_slots
    }

    /// Slot accounting; on the host, handed-out ids and promised slots count as taken.
    pub fn slot_usage(&self) -> SlotUsage {
        let mut usage = SlotUsage {
            max_gamers: self.settings.max_gamers,
            private_slots: self.settings.private_gamer_slots,
            private_used: self.gamers.private_count(),
            public_used: self.gamers.public_count(),
        };
        for reservation in self.reservations.values() {
            if reservation.private_slot {
                usage.private_used = usage.private_used.saturating_add(1);
            } else {
                usage.public_used = usage.public_used.saturating_add(1);
            }
        }
        for promise in self.promises.values() {
            usage.private_used = usage.private_used.saturating_add(promise.private);
            usage.public_used = usage.public_used.saturating_add(promise.public);
        }
        usage
    }

    pub fn open_private_gamer_slots(&self) -> u8 {
        self.slot_usage().open_private()
    }

    pub fn open_public_gamer_slots(&self) -> u8 {
        self.slot_usage().open_public()
    }

    /// Snapshot handed to LAN searchers and the master server
    pub fn public_info(&self) -> NetworkSessionPublicInfo {
        let usage = self.slot_usage();
        NetworkSessionPublicInfo {
            session_type: self.settings.session_type,
            properties: self.settings.properties,
            host_gamertag: self
                .host_gamer()
                .map(|gamer| gamer.gamertag().to_string())
                .unwrap_or_default(),
            max_gamers: self.settings.max_gamers,
            private_gamer_slots: self.settings.private_gamer_slots,
            current_gamer_count: u8::try_from(self.gamers.len()).unwrap_or(u8::MAX),
            open_private_gamer_slots: usage.open_private(),
            open_public_gamer_slots: usage.open_public(),
        }
    }

    /// Profiles still waiting for the host to hand out an id
    pub fn pending_gamer_ids(&self) -> usize {
        self.pending_profiles.len()
    }

    /// Profiles the host refused for lack of slots
    pub fn denied_gamer_ids(&self) -> usize {
        self.denied_profiles
    }

    pub fn end_reason(&self) -> Option<SessionEndReason> {
        self.end_reason
    }

    pub fn poll_event(&mut self) -> Option<SessionEvent> {
        self.events.pop_front()
    }

    /// Protocol violations the host has counted per remote machine
    pub fn kick_candidates(&self) -> Vec<(MachineId, u32)> {
        let mut candidates: Vec<(MachineId, u32)> = self
            .violations
            .iter()
            .map(|(&machine, &count)| (machine, count))
            .collect();
        candidates.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        candidates
    }

    pub fn packet_pool(&self) -> &PacketPool {
        &self.pool
    }

    pub fn start_game(&mut self) -> Result<(), SessionError> {
        self.ensure_host("start the game")?;
        if self.state != SessionState::Lobby {
            return Err(SessionError::InvalidOperation(format!(
                "cannot start a game while {:?}",
                self.state
            )));
        }
        self.send_control(Address::All, Message::StartGame, false, None);
        Ok(())
    }

    /// Returns everybody to the lobby and clears every ready flag.
    pub fn end_game(&mut self) -> Result<(), SessionError> {
        self.ensure_host("end the game")?;
        if self.state != SessionState::Playing {
            return Err(SessionError::InvalidOperation(format!(
                "cannot end a game while {:?}",
                self.state
            )));
        }
        self.send_control(Address::All, Message::EndGame, false, None);
        self.send_control(Address::All, Message::ResetReady, false, None);
        Ok(())
    }

    pub fn reset_ready(&mut self) -> Result<(), SessionError> {
        self.ensure_host("reset ready flags")?;
        self.send_control(Address::All, Message::ResetReady, false, None);
        Ok(())
    }

    pub fn set_ready(&mut self, id: GamerId, ready: bool) -> Result<(), SessionError> {
        self.ensure_active()?;
        if !self.state.accepts_ready_changes() {
            return Err(SessionError::InvalidOperation(format!(
                "ready flags only change in the lobby, session is {:?}",
                self.state
            )));
        }
        let gamer = self
            .gamers
            .get_mut(id)
            .filter(|gamer| gamer.is_local())
            .ok_or(SessionError::NotLocalGamer(id))?;
        if gamer.is_ready() == ready {
            return Ok(());
        }
        gamer.set_ready_flag(ready);
        let update = gamer.state_update();
        self.send_control(Address::All, Message::GamerStateChanged(update), true, None);
        Ok(())
    }

    /// Stages `data` from local gamer `sender`; it goes out on the next `update`.
    pub fn send_data(
        &mut self,
        sender: GamerId,
        data: &[u8],
        options: SendDataOptions,
        recipient: Option<GamerId>,
    ) -> Result<(), SessionError> {
        self.send_data_from(sender, data, options, recipient)
    }

    pub(crate) fn send_data_from(
        &mut self,
        sender: GamerId,
        data: &[u8],
        options: SendDataOptions,
        recipient: Option<GamerId>,
    ) -> Result<(), SessionError> {
        self.ensure_active()?;
        if data.is_empty() {
            return Err(SessionError::InvalidOperation("cannot send an empty packet".to_string()));
        }
        let method = options.delivery_method()?;
        if !self.gamers.get(sender).map_or(false, NetworkGamer::is_local) {
            return Err(SessionError::NotLocalGamer(sender));
        }
        if let Some(recipient) = recipient {
            if !self.gamers.contains(recipient) {
                return Err(SessionError::InvalidOperation(format!(
                    "gamer {} is not in the session",
                    recipient
                )));
            }
        }

        let packet = self.pool.get_and_fill_with(data);
        let outbound = OutboundPacket {
            recipient: recipient.into(),
            method,
            packet,
        };
        match self.gamers.get_mut(sender).and_then(NetworkGamer::queues_mut) {
            Some(queues) => queues.stage(outbound),
            None => self.pool.recycle(outbound.packet),
        }
        Ok(())
    }

    /// Reads the oldest packet queued for local gamer `id` into `buffer`.
    pub fn receive_data(&mut self, id: GamerId, buffer: &mut [u8]) -> Result<(usize, Option<GamerId>), SessionError> {
        self.receive_data_for(id, buffer)
    }

    pub(crate) fn receive_data_for(
        &mut self,
        id: GamerId,
        buffer: &mut [u8],
    ) -> Result<(usize, Option<GamerId>), SessionError> {
        self.ensure_active()?;
        let queues = self
            .gamers
            .get_mut(id)
            .and_then(NetworkGamer::queues_mut)
            .ok_or(SessionError::NotLocalGamer(id))?;
        let Some(inbound) = queues.pop_inbound() else {
            return Ok((0, None));
        };

        let length = inbound.packet.len();
        if length > buffer.len() {
            queues.push_front_inbound(inbound);
            return Err(SessionError::InvalidOperation(format!(
                "receive buffer holds {} bytes, packet needs {}",
                buffer.len(),
                length
            )));
        }
        buffer[..length].copy_from_slice(inbound.packet.as_slice());
        self.pool.recycle(inbound.packet);
        Ok((length, Some(inbound.sender)))
    }

    /// Disconnects a remote machine and removes its gamers everywhere.
    pub fn remove_machine(&mut self, machine: MachineId) -> Result<(), SessionError> {
        self.ensure_host("remove machines")?;
        if machine == self.local_machine {
            return Err(SessionError::InvalidOperation("the host cannot remove itself".to_string()));
        }
        let connection = self
            .machines
            .get(machine)
            .and_then(NetworkMachine::connection)
            .ok_or_else(|| SessionError::InvalidOperation(format!("unknown machine {}", machine)))?;

        info!("Removing machine {} from the session", machine);
        self.peer.disconnect(connection, SessionEndReason::RemovedByHost.as_str());
        self.drop_machine(machine);
        Ok(())
    }

    /// Keeps the session registered with the master server until it ends.
    ///
    /// Needs to be called from within a tokio runtime.
    pub fn advertise(&mut self, client: MasterServerClient) -> Result<(), SessionError> {
        self.ensure_host("advertise the session")?;
        if !self.settings.session_type.is_online() {
            return Err(SessionError::InvalidOperation(format!(
                "{:?} sessions are not advertised online",
                self.settings.session_type
            )));
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            SessionError::InvalidOperation("advertising needs a tokio runtime".to_string())
        })?;

        let registration = HostRegistration {
            app_id: self.config.app_id.clone(),
            guid: self.guid,
            internal: self.peer.local_addr(),
        };
        self.registration = Some(RegistrationHandle::spawn(
            &runtime,
            client,
            registration,
            self.public_info(),
            self.config.registration_interval,
        ));
        Ok(())
    }

    pub fn is_advertised(&self) -> bool {
        self.registration.is_some()
    }

    /// Leaves the session. Clients announce their gamers' departure first.
    pub fn end(&mut self) {
        if self.state == SessionState::Ended {
            return;
        }
        let reason = if self.is_host() {
            SessionEndReason::HostEndedSession
        } else {
            for gamer in self.local_gamer_ids() {
                self.send_control(Address::All, Message::GamerLeft { gamer }, true, None);
            }
            SessionEndReason::ClientSignedOut
        };
        self.finish(reason);
    }

    fn finish(&mut self, reason: SessionEndReason) {
        let Some(ended) = self.state.apply(Transition::End) else {
            return;
        };
        self.peer.shutdown(reason.as_str());
        self.state = ended;
        self.end_reason = Some(reason);
        self.registration = None;
        for gamer in self.gamers.iter_mut() {
            gamer.mark_left();
        }
        info!("Session {} ended: {}", self.guid, reason.as_str());
        self.events.push_back(SessionEvent::SessionEnded { reason });
    }

    fn ensure_active(&self) -> Result<(), SessionError> {
        if self.state == SessionState::Ended {
            Err(SessionError::Ended)
        } else {
            Ok(())
        }
    }

    fn ensure_host(&self, action: &'static str) -> Result<(), SessionError> {
        self.ensure_active()?;
        if self.is_host() {
            Ok(())
        } else {
            Err(SessionError::NotHost(action))
        }
    }

    fn refresh_registration(&mut self) {
        if let Some(registration) = &self.registration {
            if registration.is_finished() {
                warn!("Master server registration task stopped");
                self.registration = None;
            } else {
                registration.update(self.public_info());
            }
        }
    }

    fn add_local_gamer(&mut self, id: GamerId, profile: &SignedInGamer, private_slot: bool) {
        let gamer = NetworkGamer::local(id, self.local_machine, profile, private_slot);
        self.insert_gamer(gamer);
    }

    fn insert_gamer(&mut self, gamer: NetworkGamer) {
        let id = gamer.id();
        let machine = gamer.machine();
        let gamertag = gamer.gamertag().to_string();
        let is_local = gamer.is_local();
        if !self.gamers.insert(id, gamer) {
            warn!("Gamer id {} is already taken", id);
            return;
        }
        if let Some(record) = self.machines.get_mut(machine) {
            record.add_gamer(id);
        }
        self.departed.remove(&id);
        info!("Gamer {} ({}) joined on machine {}", id, gamertag, machine);
        self.events.push_back(SessionEvent::GamerJoined {
            id,
            gamertag,
            is_local,
        });
    }

    fn remove_gamer(&mut self, id: GamerId) {
        let Some(mut gamer) = self.gamers.remove(id) else {
            return;
        };
        gamer.mark_left();
        if let Some(machine) = self.machines.get_mut(gamer.machine()) {
            machine.remove_gamer(id);
        }
        if let Some(queues) = gamer.queues_mut() {
            queues.drain_into(&mut self.pool);
        }
        let pool = &mut self.pool;
        for other in self.gamers.iter_mut() {
            if let Some(queues) = other.queues_mut() {
                queues.discard(pool, id);
            }
        }
        self.departed.insert(id);
        self.reservations.remove(&id);

        info!("Gamer {} ({}) left the session", id, gamer.gamertag());
        self.events.push_back(SessionEvent::GamerLeft {
            id,
            gamertag: gamer.gamertag().to_string(),
        });
    }

    fn remove_machine_records(&mut self, machine: MachineId) {
        for gamer in self.gamers.owned_by(machine) {
            self.remove_gamer(gamer);
        }
        self.machines.remove(machine);
        self.promises.remove(&machine);
        self.reservations.retain(|_, reservation| reservation.machine != machine);
        self.violations.remove(&machine);
        info!("Machine {} left the session", machine);
    }

    fn local_gamer_infos(&self) -> Vec<GamerInfo> {
        self.local_gamer_ids()
            .into_iter()
            .filter_map(|id| self.gamers.get(id).map(NetworkGamer::info))
            .collect()
    }
}

impl fmt::Debug for NetworkSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkSession")
            .field("local_addr", &self.peer.local_addr())
            .field("guid", &self.guid)
            .field("state", &self.state)
            .field("local_machine", &self.local_machine)
            .field("host_machine", &self.host_machine)
            .field("machines", &self.machines.len())
            .field("gamers", &self.gamers.len())
            .finish_non_exhaustive()
    }
}

impl Drop for NetworkSession {
    fn drop(&mut self) {
        self.end();
    }
}
