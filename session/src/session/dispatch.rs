//! Routing and the per-message protocol handlers
//!
//! Topology is a star: clients only talk to the host, and the host relays.
//! Sending picks one of two strategies up front. A client hands everything
//! not addressed to itself to the host. The host delivers broadcasts to every
//! connection and directed messages to the one machine they name.
//!
//! Receiving validates a message in a fixed order before any handler runs:
//! decode, known origin and recipient, anti-spoofing, host authority, then
//! forwarding of messages meant for someone else once the host has checked
//! the gamers they name. Whatever the handler accepts on the host is relayed
//! to every other client afterwards.

use super::{choose_slot, NetworkSession, Reservation, SlotPromise};
use crate::config::UnknownRecipientPolicy;
use crate::error::ProtocolViolation;
use crate::gamer::NetworkGamer;
use crate::join::{DenyReason, DiscoveryQuery, JoinGrant, JoinRequest};
use crate::machine::NetworkMachine;
use crate::message::{
    Envelope, GamerIdGrant, GamerInfo, GamerStateUpdate, Message, MessageType, UserData,
};
use crate::queue::OutboundPacket;
use crate::state::{SessionEndReason, SessionEvent, SessionState, Transition};
use crate::transport::{ConnectionId, ConnectionStatus, IncomingMessage, CONTROL_CHANNEL, USER_CHANNEL};
use log::{debug, error, info, warn};
use shared::{
    Address, DeliveryMethod, GamerId, MachineId, NetworkSessionType, MAX_LOCAL_GAMERS,
    SESSION_PROPERTY_COUNT,
};
use std::net::SocketAddr;

/// Transport class and channel a message travels on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Delivery {
    method: DeliveryMethod,
    channel: u8,
}

impl Delivery {
    const CONTROL: Delivery = Delivery {
        method: DeliveryMethod::ReliableOrdered,
        channel: CONTROL_CHANNEL,
    };

    fn for_kind(kind: MessageType, method: DeliveryMethod) -> Self {
        let channel = if kind == MessageType::User {
            USER_CHANNEL
        } else {
            CONTROL_CHANNEL
        };
        Self { method, channel }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    /// Host: broadcast to every connection or send to one
    Star,
    /// Client: everything goes through the host connection
    ViaHost,
}

impl NetworkSession {
    pub(super) fn handle_transport_message(&mut self, message: IncomingMessage) {
        match message {
            IncomingMessage::ConnectionApproval {
                connection,
                remote,
                hail,
            } => self.handle_connection_approval(connection, remote, &hail),
            IncomingMessage::StatusChanged { connection, status } => {
                self.handle_status_change(connection, status)
            }
            IncomingMessage::Data {
                connection,
                method,
                bytes,
                ..
            } => match self.machines.by_connection(connection) {
                Some(sender) => self.dispatch(&bytes, method, sender),
                None => debug!(
                    "Dropping {} bytes from unknown connection {:?}",
                    bytes.len(),
                    connection
                ),
            },
            IncomingMessage::DiscoveryRequest { from, payload } => self.answer_discovery(from, &payload),
            IncomingMessage::DiscoveryResponse { from, .. } => {
                debug!("Ignoring discovery response from {}", from)
            }
        }
    }

    fn handle_connection_approval(&mut self, connection: ConnectionId, remote: SocketAddr, hail: &[u8]) {
        if !self.is_host() {
            debug!("Client refusing connection from {}", remote);
            self.peer.deny(connection, DenyReason::SessionNotJoinable.as_str());
            return;
        }

        let (machine, promise) = match self.evaluate_join(hail) {
            Ok(accepted) => accepted,
            Err(reason) => {
                info!("Denied join from {}: {}", remote, reason.as_str());
                self.peer.deny(connection, reason.as_str());
                return;
            }
        };

        let grant = JoinGrant {
            machine,
            host_machine: self.host_machine,
            guid: self.guid,
            settings: self.settings.clone(),
            state: self.state,
        };
        let approval = match bincode::serialize(&grant) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Failed to encode join grant: {}", e);
                self.peer.deny(connection, DenyReason::ProtocolMismatch.as_str());
                return;
            }
        };
        if let Err(e) = self.peer.approve(connection, &approval) {
            warn!("Failed to approve {}: {}", remote, e);
            return;
        }

        self.machines
            .insert(machine, NetworkMachine::remote(machine, false, Some(connection)));
        self.promises.insert(machine, promise);
        info!(
            "Approved {} as machine {} for {} gamer(s)",
            remote,
            machine,
            promise.total()
        );
    }

    /// Decides whether a connection hail may join, and which slots it gets.
    fn evaluate_join(&self, hail: &[u8]) -> Result<(MachineId, SlotPromise), DenyReason> {
        let request: JoinRequest = bincode::deserialize(hail).map_err(|_| DenyReason::ProtocolMismatch)?;
        if request.app_id != self.config.app_id
            || request.property_count as usize != SESSION_PROPERTY_COUNT
            || request.local_gamers == 0
            || request.local_gamers as usize > MAX_LOCAL_GAMERS
        {
            return Err(DenyReason::ProtocolMismatch);
        }
        if self.settings.session_type == NetworkSessionType::Local
            || !self.state.is_joinable(self.settings.allow_join_in_progress)
        {
            return Err(DenyReason::SessionNotJoinable);
        }

        let usage = self.slot_usage();
        let mut private = request
            .private_gamers
            .min(request.local_gamers)
            .min(usage.open_private());
        let mut public = request.local_gamers - private;
        if public > usage.open_public() {
            // Spill over into whatever private slots are left
            let overflow = public - usage.open_public();
            if overflow > usage.open_private() - private {
                return Err(DenyReason::SessionFull);
            }
            private += overflow;
            public -= overflow;
        }

        let machine = self
            .machines
            .first_free(|_| false)
            .ok_or(DenyReason::SessionFull)?;
        Ok((machine, SlotPromise { private, public }))
    }

    fn handle_status_change(&mut self, connection: ConnectionId, status: ConnectionStatus) {
        let machine = self.machines.by_connection(connection);
        match (status, machine) {
            (ConnectionStatus::Connected { .. }, Some(machine)) if self.is_host() => {
                self.announce_machine(machine)
            }
            (ConnectionStatus::Disconnected { reason }, Some(machine)) => {
                if self.is_host() {
                    info!("Machine {} disconnected: {}", machine, reason);
                    self.drop_machine(machine);
                } else if machine == self.host_machine {
                    warn!("Lost connection to host: {}", reason);
                    self.finish(SessionEndReason::from_reason(&reason));
                }
            }
            (status, _) => debug!("Ignoring {:?} on {:?}", status, connection),
        }
    }

    /// Introduces a freshly connected machine to everybody else and vice versa.
    fn announce_machine(&mut self, machine: MachineId) {
        let others: Vec<MachineId> = self
            .machines
            .ids()
            .filter(|&id| id != machine && id != self.local_machine)
            .collect();
        for other in others {
            let message = Message::MachineConnected { machine: other };
            self.send_control(Address::To(machine), message, false, None);
        }

        let message = Message::MachineConnected { machine };
        self.send_control(Address::All, message, true, Some(machine));

        for info in self.local_gamer_infos() {
            self.send_control(Address::To(machine), Message::GamerJoined(info), false, None);
        }
        info!("Machine {} connected", machine);
    }

    /// Host side removal of a remote machine, announced to everybody left.
    pub(super) fn drop_machine(&mut self, machine: MachineId) {
        if machine == self.local_machine || !self.machines.contains(machine) {
            return;
        }
        self.remove_machine_records(machine);
        let message = Message::MachineDisconnected { machine };
        self.send_control(Address::All, message, true, None);
    }

    fn answer_discovery(&mut self, from: SocketAddr, payload: &[u8]) {
        if !self.is_host()
            || self.settings.session_type != NetworkSessionType::SystemLink
            || !self.state.is_joinable(self.settings.allow_join_in_progress)
        {
            return;
        }
        match bincode::deserialize::<DiscoveryQuery>(payload) {
            Ok(query) if query.app_id == self.config.app_id => {}
            Ok(query) => {
                debug!("Ignoring discovery for app {} from {}", query.app_id, from);
                return;
            }
            Err(e) => {
                debug!("Malformed discovery request from {}: {}", from, e);
                return;
            }
        }

        match self.public_info().to_bytes() {
            Ok(bytes) => {
                if let Err(e) = self.peer.send_discovery_response(from, &bytes) {
                    warn!("Failed to answer discovery from {}: {}", from, e);
                }
            }
            Err(e) => error!("Failed to encode public info: {}", e),
        }
    }

    /// Sends a control message originating from this machine.
    pub(super) fn send_control(
        &mut self,
        recipient: Address<MachineId>,
        message: Message<'_>,
        ignore_self: bool,
        ignore_machine: Option<MachineId>,
    ) {
        let envelope = Envelope::new(self.local_machine, recipient, message);
        self.send_envelope(&envelope, Delivery::CONTROL, ignore_self, ignore_machine);
    }

    fn send_envelope(
        &mut self,
        envelope: &Envelope<'_>,
        delivery: Delivery,
        ignore_self: bool,
        ignore_machine: Option<MachineId>,
    ) {
        let mut bytes = std::mem::take(&mut self.scratch);
        match envelope.encode(&mut bytes) {
            Ok(()) => self.route(&bytes, envelope.recipient, delivery, ignore_self, ignore_machine),
            Err(e) => error!("Failed to encode {:?}: {}", envelope.kind(), e),
        }
        // A loopback delivery may have sent messages of its own meanwhile
        if bytes.capacity() > self.scratch.capacity() {
            self.scratch = bytes;
        }
    }

    fn route_strategy(&self) -> Route {
        if self.is_host() {
            Route::Star
        } else {
            Route::ViaHost
        }
    }

    fn route(
        &mut self,
        bytes: &[u8],
        recipient: Address<MachineId>,
        delivery: Delivery,
        ignore_self: bool,
        ignore_machine: Option<MachineId>,
    ) {
        if self.state == SessionState::Ended {
            return;
        }
        if recipient.is_to(self.local_machine) {
            if !ignore_self {
                self.dispatch(bytes, delivery.method, self.local_machine);
            }
            return;
        }

        match self.route_strategy() {
            Route::ViaHost => {
                if recipient.is_all() && !ignore_self {
                    self.dispatch(bytes, delivery.method, self.local_machine);
                }
                let host = self.machines.get(self.host_machine).and_then(NetworkMachine::connection);
                match host {
                    Some(connection) => self.transmit(bytes, &[connection], delivery),
                    None => warn!("No connection to the host"),
                }
            }
            Route::Star => match recipient {
                Address::All => {
                    if !ignore_self {
                        self.dispatch(bytes, delivery.method, self.local_machine);
                    }
                    let targets: Vec<ConnectionId> = self
                        .machines
                        .iter()
                        .filter(|machine| !machine.is_local() && Some(machine.id()) != ignore_machine)
                        .filter_map(NetworkMachine::connection)
                        .collect();
                    self.transmit(bytes, &targets, delivery);
                }
                Address::To(machine) if Some(machine) == ignore_machine => {}
                Address::To(machine) => {
                    match self.machines.get(machine).and_then(NetworkMachine::connection) {
                        Some(connection) => self.transmit(bytes, &[connection], delivery),
                        None => debug!("No connection to machine {}", machine),
                    }
                }
            },
        }
    }

    fn transmit(&mut self, bytes: &[u8], connections: &[ConnectionId], delivery: Delivery) {
        if connections.is_empty() {
            return;
        }
        if let Err(e) = self
            .peer
            .send(bytes, connections, delivery.method, delivery.channel)
        {
            warn!("Failed to send {} bytes: {}", bytes.len(), e);
        }
    }

    /// Receives one message from `sender` and records failures against it.
    pub(super) fn dispatch(&mut self, bytes: &[u8], method: DeliveryMethod, sender: MachineId) {
        if let Err(violation) = self.receive_message(bytes, method, sender) {
            warn!("Dropped message from machine {}: {}", sender, violation);
            if self.is_host() && sender != self.local_machine {
                self.note_violation(sender);
            }
        }
    }

    fn note_violation(&mut self, machine: MachineId) {
        *self.violations.entry(machine).or_insert(0) += 1;
        if self.config.kick_on_protocol_violation && self.machines.contains(machine) {
            warn!("Removing machine {} after a protocol violation", machine);
            if let Err(e) = self.remove_machine(machine) {
                warn!("Failed to remove machine {}: {}", machine, e);
            }
        }
    }

    pub(crate) fn receive_message(
        &mut self,
        bytes: &[u8],
        method: DeliveryMethod,
        sender: MachineId,
    ) -> Result<(), ProtocolViolation> {
        let envelope = Envelope::decode(bytes)?;
        let origin = envelope.origin;
        let recipient = envelope.recipient;
        let kind = envelope.kind();

        if !self.machines.contains(origin) {
            return Err(ProtocolViolation::UnknownMachine(origin));
        }
        if let Address::To(target) = recipient {
            if !self.machines.contains(target) {
                return Err(ProtocolViolation::UnknownMachine(target));
            }
        }
        // Only the host relays, so anybody else must speak for themselves
        if sender != self.host_machine && origin != sender {
            return Err(ProtocolViolation::SpoofedOrigin {
                claimed: origin,
                actual: sender,
            });
        }

        if let Address::To(target) = recipient {
            if target != self.local_machine && !self.is_host() {
                return Err(ProtocolViolation::Misrouted(target));
            }
        }

        if kind.is_host_only() && origin != self.host_machine {
            return Err(ProtocolViolation::NotFromHost { kind, origin });
        }

        if let Address::To(target) = recipient {
            if target != self.local_machine {
                self.check_forwarded(origin, &envelope.message)?;
                debug!("Forwarding {:?} from machine {} to machine {}", kind, origin, target);
                let delivery = Delivery::for_kind(kind, method);
                self.route(bytes, recipient, delivery, true, Some(origin));
                return Ok(());
            }
        }

        self.handle_message(origin, method, envelope.message)?;

        if self.is_host() && origin != self.local_machine && recipient.is_all() {
            let delivery = Delivery::for_kind(kind, method);
            self.route(bytes, recipient, delivery, true, Some(origin));
        }
        Ok(())
    }

    /// Checks a client message the host passes on to one other machine without
    /// handling it. Gamers named in it must already be known here and belong
    /// to the origin.
    fn check_forwarded(&self, origin: MachineId, message: &Message<'_>) -> Result<(), ProtocolViolation> {
        let gamer = match message {
            Message::GamerJoined(info) => info.id,
            Message::GamerLeft { gamer } => *gamer,
            Message::GamerStateChanged(update) => update.id,
            Message::User(data) => data.sender,
            Message::GamerIdRequest { .. } => {
                return Err(ProtocolViolation::HostOnlyRecipient(MessageType::GamerIdRequest))
            }
            _ => return Ok(()),
        };
        match self.gamers.get(gamer).map(NetworkGamer::machine) {
            Some(owner) if owner == origin => Ok(()),
            Some(_) => Err(ProtocolViolation::NotGamerOwner { gamer, origin }),
            None if matches!(message, Message::GamerJoined(_)) => {
                Err(ProtocolViolation::UnreservedGamerId { gamer, origin })
            }
            None => Err(ProtocolViolation::UnknownGamer(gamer)),
        }
    }

    fn handle_message(
        &mut self,
        origin: MachineId,
        method: DeliveryMethod,
        message: Message<'_>,
    ) -> Result<(), ProtocolViolation> {
        match message {
            Message::MachineConnected { machine } => {
                self.on_machine_connected(machine);
                Ok(())
            }
            Message::MachineDisconnected { machine } => {
                self.on_machine_disconnected(machine);
                Ok(())
            }
            Message::GamerIdRequest { private_slot } => self.on_gamer_id_request(origin, private_slot),
            Message::GamerIdResponse { granted } => self.on_gamer_id_response(granted),
            Message::GamerJoined(info) => self.on_gamer_joined(origin, info),
            Message::GamerLeft { gamer } => self.on_gamer_left(origin, gamer),
            Message::GamerStateChanged(update) => self.on_gamer_state_changed(origin, update),
            Message::ResetReady => {
                self.on_reset_ready();
                Ok(())
            }
            Message::StartGame => self.on_transition(MessageType::StartGame, Transition::StartGame, SessionEvent::GameStarted),
            Message::EndGame => self.on_transition(MessageType::EndGame, Transition::EndGame, SessionEvent::GameEnded),
            Message::User(data) => self.on_user_data(origin, method, data),
        }
    }

    fn on_machine_connected(&mut self, machine: MachineId) {
        if machine == self.local_machine || self.machines.contains(machine) {
            return;
        }
        self.machines
            .insert(machine, NetworkMachine::remote(machine, false, None));
        info!("Machine {} joined the session", machine);

        for info in self.local_gamer_infos() {
            self.send_control(Address::To(machine), Message::GamerJoined(info), false, None);
        }
    }

    fn on_machine_disconnected(&mut self, machine: MachineId) {
        if machine == self.local_machine {
            self.finish(SessionEndReason::RemovedByHost);
        } else if machine != self.host_machine && self.machines.contains(machine) {
            self.remove_machine_records(machine);
        }
    }

    fn on_gamer_id_request(&mut self, origin: MachineId, wants_private: bool) -> Result<(), ProtocolViolation> {
        if !self.is_host() {
            return Err(ProtocolViolation::HostOnlyRecipient(MessageType::GamerIdRequest));
        }
        if origin == self.host_machine {
            return Err(ProtocolViolation::FromHost(MessageType::GamerIdRequest));
        }

        let granted = self.grant_gamer_id(origin, wants_private);
        match granted {
            Some(grant) => debug!(
                "Reserved gamer id {} for machine {} (private: {})",
                grant.id, origin, grant.private_slot
            ),
            None => info!("No slot left for a gamer on machine {}", origin),
        }
        self.send_control(
            Address::To(origin),
            Message::GamerIdResponse { granted },
            false,
            None,
        );
        Ok(())
    }

    fn grant_gamer_id(&mut self, machine: MachineId, wants_private: bool) -> Option<GamerIdGrant> {
        let id = {
            let reservations = &self.reservations;
            self.gamers.first_free(|id| reservations.contains_key(&id))?
        };
        let promised = self
            .promises
            .get_mut(&machine)
            .and_then(|promise| promise.take(wants_private));
        let private_slot = match promised {
            Some(private_slot) => private_slot,
            None => choose_slot(self.slot_usage(), wants_private)?,
        };
        if self.promises.get(&machine).map_or(false, |p| p.total() == 0) {
            self.promises.remove(&machine);
        }

        self.reservations.insert(
            id,
            Reservation {
                machine,
                private_slot,
            },
        );
        Some(GamerIdGrant { id, private_slot })
    }

    fn on_gamer_id_response(&mut self, granted: Option<GamerIdGrant>) -> Result<(), ProtocolViolation> {
        if self.is_host() {
            return Err(ProtocolViolation::NotForHost(MessageType::GamerIdResponse));
        }
        let profile = self
            .pending_profiles
            .pop_front()
            .ok_or(ProtocolViolation::Unsolicited(MessageType::GamerIdResponse))?;

        let Some(grant) = granted else {
            warn!("Host has no slot left for {}", profile.gamertag);
            self.denied_profiles += 1;
            self.events.push_back(SessionEvent::GamerIdDenied {
                gamertag: profile.gamertag,
            });
            return Ok(());
        };
        if let Some(existing) = self.gamers.get(grant.id) {
            return Err(ProtocolViolation::GamerIdInUse {
                gamer: grant.id,
                owner: existing.machine(),
            });
        }

        self.add_local_gamer(grant.id, &profile, grant.private_slot);
        if let Some(info) = self.gamers.get(grant.id).map(NetworkGamer::info) {
            self.send_control(Address::All, Message::GamerJoined(info), true, None);
        }
        Ok(())
    }

    fn on_gamer_joined(&mut self, origin: MachineId, mut info: GamerInfo) -> Result<(), ProtocolViolation> {
        if let Some(existing) = self.gamers.get_mut(info.id) {
            if existing.machine() != origin {
                return Err(ProtocolViolation::GamerIdInUse {
                    gamer: info.id,
                    owner: existing.machine(),
                });
            }
            if !existing.is_local() {
                existing.apply_info(info);
            }
            return Ok(());
        }

        if self.is_host() {
            match self.reservations.get(&info.id) {
                Some(reservation) if reservation.machine == origin => {
                    info.is_private_slot = reservation.private_slot;
                    self.reservations.remove(&info.id);
                }
                _ => {
                    return Err(ProtocolViolation::UnreservedGamerId {
                        gamer: info.id,
                        origin,
                    })
                }
            }
        }

        let id = info.id;
        self.insert_gamer(NetworkGamer::remote(origin, info));
        self.release_delayed_from(id);
        Ok(())
    }

    fn on_gamer_left(&mut self, origin: MachineId, gamer: GamerId) -> Result<(), ProtocolViolation> {
        let owner = self
            .gamers
            .get(gamer)
            .map(NetworkGamer::machine)
            .ok_or(ProtocolViolation::UnknownGamer(gamer))?;
        if owner != origin {
            return Err(ProtocolViolation::NotGamerOwner { gamer, origin });
        }
        self.remove_gamer(gamer);
        Ok(())
    }

    fn on_gamer_state_changed(
        &mut self,
        origin: MachineId,
        update: GamerStateUpdate,
    ) -> Result<(), ProtocolViolation> {
        let gamer = self
            .gamers
            .get_mut(update.id)
            .ok_or(ProtocolViolation::UnknownGamer(update.id))?;
        if gamer.machine() != origin {
            return Err(ProtocolViolation::NotGamerOwner {
                gamer: update.id,
                origin,
            });
        }
        if !gamer.is_local() {
            gamer.apply_update(update);
        }
        Ok(())
    }

    fn on_reset_ready(&mut self) {
        for gamer in self.gamers.iter_mut() {
            gamer.set_ready_flag(false);
        }
        self.events.push_back(SessionEvent::ReadyReset);
    }

    fn on_transition(
        &mut self,
        kind: MessageType,
        transition: Transition,
        event: SessionEvent,
    ) -> Result<(), ProtocolViolation> {
        let next = self
            .state
            .apply(transition)
            .ok_or(ProtocolViolation::InvalidTransition {
                kind,
                state: self.state,
            })?;
        info!("Session {:?} -> {:?}", self.state, next);
        self.state = next;
        self.events.push_back(event);
        Ok(())
    }

    fn on_user_data(
        &mut self,
        origin: MachineId,
        transport_method: DeliveryMethod,
        data: UserData<'_>,
    ) -> Result<(), ProtocolViolation> {
        let sender_known = match self.gamers.get(data.sender) {
            Some(gamer) if gamer.machine() != origin => {
                return Err(ProtocolViolation::NotGamerOwner {
                    gamer: data.sender,
                    origin,
                })
            }
            Some(_) => true,
            // Every GamerJoined reaches the host before that gamer's data
            None if self.is_host() => return Err(ProtocolViolation::UnknownGamer(data.sender)),
            None => false,
        };

        let recipients: Vec<GamerId> = match data.recipient {
            Address::All => self
                .local_gamer_ids()
                .into_iter()
                .filter(|&id| id != data.sender)
                .collect(),
            Address::To(id) if self.gamers.get(id).map_or(false, NetworkGamer::is_local) => vec![id],
            Address::To(id) => return self.unknown_recipient(id),
        };
        if recipients.is_empty() {
            return Ok(());
        }
        if transport_method != data.method {
            debug!(
                "User data sent as {:?} arrived as {:?}",
                data.method, transport_method
            );
        }

        let max_delayed = self.config.max_delayed_packets_per_sender;
        // The first recipient takes the packet itself, every further one a copy
        let mut first = Some(self.pool.get_and_fill_with(data.payload));
        for recipient in recipients {
            let packet = match first.take() {
                Some(packet) => packet,
                None => self.pool.get_and_fill_with(data.payload),
            };
            let pool = &mut self.pool;
            match self.gamers.get_mut(recipient).and_then(NetworkGamer::queues_mut) {
                Some(queues) => queues.deliver(
                    pool,
                    data.sender,
                    origin,
                    sender_known,
                    data.method,
                    packet,
                    max_delayed,
                )?,
                None => pool.recycle(packet),
            }
        }
        Ok(())
    }

    fn unknown_recipient(&self, id: GamerId) -> Result<(), ProtocolViolation> {
        match self.config.unknown_recipient_policy {
            UnknownRecipientPolicy::AcceptAll => Ok(()),
            UnknownRecipientPolicy::AcceptIfDeparted if self.departed.contains(&id) => {
                debug!("Dropping user data for departed gamer {}", id);
                Ok(())
            }
            _ => Err(ProtocolViolation::UnknownRecipient(id)),
        }
    }

    fn release_delayed_from(&mut self, sender: GamerId) {
        let Some(owner) = self.gamers.get(sender).map(NetworkGamer::machine) else {
            return;
        };
        let pool = &mut self.pool;
        for gamer in self.gamers.iter_mut() {
            if let Some(queues) = gamer.queues_mut() {
                let released = queues.release(pool, sender, owner);
                if released > 0 {
                    debug!("Released {} parked packet(s) from gamer {}", released, sender);
                }
            }
        }
    }

    /// Releases parked packets whose sender became known in the meantime.
    pub(super) fn release_delayed_packets(&mut self) {
        for local in self.local_gamer_ids() {
            let senders = match self.gamers.get(local).and_then(NetworkGamer::queues) {
                Some(queues) => queues.pending_senders(),
                None => continue,
            };
            for sender in senders {
                let Some(owner) = self.gamers.get(sender).map(NetworkGamer::machine) else {
                    continue;
                };
                let pool = &mut self.pool;
                if let Some(queues) = self.gamers.get_mut(local).and_then(NetworkGamer::queues_mut) {
                    queues.release(pool, sender, owner);
                }
            }
        }
    }

    /// Sends everything the local gamers staged since the last frame.
    pub(super) fn flush_outbound(&mut self) {
        for sender in self.local_gamer_ids() {
            let staged = match self.gamers.get_mut(sender).and_then(NetworkGamer::queues_mut) {
                Some(queues) => queues.take_outbound(),
                None => continue,
            };
            for outbound in staged {
                self.send_user_packet(sender, &outbound);
                self.pool.recycle(outbound.packet);
            }
        }
    }

    fn send_user_packet(&mut self, sender: GamerId, outbound: &OutboundPacket) {
        let machine_recipient = match outbound.recipient {
            Address::All => Address::All,
            Address::To(gamer) => match self.gamers.get(gamer) {
                Some(record) => Address::To(record.machine()),
                None => {
                    debug!("Dropping packet for departed gamer {}", gamer);
                    return;
                }
            },
        };
        let envelope = Envelope::new(
            self.local_machine,
            machine_recipient,
            Message::User(UserData {
                sender,
                recipient: outbound.recipient,
                method: outbound.method,
                payload: outbound.packet.as_slice(),
            }),
        );
        let delivery = Delivery::for_kind(MessageType::User, outbound.method);
        self.send_envelope(&envelope, delivery, false, None);
    }
}
