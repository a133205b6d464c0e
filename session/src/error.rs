//! Error types for the session engine
//!
//! Three families with different propagation rules:
//! - [`ProtocolViolation`] never leaves the dispatcher; the offending message is
//!   dropped and logged.
//! - [`SessionError`] is returned synchronously to whoever misused the local API.
//! - [`JoinError`] is the typed outcome of a failed join.

use crate::message::MessageType;
use crate::state::SessionState;
use crate::transport::TransportError;
use shared::{GamerId, MachineId, PropertyIndexOutOfRange, UnsupportedSendOptions};
use std::time::Duration;
use thiserror::Error;

/// Wire-level decoding and encoding failures
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("message of {0} bytes is shorter than the header")]
    TooShort(usize),
    #[error("unknown message type {0}")]
    UnknownType(u8),
    #[error("origin machine id cannot be the broadcast id")]
    BroadcastOrigin,
    #[error("unknown delivery method {0}")]
    UnknownDeliveryMethod(u8),
    #[error("payload of {0} bytes does not fit a user message")]
    PayloadTooLarge(usize),
    #[error("malformed {kind:?} payload: {reason}")]
    Payload { kind: MessageType, reason: String },
    #[error("serialization failed: {0}")]
    Serialization(#[from] bincode::Error),
}

/// Why an incoming message was rejected by the dispatcher
#[derive(Debug, Error)]
pub enum ProtocolViolation {
    #[error(transparent)]
    Malformed(#[from] CodecError),
    #[error("message references unknown machine {0}")]
    UnknownMachine(MachineId),
    #[error("connection of machine {actual} sent a message claiming origin {claimed}")]
    SpoofedOrigin { claimed: MachineId, actual: MachineId },
    #[error("{kind:?} from machine {origin}, only the host may send it")]
    NotFromHost { kind: MessageType, origin: MachineId },
    #[error("{0:?} sent by the host, only clients may send it")]
    FromHost(MessageType),
    #[error("{0:?} can only be handled by the host")]
    HostOnlyRecipient(MessageType),
    #[error("{0:?} can never be handled by the host")]
    NotForHost(MessageType),
    #[error("message for machine {0} was routed to a client")]
    Misrouted(MachineId),
    #[error("machine {origin} does not own gamer {gamer}")]
    NotGamerOwner { gamer: GamerId, origin: MachineId },
    #[error("unknown gamer {0}")]
    UnknownGamer(GamerId),
    #[error("gamer id {gamer} already belongs to machine {owner}")]
    GamerIdInUse { gamer: GamerId, owner: MachineId },
    #[error("gamer id {gamer} was never reserved for machine {origin}")]
    UnreservedGamerId { gamer: GamerId, origin: MachineId },
    #[error("unsolicited {0:?}")]
    Unsolicited(MessageType),
    #[error("{kind:?} is not valid while the session is {state:?}")]
    InvalidTransition { kind: MessageType, state: SessionState },
    #[error("recipient gamer {0} is not a local gamer")]
    UnknownRecipient(GamerId),
    #[error("delayed packet buffer for sender {0} is full")]
    DelayedBufferFull(GamerId),
}

/// Local API misuse and session-level failures
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("the session has ended")]
    Ended,
    #[error("only the host can {0}")]
    NotHost(&'static str),
    #[error("gamer {0} is not a local gamer in this session")]
    NotLocalGamer(GamerId),
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("invalid session settings: {0}")]
    InvalidSettings(String),
    #[error(transparent)]
    SendOptions(#[from] UnsupportedSendOptions),
    #[error(transparent)]
    Property(#[from] PropertyIndexOutOfRange),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Typed outcome of a join that did not produce a session
#[derive(Debug, Error)]
pub enum JoinError {
    #[error("the session is full")]
    SessionFull,
    #[error("the session is not accepting new gamers")]
    SessionNotJoinable,
    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),
    #[error("join denied by host: {0}")]
    Denied(String),
    #[error("no answer from host within {0:?}")]
    Timeout(Duration),
    #[error("host disconnected while joining: {0}")]
    HostDisconnected(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Session(#[from] SessionError),
}
