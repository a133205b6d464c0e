//! Session wire format
//!
//! Every session message starts with a three byte header:
//!
//! | byte | meaning                                   |
//! |------|-------------------------------------------|
//! | 0    | [`MessageType`]                           |
//! | 1    | recipient machine id, 255 for everybody   |
//! | 2    | origin machine id                         |
//!
//! Control payloads follow as bincode. The `User` payload is framed by hand so
//! decoding can borrow the application bytes straight out of the receive
//! buffer:
//!
//! | bytes | meaning                                 |
//! |-------|-----------------------------------------|
//! | 0     | sender gamer id                         |
//! | 1     | recipient gamer id, 255 for everybody   |
//! | 2     | [`DeliveryMethod`] selector             |
//! | 3..7  | payload length, u32 little endian       |
//! | 7..   | payload                                 |

use crate::error::CodecError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use shared::{Address, DeliveryMethod, GamerId, MachineId};

pub const HEADER_LEN: usize = 3;

const USER_HEADER_LEN: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    MachineConnected = 0,
    MachineDisconnected = 1,
    GamerIdRequest = 2,
    GamerIdResponse = 3,
    GamerJoined = 4,
    GamerLeft = 5,
    GamerStateChanged = 6,
    ResetReady = 7,
    StartGame = 8,
    EndGame = 9,
    User = 10,
}

impl MessageType {
    /// Types only the host may originate
    pub fn is_host_only(self) -> bool {
        matches!(
            self,
            MessageType::MachineConnected
                | MessageType::MachineDisconnected
                | MessageType::GamerIdResponse
                | MessageType::ResetReady
                | MessageType::StartGame
                | MessageType::EndGame
        )
    }
}

impl TryFrom<u8> for MessageType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, CodecError> {
        let kind = match value {
            0 => MessageType::MachineConnected,
            1 => MessageType::MachineDisconnected,
            2 => MessageType::GamerIdRequest,
            3 => MessageType::GamerIdResponse,
            4 => MessageType::GamerJoined,
            5 => MessageType::GamerLeft,
            6 => MessageType::GamerStateChanged,
            7 => MessageType::ResetReady,
            8 => MessageType::StartGame,
            9 => MessageType::EndGame,
            10 => MessageType::User,
            other => return Err(CodecError::UnknownType(other)),
        };
        Ok(kind)
    }
}

/// Everything other machines need to know about a gamer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GamerInfo {
    pub id: GamerId,
    pub gamertag: String,
    pub display_name: String,
    pub is_private_slot: bool,
    pub is_ready: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GamerStateUpdate {
    pub id: GamerId,
    pub gamertag: String,
    pub display_name: String,
    pub is_ready: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GamerIdGrant {
    pub id: GamerId,
    pub private_slot: bool,
}

/// Application payload, borrowed from wherever it was decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserData<'a> {
    pub sender: GamerId,
    pub recipient: Address<GamerId>,
    pub method: DeliveryMethod,
    pub payload: &'a [u8],
}

impl<'a> UserData<'a> {
    fn encode(&self, out: &mut Vec<u8>) -> Result<(), CodecError> {
        let length = u32::try_from(self.payload.len())
            .map_err(|_| CodecError::PayloadTooLarge(self.payload.len()))?;
        out.push(self.sender.get());
        out.push(self.recipient.to_wire());
        out.push(self.method.to_wire());
        out.extend_from_slice(&length.to_le_bytes());
        out.extend_from_slice(self.payload);
        Ok(())
    }

    fn decode(bytes: &'a [u8]) -> Result<Self, CodecError> {
        let malformed = |reason: String| CodecError::Payload {
            kind: MessageType::User,
            reason,
        };

        if bytes.len() < USER_HEADER_LEN {
            return Err(malformed(format!("{} byte user header", bytes.len())));
        }
        let sender = GamerId::new(bytes[0])
            .ok_or_else(|| malformed("sender cannot be the broadcast id".to_string()))?;
        let recipient = Address::from_wire(bytes[1]);
        let method =
            DeliveryMethod::from_wire(bytes[2]).ok_or(CodecError::UnknownDeliveryMethod(bytes[2]))?;
        let length = u32::from_le_bytes([bytes[3], bytes[4], bytes[5], bytes[6]]) as usize;

        let available = bytes.len() - USER_HEADER_LEN;
        let payload = USER_HEADER_LEN
            .checked_add(length)
            .and_then(|end| bytes.get(USER_HEADER_LEN..end))
            .ok_or_else(|| malformed(format!("declares {} bytes, {} present", length, available)))?;

        Ok(Self {
            sender,
            recipient,
            method,
            payload,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message<'a> {
    MachineConnected { machine: MachineId },
    MachineDisconnected { machine: MachineId },
    GamerIdRequest { private_slot: bool },
    /// `None` when the host has no slot left
    GamerIdResponse { granted: Option<GamerIdGrant> },
    GamerJoined(GamerInfo),
    GamerLeft { gamer: GamerId },
    GamerStateChanged(GamerStateUpdate),
    ResetReady,
    StartGame,
    EndGame,
    User(UserData<'a>),
}

impl Message<'_> {
    pub fn kind(&self) -> MessageType {
        match self {
            Message::MachineConnected { .. } => MessageType::MachineConnected,
            Message::MachineDisconnected { .. } => MessageType::MachineDisconnected,
            Message::GamerIdRequest { .. } => MessageType::GamerIdRequest,
            Message::GamerIdResponse { .. } => MessageType::GamerIdResponse,
            Message::GamerJoined(_) => MessageType::GamerJoined,
            Message::GamerLeft { .. } => MessageType::GamerLeft,
            Message::GamerStateChanged(_) => MessageType::GamerStateChanged,
            Message::ResetReady => MessageType::ResetReady,
            Message::StartGame => MessageType::StartGame,
            Message::EndGame => MessageType::EndGame,
            Message::User(_) => MessageType::User,
        }
    }
}

/// A decoded session message with its routing header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope<'a> {
    pub recipient: Address<MachineId>,
    pub origin: MachineId,
    pub message: Message<'a>,
}

impl<'a> Envelope<'a> {
    pub fn new(origin: MachineId, recipient: Address<MachineId>, message: Message<'a>) -> Self {
        Self {
            recipient,
            origin,
            message,
        }
    }

    pub fn kind(&self) -> MessageType {
        self.message.kind()
    }

    /// Writes the encoded message into `out`, replacing its contents.
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<(), CodecError> {
        out.clear();
        out.push(self.kind() as u8);
        out.push(self.recipient.to_wire());
        out.push(self.origin.get());

        match &self.message {
            Message::MachineConnected { machine } | Message::MachineDisconnected { machine } => {
                bincode::serialize_into(&mut *out, machine)?
            }
            Message::GamerIdRequest { private_slot } => bincode::serialize_into(&mut *out, private_slot)?,
            Message::GamerIdResponse { granted } => bincode::serialize_into(&mut *out, granted)?,
            Message::GamerJoined(info) => bincode::serialize_into(&mut *out, info)?,
            Message::GamerLeft { gamer } => bincode::serialize_into(&mut *out, gamer)?,
            Message::GamerStateChanged(update) => bincode::serialize_into(&mut *out, update)?,
            Message::ResetReady | Message::StartGame | Message::EndGame => {}
            Message::User(data) => data.encode(out)?,
        }
        Ok(())
    }

    pub fn decode(bytes: &'a [u8]) -> Result<Self, CodecError> {
        if bytes.len() < HEADER_LEN {
            return Err(CodecError::TooShort(bytes.len()));
        }
        let kind = MessageType::try_from(bytes[0])?;
        let recipient = Address::from_wire(bytes[1]);
        let origin = MachineId::new(bytes[2]).ok_or(CodecError::BroadcastOrigin)?;
        let payload = &bytes[HEADER_LEN..];

        let message = match kind {
            MessageType::MachineConnected => Message::MachineConnected {
                machine: decode_payload(kind, payload)?,
            },
            MessageType::MachineDisconnected => Message::MachineDisconnected {
                machine: decode_payload(kind, payload)?,
            },
            MessageType::GamerIdRequest => Message::GamerIdRequest {
                private_slot: decode_payload(kind, payload)?,
            },
            MessageType::GamerIdResponse => Message::GamerIdResponse {
                granted: decode_payload(kind, payload)?,
            },
            MessageType::GamerJoined => Message::GamerJoined(decode_payload(kind, payload)?),
            MessageType::GamerLeft => Message::GamerLeft {
                gamer: decode_payload(kind, payload)?,
            },
            MessageType::GamerStateChanged => Message::GamerStateChanged(decode_payload(kind, payload)?),
            MessageType::ResetReady => Message::ResetReady,
            MessageType::StartGame => Message::StartGame,
            MessageType::EndGame => Message::EndGame,
            MessageType::User => Message::User(UserData::decode(payload)?),
        };

        Ok(Self {
            recipient,
            origin,
            message,
        })
    }
}

fn decode_payload<T: DeserializeOwned>(kind: MessageType, payload: &[u8]) -> Result<T, CodecError> {
    bincode::deserialize(payload).map_err(|e| CodecError::Payload {
        kind,
        reason: e.to_string(),
    })
}
