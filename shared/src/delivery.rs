use serde::{Deserialize, Serialize};
use std::ops::BitOr;
use thiserror::Error;

/// Reliability/ordering class understood by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DeliveryMethod {
    Unreliable = 0,
    UnreliableSequenced = 1,
    ReliableUnordered = 2,
    ReliableSequenced = 3,
    ReliableOrdered = 4,
}

impl DeliveryMethod {
    pub fn is_reliable(self) -> bool {
        matches!(
            self,
            DeliveryMethod::ReliableUnordered
                | DeliveryMethod::ReliableSequenced
                | DeliveryMethod::ReliableOrdered
        )
    }

    /// Sequenced and ordered classes both preserve per-sender order of what arrives.
    pub fn is_ordered(self) -> bool {
        matches!(
            self,
            DeliveryMethod::UnreliableSequenced
                | DeliveryMethod::ReliableSequenced
                | DeliveryMethod::ReliableOrdered
        )
    }

    pub fn to_wire(self) -> u8 {
        self as u8
    }

    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(DeliveryMethod::Unreliable),
            1 => Some(DeliveryMethod::UnreliableSequenced),
            2 => Some(DeliveryMethod::ReliableUnordered),
            3 => Some(DeliveryMethod::ReliableSequenced),
            4 => Some(DeliveryMethod::ReliableOrdered),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("unsupported send data options 0x{0:02x}")]
pub struct UnsupportedSendOptions(pub u8);

/// Application-facing reliability flags for `send_data`.
///
/// `RELIABLE` and `IN_ORDER` combine into `RELIABLE_IN_ORDER`. `CHAT` may be
/// used alone or together with `IN_ORDER` only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SendDataOptions(u8);

impl SendDataOptions {
    pub const NONE: Self = Self(0);
    pub const RELIABLE: Self = Self(1);
    pub const IN_ORDER: Self = Self(2);
    pub const RELIABLE_IN_ORDER: Self = Self(3);
    pub const CHAT: Self = Self(4);

    const KNOWN_BITS: u8 = 0b111;

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Maps the flags onto the transport delivery class.
    pub fn delivery_method(self) -> Result<DeliveryMethod, UnsupportedSendOptions> {
        if self.0 & !Self::KNOWN_BITS != 0 {
            return Err(UnsupportedSendOptions(self.0));
        }

        let method = match self {
            Self::NONE => DeliveryMethod::Unreliable,
            Self::IN_ORDER => DeliveryMethod::UnreliableSequenced,
            Self::RELIABLE | Self::CHAT => DeliveryMethod::ReliableUnordered,
            Self::RELIABLE_IN_ORDER => DeliveryMethod::ReliableOrdered,
            _ if self == Self::CHAT | Self::IN_ORDER => DeliveryMethod::ReliableOrdered,
            _ => return Err(UnsupportedSendOptions(self.0)),
        };
        Ok(method)
    }
}

impl BitOr for SendDataOptions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_mapping() {
        let cases = [
            (SendDataOptions::NONE, DeliveryMethod::Unreliable),
            (SendDataOptions::IN_ORDER, DeliveryMethod::UnreliableSequenced),
            (SendDataOptions::RELIABLE, DeliveryMethod::ReliableUnordered),
            (
                SendDataOptions::RELIABLE_IN_ORDER,
                DeliveryMethod::ReliableOrdered,
            ),
            (SendDataOptions::CHAT, DeliveryMethod::ReliableUnordered),
            (
                SendDataOptions::CHAT | SendDataOptions::IN_ORDER,
                DeliveryMethod::ReliableOrdered,
            ),
        ];

        for (options, expected) in cases {
            assert_eq!(options.delivery_method(), Ok(expected), "{:?}", options);
        }
    }

    #[test]
    fn test_unknown_bits_are_rejected() {
        let options = SendDataOptions::from_bits(0x08);
        assert_eq!(
            options.delivery_method(),
            Err(UnsupportedSendOptions(0x08))
        );
    }

    #[test]
    fn test_chat_cannot_be_combined_with_reliable() {
        for options in [
            SendDataOptions::CHAT | SendDataOptions::RELIABLE,
            SendDataOptions::CHAT | SendDataOptions::RELIABLE_IN_ORDER,
        ] {
            assert_eq!(
                options.delivery_method(),
                Err(UnsupportedSendOptions(options.bits()))
            );
        }
    }

    #[test]
    fn test_ordered_classes() {
        assert!(DeliveryMethod::ReliableOrdered.is_ordered());
        assert!(DeliveryMethod::UnreliableSequenced.is_ordered());
        assert!(!DeliveryMethod::ReliableUnordered.is_ordered());
        assert!(!DeliveryMethod::Unreliable.is_reliable());
    }

    #[test]
    fn test_wire_values() {
        for value in 0..=4 {
            let method = DeliveryMethod::from_wire(value).unwrap();
            assert_eq!(method.to_wire(), value);
        }
        assert!(DeliveryMethod::from_wire(5).is_none());
    }
}
