use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Wire value meaning "every machine" or "every gamer".
pub const BROADCAST_ID: u8 = 255;

/// Largest id that can be handed to a machine or gamer.
pub const MAX_ID: u8 = BROADCAST_ID - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("id {0} is reserved for broadcast")]
pub struct InvalidId(pub u8);

macro_rules! small_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "u8", into = "u8")]
        pub struct $name(u8);

        impl $name {
            /// Lowest assignable id
            pub const FIRST: Self = Self(0);

            pub const fn new(value: u8) -> Option<Self> {
                if value <= MAX_ID {
                    Some(Self(value))
                } else {
                    None
                }
            }

            pub const fn get(self) -> u8 {
                self.0
            }

            pub const fn index(self) -> usize {
                self.0 as usize
            }

            /// Every assignable id, ascending.
            pub fn all() -> impl Iterator<Item = Self> {
                (0..=MAX_ID).map(Self)
            }
        }

        impl TryFrom<u8> for $name {
            type Error = InvalidId;

            fn try_from(value: u8) -> Result<Self, InvalidId> {
                Self::new(value).ok_or(InvalidId(value))
            }
        }

        impl From<$name> for u8 {
            fn from(id: $name) -> u8 {
                id.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

small_id!(
    /// Identifies one participating device within a session
    MachineId
);

small_id!(
    /// Identifies one player within a session
    GamerId
);

/// Destination of a message: everybody, or one specific id.
///
/// The broadcast sentinel only exists on the wire; inside the engine a
/// destination is always one of these two variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Address<Id> {
    All,
    To(Id),
}

impl<Id> Address<Id>
where
    Id: Copy + PartialEq + Into<u8> + TryFrom<u8>,
{
    pub fn to_wire(self) -> u8 {
        match self {
            Address::All => BROADCAST_ID,
            Address::To(id) => id.into(),
        }
    }

    pub fn from_wire(value: u8) -> Self {
        match Id::try_from(value) {
            Ok(id) => Address::To(id),
            Err(_) => Address::All,
        }
    }

    pub fn is_all(self) -> bool {
        matches!(self, Address::All)
    }

    /// True when `id` is the explicit destination (a broadcast is not).
    pub fn is_to(self, id: Id) -> bool {
        matches!(self, Address::To(target) if target == id)
    }
}

impl<Id> From<Option<Id>> for Address<Id> {
    fn from(id: Option<Id>) -> Self {
        match id {
            Some(id) => Address::To(id),
            None => Address::All,
        }
    }
}

/// Globally unique identifier a host advertises its session under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionGuid(pub u128);

impl SessionGuid {
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl fmt::Display for SessionGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_id_is_not_assignable() {
        assert!(MachineId::new(BROADCAST_ID).is_none());
        assert!(GamerId::new(MAX_ID).is_some());
        assert_eq!(GamerId::try_from(255), Err(InvalidId(255)));
    }

    #[test]
    fn test_address_wire_mapping() {
        let all: Address<MachineId> = Address::from_wire(255);
        assert_eq!(all, Address::All);
        assert_eq!(all.to_wire(), 255);

        let one: Address<MachineId> = Address::from_wire(7);
        assert_eq!(one, Address::To(MachineId::new(7).unwrap()));
        assert_eq!(one.to_wire(), 7);
        assert!(one.is_to(MachineId::new(7).unwrap()));
        assert!(!all.is_to(MachineId::new(7).unwrap()));
    }

    #[test]
    fn test_id_iteration_covers_whole_space() {
        let ids: Vec<GamerId> = GamerId::all().collect();
        assert_eq!(ids.len(), 255);
        assert_eq!(ids[0].get(), 0);
        assert_eq!(ids[254].get(), 254);
    }

    #[test]
    fn test_id_serialization_rejects_sentinel() {
        let bytes = bincode::serialize(&255u8).unwrap();
        assert!(bincode::deserialize::<GamerId>(&bytes).is_err());

        let bytes = bincode::serialize(&GamerId::new(3).unwrap()).unwrap();
        assert_eq!(bytes, vec![3]);
    }

    #[test]
    fn test_guid_display_is_fixed_width() {
        assert_eq!(SessionGuid(1).to_string().len(), 32);
        assert_ne!(SessionGuid::random(), SessionGuid::random());
    }
}
