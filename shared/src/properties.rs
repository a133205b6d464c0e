use serde::de::{self, SeqAccess, Visitor};
use serde::ser::SerializeTuple;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thiserror::Error;

/// Number of match-making slots every session carries.
pub const SESSION_PROPERTY_COUNT: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("session property index {0} out of range")]
pub struct PropertyIndexOutOfRange(pub usize);

/// Match-making filter values attached to a session.
///
/// On the wire: an `i32` slot count followed by one `(bool, i32)` pair per
/// slot. A count other than [`SESSION_PROPERTY_COUNT`] fails to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct NetworkSessionProperties {
    slots: [Option<i32>; SESSION_PROPERTY_COUNT],
}

impl NetworkSessionProperties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, index: usize) -> Option<i32> {
        self.slots.get(index).copied().flatten()
    }

    pub fn set(&mut self, index: usize, value: Option<i32>) -> Result<(), PropertyIndexOutOfRange> {
        let slot = self
            .slots
            .get_mut(index)
            .ok_or(PropertyIndexOutOfRange(index))?;
        *slot = value;
        Ok(())
    }

    pub fn with(mut self, index: usize, value: i32) -> Result<Self, PropertyIndexOutOfRange> {
        self.set(index, Some(value))?;
        Ok(self)
    }

    pub fn iter(&self) -> impl Iterator<Item = Option<i32>> + '_ {
        self.slots.iter().copied()
    }

    /// Search rule: an unset query slot matches anything, a set one must be equal.
    pub fn matches(&self, query: &NetworkSessionProperties) -> bool {
        self.slots
            .iter()
            .zip(query.slots.iter())
            .all(|(ours, wanted)| wanted.is_none() || ours == wanted)
    }
}

impl Serialize for NetworkSessionProperties {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(SESSION_PROPERTY_COUNT + 1)?;
        tuple.serialize_element(&(SESSION_PROPERTY_COUNT as i32))?;
        for slot in &self.slots {
            tuple.serialize_element(&(slot.is_some(), slot.unwrap_or_default()))?;
        }
        tuple.end()
    }
}

impl<'de> Deserialize<'de> for NetworkSessionProperties {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct PropertiesVisitor;

        impl<'de> Visitor<'de> for PropertiesVisitor {
            type Value = NetworkSessionProperties;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(
                    f,
                    "a slot count followed by {} session property slots",
                    SESSION_PROPERTY_COUNT
                )
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let count: i32 = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;
                if count != SESSION_PROPERTY_COUNT as i32 {
                    return Err(de::Error::custom(format!(
                        "session property count mismatch: expected {}, got {}",
                        SESSION_PROPERTY_COUNT, count
                    )));
                }

                let mut properties = NetworkSessionProperties::default();
                for (index, slot) in properties.slots.iter_mut().enumerate() {
                    let (set, value): (bool, i32) = seq
                        .next_element()?
                        .ok_or_else(|| de::Error::invalid_length(index + 1, &self))?;
                    *slot = set.then_some(value);
                }
                Ok(properties)
            }
        }

        deserializer.deserialize_tuple(SESSION_PROPERTY_COUNT + 1, PropertiesVisitor)
    }
}
