//! Id-indexed tables of machines and gamers
//!
//! Ids are small, so each table is a fixed array of 255 slots plus a list that
//! remembers insertion order for iteration.

use crate::gamer::NetworkGamer;
use crate::machine::NetworkMachine;
use crate::transport::ConnectionId;
use shared::{GamerId, MachineId, MAX_ID};

/// Keys usable as a [`Registry`] slot index
pub trait SlotKey: Copy + Eq {
    fn slot(self) -> usize;
    fn from_slot(slot: usize) -> Option<Self>;
}

impl SlotKey for MachineId {
    fn slot(self) -> usize {
        self.index()
    }

    fn from_slot(slot: usize) -> Option<Self> {
        u8::try_from(slot).ok().and_then(MachineId::new)
    }
}

impl SlotKey for GamerId {
    fn slot(self) -> usize {
        self.index()
    }

    fn from_slot(slot: usize) -> Option<Self> {
        u8::try_from(slot).ok().and_then(GamerId::new)
    }
}

#[derive(Debug)]
pub struct Registry<Id, T> {
    slots: Vec<Option<T>>,
    order: Vec<Id>,
}

impl<Id: SlotKey, T> Default for Registry<Id, T> {
    fn default() -> Self {
        Self {
            slots: (0..=MAX_ID).map(|_| None).collect(),
            order: Vec::new(),
        }
    }
}

impl<Id: SlotKey, T> Registry<Id, T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: Id) -> bool {
        self.slots[id.slot()].is_some()
    }

    pub fn get(&self, id: Id) -> Option<&T> {
        self.slots[id.slot()].as_ref()
    }

    pub fn get_mut(&mut self, id: Id) -> Option<&mut T> {
        self.slots[id.slot()].as_mut()
    }

    /// Returns false without touching anything when `id` is taken.
    pub(crate) fn insert(&mut self, id: Id, value: T) -> bool {
        let slot = &mut self.slots[id.slot()];
        if slot.is_some() {
            return false;
        }
        *slot = Some(value);
        self.order.push(id);
        true
    }

    pub(crate) fn remove(&mut self, id: Id) -> Option<T> {
        let value = self.slots[id.slot()].take()?;
        self.order.retain(|&other| other != id);
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Ids in insertion order
    pub fn ids(&self) -> impl Iterator<Item = Id> + '_ {
        self.order.iter().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        self.order
            .iter()
            .filter_map(move |id| self.slots[id.slot()].as_ref())
    }

    /// Same order as [`Registry::iter`]
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> + '_ {
        let mut by_slot: Vec<Option<&mut T>> = self.slots.iter_mut().map(Option::as_mut).collect();
        self.order
            .iter()
            .filter_map(move |id| by_slot[id.slot()].take())
    }

    /// Lowest id that is neither occupied nor `excluded`.
    pub(crate) fn first_free(&self, excluded: impl Fn(Id) -> bool) -> Option<Id> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_none())
            .filter_map(|(index, _)| Id::from_slot(index))
            .find(|&id| !excluded(id))
    }
}

pub type MachineRegistry = Registry<MachineId, NetworkMachine>;
pub type GamerRegistry = Registry<GamerId, NetworkGamer>;

impl Registry<MachineId, NetworkMachine> {
    pub fn by_connection(&self, connection: ConnectionId) -> Option<MachineId> {
        self.iter()
            .find(|machine| machine.connection() == Some(connection))
            .map(NetworkMachine::id)
    }
}

impl Registry<GamerId, NetworkGamer> {
    pub fn private_count(&self) -> u8 {
        self.count_where(NetworkGamer::is_private_slot)
    }

    pub fn public_count(&self) -> u8 {
        self.count_where(|gamer| !gamer.is_private_slot())
    }

    pub fn owned_by(&self, machine: MachineId) -> Vec<GamerId> {
        self.iter()
            .filter(|gamer| gamer.machine() == machine)
            .map(NetworkGamer::id)
            .collect()
    }

    fn count_where(&self, predicate: impl Fn(&NetworkGamer) -> bool) -> u8 {
        // At most 255 gamers fit, so the count always fits a u8
        self.iter().filter(|&gamer| predicate(gamer)).count() as u8
    }
}

/// Slot accounting for one session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotUsage {
    pub max_gamers: u8,
    pub private_slots: u8,
    pub private_used: u8,
    pub public_used: u8,
}

impl SlotUsage {
    pub fn public_slots(&self) -> u8 {
        self.max_gamers.saturating_sub(self.private_slots)
    }

    pub fn open_private(&self) -> u8 {
        self.private_slots.saturating_sub(self.private_used)
    }

    pub fn open_public(&self) -> u8 {
        self.public_slots().saturating_sub(self.public_used)
    }
}
