//! Per-local-gamer packet queues
//!
//! Inbound packets wait here until the application reads them; outbound
//! packets are staged here until the next `update` flushes them. Packets from
//! a sender whose `GamerJoined` has not arrived yet are parked per sender and
//! released, ordered ones first, once the sender becomes known.

use crate::error::ProtocolViolation;
use crate::pool::{Packet, PacketPool};
use log::warn;
use shared::{Address, DeliveryMethod, GamerId, MachineId};
use std::collections::VecDeque;

#[derive(Debug)]
pub(crate) struct InboundPacket {
    pub sender: GamerId,
    pub packet: Packet,
}

#[derive(Debug)]
pub(crate) struct OutboundPacket {
    pub recipient: Address<GamerId>,
    pub method: DeliveryMethod,
    pub packet: Packet,
}

#[derive(Debug)]
struct DelayedPacket {
    origin: MachineId,
    packet: Packet,
}

#[derive(Debug, Default)]
struct PendingSender {
    ordered: VecDeque<DelayedPacket>,
    unordered: VecDeque<DelayedPacket>,
}

impl PendingSender {
    fn len(&self) -> usize {
        self.ordered.len() + self.unordered.len()
    }
}

#[derive(Debug)]
pub struct LocalGamerQueues {
    inbound: VecDeque<InboundPacket>,
    outbound: Vec<OutboundPacket>,
    // Indexed by sender gamer id
    delayed: Vec<Option<PendingSender>>,
}

impl Default for LocalGamerQueues {
    fn default() -> Self {
        Self {
            inbound: VecDeque::new(),
            outbound: Vec::new(),
            delayed: GamerId::all().map(|_| None).collect(),
        }
    }
}

impl LocalGamerQueues {
    pub fn inbound_len(&self) -> usize {
        self.inbound.len()
    }

    pub fn outbound_len(&self) -> usize {
        self.outbound.len()
    }

    pub fn delayed_len(&self, sender: GamerId) -> usize {
        self.delayed[sender.index()]
            .as_ref()
            .map_or(0, PendingSender::len)
    }

    pub fn delayed_total(&self) -> usize {
        self.delayed.iter().flatten().map(PendingSender::len).sum()
    }

    /// Queues a received packet for the application.
    ///
    /// Packets from an unknown sender, and packets from a known sender that
    /// still has parked packets, are parked so they never overtake each other.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn deliver(
        &mut self,
        pool: &mut PacketPool,
        sender: GamerId,
        origin: MachineId,
        sender_known: bool,
        method: DeliveryMethod,
        packet: Packet,
        max_delayed: usize,
    ) -> Result<(), ProtocolViolation> {
        let parked = self.delayed_len(sender);
        if sender_known && parked == 0 {
            self.inbound.push_back(InboundPacket { sender, packet });
            return Ok(());
        }
        if parked >= max_delayed {
            pool.recycle(packet);
            return Err(ProtocolViolation::DelayedBufferFull(sender));
        }

        let pending = self.delayed[sender.index()].get_or_insert_with(PendingSender::default);
        let delayed = DelayedPacket { origin, packet };
        if method.is_ordered() {
            pending.ordered.push_back(delayed);
        } else {
            pending.unordered.push_back(delayed);
        }
        Ok(())
    }

    /// Moves everything parked for `sender` to the inbound queue.
    ///
    /// Packets that did not come from `owner` were forged before the sender was
    /// known and are dropped.
    pub(crate) fn release(&mut self, pool: &mut PacketPool, sender: GamerId, owner: MachineId) -> usize {
        let Some(pending) = self.delayed[sender.index()].take() else {
            return 0;
        };

        let mut released = 0;
        for delayed in pending.ordered.into_iter().chain(pending.unordered) {
            if delayed.origin == owner {
                self.inbound.push_back(InboundPacket {
                    sender,
                    packet: delayed.packet,
                });
                released += 1;
            } else {
                warn!(
                    "Dropping parked packet for gamer {} sent by machine {} instead of {}",
                    sender, delayed.origin, owner
                );
                pool.recycle(delayed.packet);
            }
        }
        released
    }

    pub(crate) fn pending_senders(&self) -> Vec<GamerId> {
        self.delayed
            .iter()
            .enumerate()
            .filter(|(_, pending)| pending.is_some())
            .filter_map(|(index, _)| u8::try_from(index).ok().and_then(GamerId::new))
            .collect()
    }

    pub(crate) fn discard(&mut self, pool: &mut PacketPool, sender: GamerId) {
        if let Some(pending) = self.delayed[sender.index()].take() {
            for delayed in pending.ordered.into_iter().chain(pending.unordered) {
                pool.recycle(delayed.packet);
            }
        }
    }

    pub(crate) fn pop_inbound(&mut self) -> Option<InboundPacket> {
        self.inbound.pop_front()
    }

    pub(crate) fn push_front_inbound(&mut self, packet: InboundPacket) {
        self.inbound.push_front(packet);
    }

    pub(crate) fn stage(&mut self, packet: OutboundPacket) {
        self.outbound.push(packet);
    }

    pub(crate) fn take_outbound(&mut self) -> Vec<OutboundPacket> {
        std::mem::take(&mut self.outbound)
    }

    /// Returns every held packet to the pool.
    pub(crate) fn drain_into(&mut self, pool: &mut PacketPool) {
        for inbound in self.inbound.drain(..) {
            pool.recycle(inbound.packet);
        }
        for outbound in self.outbound.drain(..) {
            pool.recycle(outbound.packet);
        }
        for pending in self.delayed.iter_mut().filter_map(Option::take) {
            for delayed in pending.ordered.into_iter().chain(pending.unordered) {
                pool.recycle(delayed.packet);
            }
        }
    }
}
