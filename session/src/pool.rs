//! Recycled byte buffers for the send/receive hot path
//!
//! Application packets are drawn from a small set of sizes, so the pool keeps
//! every recycled buffer and hands it back out for the next request of the
//! exact same length instead of allocating.

/// Fill value written over a packet when it is recycled.
///
/// Reading this pattern back out of a live packet means it was used after
/// being returned to the pool.
pub const RECYCLED_FILL: u8 = 0xCD;

/// A fixed-length byte buffer owned by exactly one holder at a time.
///
/// Not `Clone`: the only way to give a packet back is [`PacketPool::recycle`],
/// which consumes it.
#[derive(Debug, PartialEq, Eq)]
pub struct Packet {
    data: Box<[u8]>,
}

impl Packet {
    fn with_length(length: usize) -> Self {
        Self {
            data: vec![RECYCLED_FILL; length].into_boxed_slice(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

#[derive(Debug, Default)]
pub struct PacketPool {
    free: Vec<Packet>,
    allocated: usize,
}

impl PacketPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a packet of exactly `length` bytes, reusing the most recently
    /// recycled one of that size if there is one.
    pub fn get(&mut self, length: usize) -> Packet {
        match self.free.iter().rposition(|packet| packet.len() == length) {
            Some(index) => self.free.remove(index),
            None => {
                self.allocated += 1;
                Packet::with_length(length)
            }
        }
    }

    pub fn get_and_fill_with(&mut self, bytes: &[u8]) -> Packet {
        let mut packet = self.get(bytes.len());
        packet.as_mut_slice().copy_from_slice(bytes);
        packet
    }

    pub fn recycle(&mut self, mut packet: Packet) {
        packet.as_mut_slice().fill(RECYCLED_FILL);
        self.free.push(packet);
    }

    /// Packets currently waiting in the free list
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Packets ever created by this pool
    pub fn allocated(&self) -> usize {
        self.allocated
    }
}
