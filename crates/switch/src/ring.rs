//! Bounded circular packet buffer shared between one input session and the
//! output side.
//!
//! The ring owns the packet and metadata storage. The writer reserves a
//! contiguous span, receives into it and commits; the reader borrows the
//! readable span and releases it after sending. Spans never wrap within a
//! single operation.

use ts::{PacketMetadata, TsPacket};

/// Circular buffer of fixed-size packets plus parallel metadata.
///
/// Single producer (the input executor), single consumer (the output
/// executor, only while that input is current).
pub struct PacketRing {
    packets: Vec<TsPacket>,
    metadata: Vec<PacketMetadata>,
    /// Read index of the first filled packet.
    out_first: usize,
    /// Number of filled packets.
    out_count: usize,
    /// The output side currently holds a borrowed range starting at
    /// `out_first`.
    output_in_use: bool,
}

impl PacketRing {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must not be zero");
        Self {
            packets: vec![TsPacket::NULL; capacity],
            metadata: vec![PacketMetadata::default(); capacity],
            out_first: 0,
            out_count: 0,
            output_in_use: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.packets.len()
    }

    /// Number of filled packets.
    pub fn len(&self) -> usize {
        self.out_count
    }

    pub fn is_empty(&self) -> bool {
        self.out_count == 0
    }

    pub fn is_full(&self) -> bool {
        self.out_count >= self.capacity()
    }

    pub fn output_in_use(&self) -> bool {
        self.output_in_use
    }

    /// Return the next contiguous writable span, at most `max_packets`
    /// long. The span is bounded by the free space and by the end of the
    /// underlying storage: it never wraps.
    pub fn reserve_write(&mut self, max_packets: usize) -> (usize, usize) {
        let capacity = self.capacity();
        let first = (self.out_first + self.out_count) % capacity;
        let room = max_packets
            .min(capacity - self.out_count)
            .min(capacity - first);
        (first, room)
    }

    /// Store received packets in a previously reserved span and make them
    /// visible to the reader.
    pub fn commit_write(&mut self, first: usize, packets: &[TsPacket], metadata: &[PacketMetadata]) {
        let capacity = self.capacity();
        debug_assert_eq!(first, (self.out_first + self.out_count) % capacity);
        debug_assert_eq!(packets.len(), metadata.len());
        debug_assert!(self.out_count + packets.len() <= capacity);
        debug_assert!(first + packets.len() <= capacity);

        self.packets[first..first + packets.len()].copy_from_slice(packets);
        self.metadata[first..first + metadata.len()].copy_from_slice(metadata);
        self.out_count += packets.len();
    }

    /// Borrow the readable span for the output side.
    ///
    /// Returns copies of the packets in `[out_first, out_first + n)` where
    /// `n = min(len, capacity - out_first)`, or `None` when the ring is
    /// empty. While the borrow is held, the range may not be advanced or
    /// overwritten; call [`release_read`](Self::release_read) when done.
    pub fn reserve_read(&mut self) -> Option<(Vec<TsPacket>, Vec<PacketMetadata>)> {
        let readable = self.out_count.min(self.capacity() - self.out_first);
        if readable == 0 {
            return None;
        }
        self.output_in_use = true;
        let packets = self.packets[self.out_first..self.out_first + readable].to_vec();
        let metadata = self.metadata[self.out_first..self.out_first + readable].to_vec();
        Some((packets, metadata))
    }

    /// Release `count` packets of a previously borrowed range.
    pub fn release_read(&mut self, count: usize) {
        debug_assert!(count <= self.out_count);
        let count = count.min(self.out_count);
        self.out_first = (self.out_first + count) % self.capacity();
        self.out_count -= count;
        self.output_in_use = false;
    }

    /// Drop the oldest packets to make room for the writer, without
    /// handing them to a reader. Used when flow control is off. The drop
    /// is bounded by `max_packets` and by the end of the storage, and is
    /// refused entirely while the output holds a borrow.
    ///
    /// Returns the number of packets dropped.
    pub fn overwrite_oldest(&mut self, max_packets: usize) -> usize {
        if self.output_in_use {
            return 0;
        }
        let count = max_packets
            .min(self.capacity() - self.out_first)
            .min(self.out_count);
        self.out_first = (self.out_first + count) % self.capacity();
        self.out_count -= count;
        count
    }

    /// Reset the ring to its initial empty state.
    pub fn reset(&mut self) {
        self.out_first = 0;
        self.out_count = 0;
        self.output_in_use = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(tag: u8) -> TsPacket {
        let mut bytes = [0u8; ts::PACKET_SIZE];
        bytes[0] = ts::SYNC_BYTE;
        bytes[4] = tag;
        TsPacket::from_slice(&bytes).unwrap()
    }

    fn fill(ring: &mut PacketRing, tags: &[u8]) {
        for &tag in tags {
            let (first, room) = ring.reserve_write(1);
            assert!(room >= 1);
            ring.commit_write(first, &[packet(tag)], &[PacketMetadata::default()]);
        }
    }

    #[test]
    fn test_reserve_write_bounds() {
        let mut ring = PacketRing::new(8);
        let (first, room) = ring.reserve_write(100);
        assert_eq!((first, room), (0, 8));

        fill(&mut ring, &[1, 2, 3]);
        let (first, room) = ring.reserve_write(100);
        assert_eq!((first, room), (3, 5));
        assert_eq!(ring.len(), 3);
    }

    #[test]
    fn test_write_span_never_wraps() {
        let mut ring = PacketRing::new(8);
        fill(&mut ring, &[1, 2, 3, 4, 5, 6]);
        let (packets, _) = ring.reserve_read().unwrap();
        ring.release_read(packets.len());
        assert!(ring.is_empty());
        assert_eq!(ring.out_first, 6);

        // Free space is 8 but only 2 slots remain before the end of the
        // storage.
        let (first, room) = ring.reserve_write(100);
        assert_eq!((first, room), (6, 2));
        fill(&mut ring, &[7, 8]);
        let (first, room) = ring.reserve_write(100);
        assert_eq!((first, room), (0, 6));
    }

    #[test]
    fn test_read_release_cycle() {
        let mut ring = PacketRing::new(4);
        fill(&mut ring, &[1, 2, 3]);

        let (packets, metadata) = ring.reserve_read().unwrap();
        assert_eq!(packets.len(), 3);
        assert_eq!(metadata.len(), 3);
        assert_eq!(packets[0].as_bytes()[4], 1);
        assert!(ring.output_in_use());

        ring.release_read(3);
        assert!(!ring.output_in_use());
        assert!(ring.is_empty());
        assert!(ring.reserve_read().is_none());
    }

    #[test]
    fn test_overwrite_oldest() {
        let mut ring = PacketRing::new(4);
        fill(&mut ring, &[1, 2, 3, 4]);
        assert!(ring.is_full());

        assert_eq!(ring.overwrite_oldest(2), 2);
        assert_eq!(ring.len(), 2);
        let (packets, _) = ring.reserve_read().unwrap();
        assert_eq!(packets[0].as_bytes()[4], 3);
    }

    #[test]
    fn test_overwrite_refused_while_borrowed() {
        let mut ring = PacketRing::new(4);
        fill(&mut ring, &[1, 2, 3, 4]);

        let _ = ring.reserve_read().unwrap();
        assert_eq!(ring.overwrite_oldest(2), 0);
        assert_eq!(ring.len(), 4);

        ring.release_read(4);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_count_stays_in_bounds() {
        let mut ring = PacketRing::new(3);
        for round in 0..10 {
            fill(&mut ring, &[round as u8]);
            assert!(ring.len() <= ring.capacity());
            if round % 2 == 0 {
                let (packets, _) = ring.reserve_read().unwrap();
                ring.release_read(packets.len());
            }
        }
    }

    #[test]
    fn test_reset() {
        let mut ring = PacketRing::new(4);
        fill(&mut ring, &[1, 2]);
        ring.reset();
        assert!(ring.is_empty());
        let (first, room) = ring.reserve_write(100);
        assert_eq!((first, room), (0, 4));
    }
}
