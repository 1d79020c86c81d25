use std::time::Duration;

use thiserror::Error;

/// Bytes of the per-record tag: timestamp (i64 microseconds), captured
/// length (u32) and wire length (u32).
pub const RECORD_HEADER_LEN: usize = 16;

/// Default capacity of one sequence's record region.
pub const DEFAULT_SEQUENCE_CAPACITY: usize = 1 << 20;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("packet does not fit in the remaining sequence capacity")]
pub struct SequenceFull;

fn duration_to_usec(d: Duration) -> i64 {
    d.as_micros() as i64
}

/// A contiguous, fixed-capacity run of packets with per-packet timestamps
/// and a post-sequence delay.
///
/// Records are stored back to back as `(ts_usec, caplen, len, bytes)` in
/// emission order. The capacity is fixed at allocation; appending past it
/// fails cleanly and the caller allocates a successor sequence.
#[derive(Debug)]
pub struct PacketSequence {
    buf: Vec<u8>,
    packets: u64,
    bytes: u64,
    usec_duration: i64,
    usec_delay: i64,
    repeat_count: u64,
    repeat_size: u64,
    last_ts_usec: Option<i64>,
}

impl PacketSequence {
    pub fn new() -> PacketSequence {
        PacketSequence::with_capacity(DEFAULT_SEQUENCE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> PacketSequence {
        PacketSequence {
            buf: Vec::with_capacity(capacity),
            packets: 0,
            bytes: 0,
            usec_duration: 0,
            usec_delay: 0,
            repeat_count: 1,
            repeat_size: 1,
            last_ts_usec: None,
        }
    }

    pub fn has_free_space(&self, needed: usize) -> bool {
        self.buf.capacity() - self.buf.len() >= needed
    }

    /// Append one record. `caplen` is `data.len()`; `wire_len` is the
    /// original on-the-wire length.
    pub fn append_packet(
        &mut self,
        ts_usec: i64,
        data: &[u8],
        wire_len: u32,
    ) -> Result<(), SequenceFull> {
        let needed = RECORD_HEADER_LEN + data.len();
        if !self.has_free_space(needed) {
            return Err(SequenceFull);
        }
        if let Some(last) = self.last_ts_usec {
            self.usec_duration += ts_usec - last;
        }
        self.buf.extend_from_slice(&ts_usec.to_le_bytes());
        self.buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(&wire_len.to_le_bytes());
        self.buf.extend_from_slice(data);
        self.packets += 1;
        self.bytes += wire_len as u64;
        self.last_ts_usec = Some(ts_usec);
        Ok(())
    }

    pub fn iter(&self) -> SequenceIter<'_> {
        SequenceIter {
            buf: &self.buf,
            offset: 0,
        }
    }

    pub fn packets(&self) -> u64 {
        self.packets
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Wall-clock cost of one pass over the records, excluding the trailing
    /// delay.
    pub fn usec_duration(&self) -> i64 {
        self.usec_duration
    }

    pub fn usec_delay(&self) -> i64 {
        self.usec_delay
    }

    pub fn repeat_count(&self) -> u64 {
        self.repeat_count
    }

    pub fn repeat_size(&self) -> u64 {
        self.repeat_size
    }

    fn last_ts_usec(&self) -> Option<i64> {
        self.last_ts_usec
    }
}

impl Default for PacketSequence {
    fn default() -> Self {
        PacketSequence::new()
    }
}

/// One record of a sequence, borrowed from its record region.
#[derive(Debug, Clone, Copy)]
pub struct SequenceRecord<'a> {
    pub ts_usec: i64,
    pub caplen: u32,
    pub len: u32,
    pub data: &'a [u8],
}

pub struct SequenceIter<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> Iterator for SequenceIter<'a> {
    type Item = SequenceRecord<'a>;

    fn next(&mut self) -> Option<SequenceRecord<'a>> {
        if self.offset >= self.buf.len() {
            return None;
        }
        let hdr = &self.buf[self.offset..self.offset + RECORD_HEADER_LEN];
        let ts_usec = i64::from_le_bytes(hdr[0..8].try_into().unwrap());
        let caplen = u32::from_le_bytes(hdr[8..12].try_into().unwrap());
        let len = u32::from_le_bytes(hdr[12..16].try_into().unwrap());
        let start = self.offset + RECORD_HEADER_LEN;
        let end = start + caplen as usize;
        self.offset = end;
        Some(SequenceRecord {
            ts_usec,
            caplen,
            len,
            data: &self.buf[start..end],
        })
    }
}

/// The transmit packet list: ordered sequences plus the bookkeeping used
/// while the upstream producer appends packets, and the global loop state.
///
/// A repeat block is opened by [`PacketList::loop_next_packet_set`] and
/// closes automatically once the announced number of packets has been
/// appended; the first sequence of the block then carries the block length
/// in `repeat_size` and the block's trailing delay moves onto the last
/// sequence.
#[derive(Debug)]
pub struct PacketList {
    seqs: Vec<PacketSequence>,
    seq_capacity: usize,
    current: Option<usize>,
    repeat_start: Option<usize>,
    pending_repeat_size: u64,
    packet_count: u64,
    return_to_idx: Option<usize>,
    loop_delay_usec: i64,
}

impl PacketList {
    pub fn new() -> PacketList {
        PacketList::with_sequence_capacity(DEFAULT_SEQUENCE_CAPACITY)
    }

    pub fn with_sequence_capacity(seq_capacity: usize) -> PacketList {
        PacketList {
            seqs: Vec::new(),
            seq_capacity,
            current: None,
            repeat_start: None,
            pending_repeat_size: 0,
            packet_count: 0,
            return_to_idx: None,
            loop_delay_usec: 0,
        }
    }

    pub fn clear(&mut self) {
        self.seqs.clear();
        self.current = None;
        self.repeat_start = None;
        self.pending_repeat_size = 0;
        self.packet_count = 0;
        self.return_to_idx = None;
        self.loop_delay_usec = 0;
    }

    /// Append one packet with its absolute timestamp.
    ///
    /// Finalizes the current sequence first when it cannot take the record:
    /// its trailing delay becomes the delta from its last packet to this one
    /// and a successor sequence is allocated.
    pub fn append(&mut self, ts: Duration, data: &[u8], wire_len: u32) -> bool {
        let ts_usec = duration_to_usec(ts);
        let needed = 2 * RECORD_HEADER_LEN + data.len();

        let current_fits = self
            .current
            .map(|i| self.seqs[i].has_free_space(needed))
            .unwrap_or(false);
        if !current_fits {
            if let Some(i) = self.current {
                let last = self.seqs[i].last_ts_usec().unwrap_or(ts_usec);
                self.seqs[i].usec_delay = ts_usec - last;
            }
            self.seqs.push(PacketSequence::with_capacity(self.seq_capacity));
            self.current = Some(self.seqs.len() - 1);
        }

        let i = self.current.expect("a sequence was just ensured");
        let ok = self.seqs[i].append_packet(ts_usec, data, wire_len).is_ok();
        if !ok {
            log::warn!(
                "packet of {} bytes does not fit an empty sequence of capacity {}",
                data.len(),
                self.seq_capacity
            );
        }

        self.packet_count += 1;
        if self.pending_repeat_size > 0 && self.packet_count == self.pending_repeat_size {
            self.close_repeat_block(i);
        }
        ok
    }

    fn close_repeat_block(&mut self, last_idx: usize) {
        let start = self
            .repeat_start
            .expect("repeat block closed without a start index");
        debug_assert!(start < self.seqs.len());
        log::debug!(
            "closing packet set: start={}, size={}",
            start,
            self.seqs.len() - start
        );
        if last_idx != start {
            // The block's trailing delay lives on its last sequence; the
            // first one carries the block length instead.
            self.seqs[last_idx].usec_delay = self.seqs[start].usec_delay;
            self.seqs[start].usec_delay = 0;
            self.seqs[start].repeat_size = (self.seqs.len() - start) as u64;
        }
        self.pending_repeat_size = 0;
        // Force a fresh sequence for whatever follows the block.
        self.current = None;
    }

    /// Open a repeat block of `size` packets replayed `repeats` times, with
    /// `delay` observed after each full replay.
    pub fn loop_next_packet_set(&mut self, size: u64, repeats: u64, delay: Duration) {
        let mut seq = PacketSequence::with_capacity(self.seq_capacity);
        seq.repeat_count = repeats;
        seq.usec_delay = duration_to_usec(delay);
        self.repeat_start = Some(self.seqs.len());
        self.pending_repeat_size = size;
        self.packet_count = 0;
        self.seqs.push(seq);
        self.current = Some(self.seqs.len() - 1);
    }

    /// Enable or disable replaying the whole list from the top, waiting
    /// `delay` before each jump back.
    pub fn set_loop_mode(&mut self, enabled: bool, delay: Duration) {
        if enabled {
            self.return_to_idx = Some(0);
            self.loop_delay_usec = duration_to_usec(delay);
        } else {
            self.return_to_idx = None;
            self.loop_delay_usec = 0;
        }
    }

    /// A repeat block has been opened but fewer packets than announced have
    /// arrived. Dispatching in this state is forbidden.
    pub fn has_open_repeat_block(&self) -> bool {
        self.pending_repeat_size > 0
    }

    pub fn sequences(&self) -> &[PacketSequence] {
        &self.seqs
    }

    pub fn is_empty(&self) -> bool {
        self.seqs.is_empty()
    }

    pub fn total_packets(&self) -> u64 {
        self.seqs.iter().map(|s| s.packets()).sum()
    }

    pub fn return_to_idx(&self) -> Option<usize> {
        self.return_to_idx
    }

    pub fn loop_delay_usec(&self) -> i64 {
        self.loop_delay_usec
    }
}

impl Default for PacketList {
    fn default() -> Self {
        PacketList::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usec(n: u64) -> Duration {
        Duration::from_micros(n)
    }

    #[test]
    fn records_round_trip_through_the_region() {
        let mut seq = PacketSequence::new();
        seq.append_packet(10, &[0xaa; 14], 14).unwrap();
        seq.append_packet(25, &[0xbb; 60], 64).unwrap();

        let recs: Vec<_> = seq.iter().collect();
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].ts_usec, 10);
        assert_eq!(recs[0].caplen, 14);
        assert_eq!(recs[0].data, &[0xaa; 14][..]);
        assert_eq!(recs[1].ts_usec, 25);
        assert_eq!(recs[1].len, 64);
        assert_eq!(seq.packets(), 2);
        assert_eq!(seq.bytes(), 78);
        assert_eq!(seq.usec_duration(), 15);
    }

    #[test]
    fn append_fails_cleanly_when_full() {
        let mut seq = PacketSequence::with_capacity(RECORD_HEADER_LEN + 10);
        seq.append_packet(0, &[0; 10], 10).unwrap();
        assert_eq!(seq.append_packet(1, &[0; 1], 1), Err(SequenceFull));
        // The failed append left no partial record behind.
        assert_eq!(seq.packets(), 1);
        assert_eq!(seq.iter().count(), 1);
    }

    #[test]
    fn list_rolls_over_to_a_successor_sequence() {
        // Room for exactly two records of 10 bytes (the rollover check
        // reserves two headers of headroom for the incoming packet).
        let cap = 3 * RECORD_HEADER_LEN + 2 * 10;
        let mut list = PacketList::with_sequence_capacity(cap);
        assert!(list.append(usec(0), &[0; 10], 10));
        assert!(list.append(usec(100), &[1; 10], 10));
        assert!(list.append(usec(250), &[2; 10], 10));

        let seqs = list.sequences();
        assert_eq!(seqs.len(), 2);
        // The finalized sequence carries the delta to the packet that
        // overflowed it.
        assert_eq!(seqs[0].usec_delay(), 150);
        assert_eq!(seqs[0].packets(), 2);
        assert_eq!(seqs[1].packets(), 1);
        assert_eq!(list.total_packets(), 3);
    }

    #[test]
    fn repeat_block_within_one_sequence() {
        let mut list = PacketList::new();
        list.loop_next_packet_set(3, 4, usec(5_000));
        for i in 0..3u64 {
            assert!(list.append(usec(i * 1_000), &[0; 64], 64));
        }
        assert!(!list.has_open_repeat_block());

        let seqs = list.sequences();
        assert_eq!(seqs.len(), 1);
        assert_eq!(seqs[0].repeat_count(), 4);
        assert_eq!(seqs[0].repeat_size(), 1);
        assert_eq!(seqs[0].usec_delay(), 5_000);
        assert_eq!(seqs[0].usec_duration(), 2_000);

        // The next packet goes to a fresh sequence, not into the block.
        assert!(list.append(usec(10_000), &[0; 64], 64));
        assert_eq!(list.sequences().len(), 2);
    }

    #[test]
    fn repeat_block_spanning_sequences_moves_the_delay() {
        let cap = 3 * RECORD_HEADER_LEN + 2 * 10;
        let mut list = PacketList::with_sequence_capacity(cap);
        list.loop_next_packet_set(3, 2, usec(7_000));
        for i in 0..3u64 {
            assert!(list.append(usec(i * 100), &[0; 10], 10));
        }

        let seqs = list.sequences();
        assert_eq!(seqs.len(), 2);
        // First of the block: carries the block length, delay moved away.
        assert_eq!(seqs[0].repeat_size(), 2);
        assert_eq!(seqs[0].repeat_count(), 2);
        assert_eq!(seqs[0].usec_delay(), 0);
        // Last of the block: carries the end-of-block delay, default size.
        // The rollover replaced the start's delay with the inter-packet
        // delta (100) before the close moved it here.
        assert_eq!(seqs[1].repeat_size(), 1);
        assert_eq!(seqs[1].usec_delay(), 100);
    }

    #[test]
    fn open_repeat_block_is_reported() {
        let mut list = PacketList::new();
        list.loop_next_packet_set(5, 2, usec(0));
        list.append(usec(0), &[0; 64], 64);
        assert!(list.has_open_repeat_block());
        list.clear();
        assert!(!list.has_open_repeat_block());
        assert!(list.is_empty());
    }

    #[test]
    fn loop_mode_toggles() {
        let mut list = PacketList::new();
        list.set_loop_mode(true, usec(20_000));
        assert_eq!(list.return_to_idx(), Some(0));
        assert_eq!(list.loop_delay_usec(), 20_000);
        list.set_loop_mode(false, usec(0));
        assert_eq!(list.return_to_idx(), None);
        assert_eq!(list.loop_delay_usec(), 0);
    }

    #[test]
    fn oversized_packet_is_rejected_but_counted_nowhere() {
        let cap = 2 * RECORD_HEADER_LEN + 8;
        let mut list = PacketList::with_sequence_capacity(cap);
        // Needs 2*header + 40 which no empty sequence can offer.
        assert!(!list.append(usec(0), &[0; 40], 40));
        assert_eq!(list.total_packets(), 0);
    }
}
