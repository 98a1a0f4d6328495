use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use webrtc::rtp::packet::Packet;
use webrtc::rtp::packetizer::Depacketizer;

/// Observed average number of RTP packets per video frame.
pub const AVERAGE_FRAME_PACKETS: u16 = 7;

/// Default reorder window: five frames' worth of packets.
pub const DEFAULT_WINDOW: u16 = AVERAGE_FRAME_PACKETS * 5;

/// A packet further than this many windows from the held span starts over.
const RESYNC_WINDOWS: u16 = 8;

/// One reconstructed, decodable unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledFrame {
    pub data: Bytes,
    pub timestamp: u32,
    pub packets: usize,
}

fn seq_before(a: u16, b: u16) -> bool {
    a != b && b.wrapping_sub(a) < 0x8000
}

fn timestamp_before(a: u32, b: u32) -> bool {
    a != b && b.wrapping_sub(a) < 0x8000_0000
}

/// Reorders RTP packets and cuts them into frames.
///
/// Packets are held by sequence number between `head` (the oldest slot still
/// wanted) and `newest`. A frame is emitted once every packet from a
/// partition head to a partition tail with one timestamp is present. When the
/// held span outgrows the window the run at `head` is abandoned and the
/// cursor jumps to the next partition head, so a lost packet stalls the
/// stream for at most one window of arrivals. A sequence number far outside
/// the held span (a sender restart or a long outage) drops everything held
/// and starts again from that packet.
pub struct FrameAssembly<D> {
    depacketizer: D,
    window: u16,
    packets: HashMap<u16, Packet>,
    head: Option<u16>,
    newest: u16,
    // Once set, `head` only moves forward and late packets are dropped.
    anchored: bool,
    last_timestamp: Option<u32>,
    skipped: u32,
}

impl<D: Depacketizer> FrameAssembly<D> {
    pub fn new(depacketizer: D) -> Self {
        Self::with_window(depacketizer, DEFAULT_WINDOW)
    }

    pub fn with_window(depacketizer: D, window: u16) -> Self {
        Self {
            depacketizer,
            window: window.max(1),
            packets: HashMap::new(),
            head: None,
            newest: 0,
            anchored: false,
            last_timestamp: None,
            skipped: 0,
        }
    }

    pub fn push(&mut self, packet: Packet) {
        let seq = packet.header.sequence_number;
        match self.head {
            None => {
                self.head = Some(seq);
                self.newest = seq;
            }
            Some(head) if self.is_jump(seq, head) => self.resync(seq),
            Some(head) => {
                if seq_before(seq, head) {
                    if self.anchored || self.newest.wrapping_sub(seq) >= self.window {
                        tracing::trace!(seq, head, "dropping late packet");
                        return;
                    }
                    self.head = Some(seq);
                }
                if seq_before(self.newest, seq) {
                    self.newest = seq;
                }
            }
        }
        self.packets.insert(seq, packet);
        while self.span() > self.window {
            self.abandon_head_run();
        }
    }

    /// Pops the next complete frame, if one is ready.
    pub fn pop(&mut self) -> Option<AssembledFrame> {
        'outer: loop {
            let head = self.head?;
            let first = self.packets.get(&head)?;
            if !self.depacketizer.is_partition_head(&first.payload) {
                if !self.anchored {
                    // The real partition head may still arrive out of order.
                    return None;
                }
                self.packets.remove(&head);
                self.head = Some(head.wrapping_add(1));
                continue;
            }
            let timestamp = first.header.timestamp;

            let mut end = head;
            loop {
                let packet = self.packets.get(&end)?;
                if packet.header.timestamp != timestamp {
                    self.discard(head, end);
                    self.skipped += 1;
                    continue 'outer;
                }
                if self
                    .depacketizer
                    .is_partition_tail(packet.header.marker, &packet.payload)
                {
                    break;
                }
                if end == self.newest {
                    return None;
                }
                end = end.wrapping_add(1);
            }

            let mut data = BytesMut::new();
            let mut count = 0;
            let mut corrupt = false;
            let mut seq = head;
            loop {
                if let Some(packet) = self.packets.remove(&seq) {
                    match self.depacketizer.depacketize(&packet.payload) {
                        Ok(chunk) => data.extend_from_slice(&chunk),
                        Err(_) => corrupt = true,
                    }
                    count += 1;
                }
                if seq == end {
                    break;
                }
                seq = seq.wrapping_add(1);
            }
            self.head = Some(end.wrapping_add(1));
            self.anchored = true;

            if corrupt {
                self.skipped += 1;
                continue;
            }
            if let Some(last) = self.last_timestamp {
                if timestamp_before(timestamp, last) {
                    self.skipped += 1;
                    continue;
                }
            }
            self.last_timestamp = Some(timestamp);
            return Some(AssembledFrame {
                data: data.freeze(),
                timestamp,
                packets: count,
            });
        }
    }

    /// Number of frames abandoned since the last call.
    pub fn take_skipped(&mut self) -> u32 {
        std::mem::take(&mut self.skipped)
    }

    pub fn buffered(&self) -> usize {
        self.packets.len()
    }

    fn span(&self) -> u16 {
        match self.head {
            Some(head) if !seq_before(self.newest, head) => {
                self.newest.wrapping_sub(head).saturating_add(1)
            }
            _ => 0,
        }
    }

    fn is_jump(&self, seq: u16, head: u16) -> bool {
        let limit = self.window.saturating_mul(RESYNC_WINDOWS);
        let held = if seq_before(self.newest, head) {
            0
        } else {
            self.newest.wrapping_sub(head)
        };
        seq.wrapping_sub(head) > held.saturating_add(limit) && head.wrapping_sub(seq) > limit
    }

    fn resync(&mut self, seq: u16) {
        tracing::debug!(
            seq,
            head = ?self.head,
            dropped = self.packets.len(),
            "sequence jump, resynchronising"
        );
        if self.anchored || !self.packets.is_empty() {
            self.skipped += 1;
        }
        self.packets.clear();
        self.head = Some(seq);
        self.newest = seq;
        self.anchored = false;
        self.last_timestamp = None;
    }

    /// Removes slots `from..until` and moves the cursor to `until`.
    fn discard(&mut self, from: u16, until: u16) {
        let mut seq = from;
        while seq != until {
            self.packets.remove(&seq);
            seq = seq.wrapping_add(1);
        }
        self.head = Some(until);
        self.anchored = true;
    }

    fn abandon_head_run(&mut self) {
        let Some(head) = self.head else {
            return;
        };
        self.packets.remove(&head);
        let mut cursor = head.wrapping_add(1);
        while !seq_before(self.newest, cursor) {
            match self.packets.get(&cursor) {
                Some(packet) if self.depacketizer.is_partition_head(&packet.payload) => break,
                _ => {
                    self.packets.remove(&cursor);
                    cursor = cursor.wrapping_add(1);
                }
            }
        }
        tracing::debug!(from = head, to = cursor, "reorder window overflow, skipping ahead");
        self.head = Some(cursor);
        self.anchored = true;
        self.skipped += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use webrtc::rtp::codecs::vp8::Vp8Packet;
    use webrtc::rtp::header::Header;

    const PACKETS_PER_FRAME: u16 = 3;
    const TICKS_PER_FRAME: u32 = 3_000;

    /// Builds packet `index` of frame `frame`, with a one-byte VP8 descriptor.
    fn packet(frame: u16, index: u16) -> Packet {
        let seq = frame * PACKETS_PER_FRAME + index;
        let descriptor = if index == 0 { 0x10 } else { 0x00 };
        Packet {
            header: Header {
                sequence_number: seq,
                timestamp: frame as u32 * TICKS_PER_FRAME,
                marker: index == PACKETS_PER_FRAME - 1,
                ..Default::default()
            },
            payload: Bytes::from(vec![descriptor, frame as u8, index as u8, 0xAA]),
        }
    }

    fn by_seq(seq: u16) -> Packet {
        packet(seq / PACKETS_PER_FRAME, seq % PACKETS_PER_FRAME)
    }

    fn feed(assembly: &mut FrameAssembly<Vp8Packet>, seqs: &[u16]) -> Vec<AssembledFrame> {
        let mut out = Vec::new();
        for &seq in seqs {
            assembly.push(by_seq(seq));
            while let Some(frame) = assembly.pop() {
                out.push(frame);
            }
        }
        out
    }

    #[test]
    fn in_order_packets_yield_one_frame_per_timestamp() {
        let mut assembly = FrameAssembly::new(Vp8Packet::default());
        let frames = feed(&mut assembly, &(0..6).collect::<Vec<_>>());
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].timestamp, 0);
        assert_eq!(frames[0].packets, 3);
        assert_eq!(
            frames[0].data,
            Bytes::from(vec![0, 0, 0xAA, 0, 1, 0xAA, 0, 2, 0xAA])
        );
        assert_eq!(frames[1].timestamp, TICKS_PER_FRAME);
        assert_eq!(assembly.buffered(), 0);
    }

    #[test]
    fn reordered_packets_within_window_are_deterministic() {
        let mut assembly = FrameAssembly::new(Vp8Packet::default());
        let frames = feed(&mut assembly, &[1, 0, 2, 4, 3, 5, 8, 6, 7, 11, 9, 10]);
        let timestamps: Vec<_> = frames.iter().map(|f| f.timestamp).collect();
        assert_eq!(timestamps, vec![0, 3_000, 6_000, 9_000]);
        assert!(frames.iter().all(|f| f.packets == 3));
        assert_eq!(assembly.take_skipped(), 0);
    }

    #[test]
    fn incomplete_frame_is_never_emitted() {
        let mut assembly = FrameAssembly::new(Vp8Packet::default());
        let frames = feed(&mut assembly, &[0, 2]);
        assert!(frames.is_empty());
        assert_eq!(assembly.buffered(), 2);
    }

    #[test]
    fn withheld_frame_is_skipped_after_window_overflow() {
        let mut assembly = FrameAssembly::new(Vp8Packet::default());
        let mut frames = feed(&mut assembly, &[0, 1, 2]);
        assert_eq!(frames.len(), 1);

        // Frame 1 (seq 3..=5) never arrives.
        let rest: Vec<u16> = (6..=38).collect();
        frames.extend(feed(&mut assembly, &rest));

        let timestamps: Vec<_> = frames.iter().map(|f| f.timestamp / TICKS_PER_FRAME).collect();
        assert_eq!(timestamps, (0..=12).filter(|f| *f != 1).collect::<Vec<u32>>());
        assert_eq!(assembly.take_skipped(), 1);
        assert_eq!(assembly.take_skipped(), 0);
    }

    #[test]
    fn late_packet_after_emission_is_dropped() {
        let mut assembly = FrameAssembly::new(Vp8Packet::default());
        assert_eq!(feed(&mut assembly, &[0, 1, 2]).len(), 1);
        assert!(feed(&mut assembly, &[1]).is_empty());
        assert_eq!(assembly.buffered(), 0);
    }

    #[test]
    fn run_with_changing_timestamp_is_discarded() {
        let mut assembly = FrameAssembly::new(Vp8Packet::default());
        // Frame 0 loses its middle and tail; frame 1 follows directly.
        let mut head = packet(0, 0);
        head.header.sequence_number = 0;
        assembly.push(head);
        assert!(assembly.pop().is_none());

        for index in 0..PACKETS_PER_FRAME {
            let mut next = packet(1, index);
            next.header.sequence_number = 1 + index;
            assembly.push(next);
        }
        let frame = assembly.pop().expect("frame 1");
        assert_eq!(frame.timestamp, TICKS_PER_FRAME);
        assert!(assembly.pop().is_none());
        assert_eq!(assembly.take_skipped(), 1);
    }

    #[test]
    fn far_sequence_jump_starts_over() {
        let mut assembly = FrameAssembly::new(Vp8Packet::default());
        assert_eq!(feed(&mut assembly, &[0, 1, 2]).len(), 1);
        // Half-held frame 1, then the sender's sequence numbers leap ahead.
        assembly.push(by_seq(3));

        for base in [0x9003u16, 0x9003u16.wrapping_add(0x8000)] {
            let mut out = Vec::new();
            for index in 0..PACKETS_PER_FRAME {
                let mut next = packet(2, index);
                next.header.sequence_number = base.wrapping_add(index);
                assembly.push(next);
                while let Some(frame) = assembly.pop() {
                    out.push(frame);
                }
            }
            assert_eq!(out.len(), 1, "no frame after jump to {base:#x}");
            assert_eq!(out[0].packets, 3);
            assert_eq!(assembly.take_skipped(), 1);
            assert_eq!(assembly.buffered(), 0);
        }
    }

    #[test]
    fn straggler_within_reach_does_not_reset() {
        let mut assembly = FrameAssembly::new(Vp8Packet::default());
        assert_eq!(feed(&mut assembly, &(0..9).collect::<Vec<_>>()).len(), 3);
        assert!(feed(&mut assembly, &[4]).is_empty());
        assert_eq!(feed(&mut assembly, &[9, 10, 11]).len(), 1);
        assert_eq!(assembly.take_skipped(), 0);
    }

    #[test]
    fn sequence_wraparound_is_handled() {
        let mut assembly = FrameAssembly::new(Vp8Packet::default());
        let mut out = Vec::new();
        for (offset, index) in [(0u16, 0u16), (1, 1), (2, 2)] {
            let mut p = packet(5, index);
            p.header.sequence_number = 65_534u16.wrapping_add(offset);
            assembly.push(p);
            if let Some(frame) = assembly.pop() {
                out.push(frame);
            }
        }
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].packets, 3);
    }
}
