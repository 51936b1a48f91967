// src/reassembly.rs
//
// Per-flow TCP stream reconstruction. The game multiplexes everything over
// one long-lived connection, so a lost resync silently corrupts every later
// statistic; when a hole persists past the buffer cap the whole flow buffer
// is dropped and framing re-acquires a record boundary, rather than guessing
// at missing bytes.
use crate::framing::{FrameStream, Record};
use crate::metrics;
use hashbrown::HashMap;
use std::collections::BTreeMap;

const ETH_HEADER: usize = 14;
const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_VLAN: u16 = 0x8100;

const TCP_FIN: u8 = 0x01;
const TCP_SYN: u8 = 0x02;
const TCP_RST: u8 = 0x04;

/// `a < b` under sequence-number arithmetic (RFC 1982 style).
#[inline]
pub fn seq_lt(a: u32, b: u32) -> bool {
    a != b && b.wrapping_sub(a) < 0x8000_0000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src_ip: [u8; 4],
    pub src_port: u16,
    pub dst_ip: [u8; 4],
    pub dst_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

struct Flow {
    expected_seq: u32,
    synced: bool,
    /// Out-of-order segments keyed by absolute sequence number.
    pending: BTreeMap<u32, Vec<u8>>,
    pending_bytes: usize,
    stream: FrameStream,
    last_seen_ms: u64,
}

impl Flow {
    fn new(signature: &[u8], now_ms: u64) -> Self {
        Self {
            expected_seq: 0,
            synced: false,
            pending: BTreeMap::new(),
            pending_bytes: 0,
            stream: FrameStream::new(signature.to_vec()),
            last_seen_ms: now_ms,
        }
    }

    fn clear_pending(&mut self) {
        self.pending.clear();
        self.pending_bytes = 0;
    }
}

pub struct FlowTable {
    flows: HashMap<FlowKey, Flow>,
    game_port: u16,
    signature: Vec<u8>,
    reorder_cap_bytes: usize,
    flow_idle_ms: u64,
}

struct TcpSegment<'a> {
    key: FlowKey,
    seq: u32,
    flags: u8,
    payload: &'a [u8],
}

impl FlowTable {
    pub fn new(
        game_port: u16,
        signature: Vec<u8>,
        reorder_cap_bytes: usize,
        flow_idle_ms: u64,
    ) -> Self {
        Self {
            flows: HashMap::new(),
            game_port,
            signature,
            reorder_cap_bytes,
            flow_idle_ms,
        }
    }

    pub fn active_flows(&self) -> usize {
        self.flows.len()
    }

    fn direction(&self, key: &FlowKey) -> Direction {
        if key.src_port == self.game_port {
            Direction::ServerToClient
        } else {
            Direction::ClientToServer
        }
    }

    /// Process one link-layer frame; complete records parsed out of the
    /// affected flow are appended to `out`.
    pub fn handle_frame(&mut self, ts_ms: u64, frame: &[u8], out: &mut Vec<Record>) {
        let seg = match parse_tcp(frame, self.game_port) {
            Some(s) => s,
            None => return,
        };

        if seg.flags & TCP_RST != 0 {
            if self.flows.remove(&seg.key).is_some() {
                metrics::inc_flow_closed();
            }
            return;
        }

        if !self.flows.contains_key(&seg.key) {
            log::debug!(
                "new flow {:?}:{} -> {:?}:{} ({:?})",
                seg.key.src_ip,
                seg.key.src_port,
                seg.key.dst_ip,
                seg.key.dst_port,
                self.direction(&seg.key)
            );
        }
        let flow = self
            .flows
            .entry(seg.key)
            .or_insert_with(|| Flow::new(&self.signature, ts_ms));
        flow.last_seen_ms = ts_ms;

        if seg.flags & TCP_SYN != 0 {
            // Fresh stream origin; anything buffered predates it.
            flow.expected_seq = seg.seq.wrapping_add(1);
            flow.synced = true;
            flow.clear_pending();
            flow.stream = FrameStream::new(self.signature.clone());
            return;
        }

        if !flow.synced {
            // Mid-capture attach: adopt the first observed segment as origin.
            flow.expected_seq = seg.seq;
            flow.synced = true;
        }

        if !seg.payload.is_empty() {
            Self::ingest(flow, seg.seq, seg.payload, self.reorder_cap_bytes, out);
        }

        if seg.flags & TCP_FIN != 0 {
            flow.stream.drain(out);
            self.flows.remove(&seg.key);
            metrics::inc_flow_closed();
        }
    }

    fn ingest(
        flow: &mut Flow,
        seq: u32,
        payload: &[u8],
        cap: usize,
        out: &mut Vec<Record>,
    ) {
        if seq == flow.expected_seq {
            flow.stream.feed(payload);
            flow.expected_seq = flow.expected_seq.wrapping_add(payload.len() as u32);
            Self::drain_contiguous(flow);
            flow.stream.drain(out);
        } else if seq_lt(flow.expected_seq, seq) {
            if flow.pending_bytes + payload.len() > cap {
                // Hole persisted past the cap: abandon the buffer and rebase
                // the stream on this segment. Framing rescans for a boundary.
                metrics::inc_flow_resync();
                flow.clear_pending();
                flow.stream.enter_resync();
                flow.expected_seq = seq.wrapping_add(payload.len() as u32);
                flow.stream.feed(payload);
                flow.stream.drain(out);
                return;
            }
            match flow.pending.entry(seq) {
                std::collections::btree_map::Entry::Occupied(_) => {
                    // Duplicate of a buffered segment; trust the earlier copy.
                    metrics::inc_flow_retransmit();
                }
                std::collections::btree_map::Entry::Vacant(e) => {
                    e.insert(payload.to_vec());
                    flow.pending_bytes += payload.len();
                    metrics::inc_flow_ooo();
                }
            }
        } else {
            // seq < expected: retransmit or overlap.
            metrics::inc_flow_retransmit();
        }
    }

    /// Feed buffered segments that have become contiguous, dropping stale
    /// entries the cursor has already passed.
    fn drain_contiguous(flow: &mut Flow) {
        while let Some(chunk) = flow.pending.remove(&flow.expected_seq) {
            flow.pending_bytes -= chunk.len();
            flow.stream.feed(&chunk);
            flow.expected_seq = flow.expected_seq.wrapping_add(chunk.len() as u32);
        }
        // Anything strictly behind the cursor is overlap from before the
        // drain; trust the bytes already delivered.
        let stale: Vec<u32> = flow
            .pending
            .keys()
            .copied()
            .filter(|&s| seq_lt(s, flow.expected_seq))
            .collect();
        for s in stale {
            if let Some(v) = flow.pending.remove(&s) {
                flow.pending_bytes -= v.len();
                metrics::inc_flow_retransmit();
            }
        }
    }

    /// Drop flows idle past the configured window.
    pub fn evict_idle(&mut self, now_ms: u64) {
        let idle = self.flow_idle_ms;
        let before = self.flows.len();
        self.flows
            .retain(|_, f| now_ms.saturating_sub(f.last_seen_ms) <= idle);
        let evicted = before - self.flows.len();
        if evicted > 0 {
            metrics::inc_flows_evicted(evicted as u64);
            log::debug!("evicted {evicted} idle flows");
        }
    }
}

/// Pull the TCP segment out of an Ethernet/IPv4 frame. Returns None for
/// non-TCP traffic and for ports other than the game's.
fn parse_tcp(frame: &[u8], game_port: u16) -> Option<TcpSegment<'_>> {
    if frame.len() < ETH_HEADER {
        return None;
    }
    let mut off = ETH_HEADER;
    let mut ethertype = u16::from_be_bytes([frame[12], frame[13]]);
    if ethertype == ETHERTYPE_VLAN {
        if frame.len() < off + 4 {
            return None;
        }
        ethertype = u16::from_be_bytes([frame[off + 2], frame[off + 3]]);
        off += 4;
    }
    if ethertype != ETHERTYPE_IPV4 {
        return None;
    }

    let ip = frame.get(off..)?;
    if ip.len() < 20 || ip[0] >> 4 != 4 {
        return None;
    }
    let ihl = ((ip[0] & 0x0f) as usize) * 4;
    let total_len = u16::from_be_bytes([ip[2], ip[3]]) as usize;
    if ihl < 20 || total_len < ihl || ip.len() < total_len {
        return None;
    }
    if ip[9] != 6 {
        return None;
    }
    let src_ip: [u8; 4] = ip[12..16].try_into().ok()?;
    let dst_ip: [u8; 4] = ip[16..20].try_into().ok()?;

    let tcp = &ip[ihl..total_len];
    if tcp.len() < 20 {
        return None;
    }
    let src_port = u16::from_be_bytes([tcp[0], tcp[1]]);
    let dst_port = u16::from_be_bytes([tcp[2], tcp[3]]);
    if src_port != game_port && dst_port != game_port {
        return None;
    }
    let seq = u32::from_be_bytes([tcp[4], tcp[5], tcp[6], tcp[7]]);
    let data_off = ((tcp[12] >> 4) as usize) * 4;
    if data_off < 20 || tcp.len() < data_off {
        return None;
    }
    let flags = tcp[13];

    Some(TcpSegment {
        key: FlowKey { src_ip, src_port, dst_ip, dst_port },
        seq,
        flags,
        payload: &tcp[data_off..],
    })
}

#[cfg(test)]
pub mod testutil {
    /// Build a minimal Ethernet+IPv4+TCP frame around `payload`.
    pub fn frame(
        src_port: u16,
        dst_port: u16,
        seq: u32,
        flags: u8,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut v = Vec::with_capacity(54 + payload.len());
        // Ethernet
        v.extend_from_slice(&[0u8; 12]);
        v.extend_from_slice(&0x0800u16.to_be_bytes());
        // IPv4, no options
        let total = 20 + 20 + payload.len();
        v.push(0x45);
        v.push(0);
        v.extend_from_slice(&(total as u16).to_be_bytes());
        v.extend_from_slice(&[0u8; 4]); // id + frag
        v.push(64); // ttl
        v.push(6); // tcp
        v.extend_from_slice(&[0u8; 2]); // checksum
        v.extend_from_slice(&[10, 0, 0, 1]);
        v.extend_from_slice(&[10, 0, 0, 2]);
        // TCP, no options
        v.extend_from_slice(&src_port.to_be_bytes());
        v.extend_from_slice(&dst_port.to_be_bytes());
        v.extend_from_slice(&seq.to_be_bytes());
        v.extend_from_slice(&[0u8; 4]); // ack
        v.push(5 << 4); // data offset
        v.push(flags);
        v.extend_from_slice(&[0u8; 4]); // window + checksum
        v.extend_from_slice(&[0u8; 2]); // urgent
        v.extend_from_slice(payload);
        v
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::frame;
    use super::*;
    use crate::decoder::kind;
    use crate::framing::encode_record;
    use rand::seq::SliceRandom;

    const SIG: &[u8] = b"\x00\x63\x33\x53\x42\x00";
    const PORT: u16 = 9002;

    fn table() -> FlowTable {
        FlowTable::new(PORT, SIG.to_vec(), 1 << 20, 120_000)
    }

    fn stream_bytes() -> Vec<u8> {
        let mut v = SIG.to_vec();
        v.extend_from_slice(&encode_record(kind::SELF_IDENTIFY, &42u64.to_le_bytes()));
        v.extend_from_slice(&encode_record(
            kind::DAMAGE,
            &crate::decoder::build::damage(42, 1, 1241, 0, 100, Default::default(), 100),
        ));
        v
    }

    #[test]
    fn in_order_delivery() {
        let mut t = table();
        let mut out = Vec::new();
        let bytes = stream_bytes();
        t.handle_frame(0, &frame(PORT, 5555, 1000, TCP_SYN, &[]), &mut out);
        t.handle_frame(1, &frame(PORT, 5555, 1001, 0, &bytes), &mut out);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].kind, kind::SELF_IDENTIFY);
        assert_eq!(out[1].kind, kind::DAMAGE);
    }

    #[test]
    fn out_of_order_segments_reassemble() {
        // One record split across three segments delivered [2, 0, 1].
        let mut t = table();
        let mut out = Vec::new();
        let body = vec![0xCDu8; 3000 - crate::framing::HEADER_LEN];
        let mut bytes = SIG.to_vec();
        bytes.extend_from_slice(&encode_record(kind::DAMAGE, &body));
        let seg: Vec<&[u8]> = bytes.chunks(1002).collect();
        let base: u32 = 5000;

        t.handle_frame(0, &frame(PORT, 5555, base.wrapping_sub(1), TCP_SYN, &[]), &mut out);
        let off = |i: usize| base.wrapping_add((i * 1002) as u32);
        t.handle_frame(1, &frame(PORT, 5555, off(2), 0, seg[2]), &mut out);
        t.handle_frame(2, &frame(PORT, 5555, off(0), 0, seg[0]), &mut out);
        t.handle_frame(3, &frame(PORT, 5555, off(1), 0, seg[1]), &mut out);

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, kind::DAMAGE);
        assert_eq!(out[0].body, body);
    }

    #[test]
    fn random_permutation_equals_in_order() {
        let mut body = Vec::new();
        for i in 0..64u64 {
            body.extend_from_slice(&encode_record(kind::SELF_IDENTIFY, &i.to_le_bytes()));
        }
        let mut bytes = SIG.to_vec();
        bytes.extend_from_slice(&body);

        let mut reference = Vec::new();
        {
            let mut t = table();
            t.handle_frame(0, &frame(PORT, 6000, 99, TCP_SYN, &[]), &mut reference);
            t.handle_frame(1, &frame(PORT, 6000, 100, 0, &bytes), &mut reference);
        }

        let mut segments: Vec<(u32, Vec<u8>)> = bytes
            .chunks(173)
            .enumerate()
            .map(|(i, c)| (100u32.wrapping_add((i * 173) as u32), c.to_vec()))
            .collect();
        let mut rng = rand::thread_rng();
        segments.shuffle(&mut rng);

        let mut t = table();
        let mut out = Vec::new();
        t.handle_frame(0, &frame(PORT, 6000, 99, TCP_SYN, &[]), &mut out);
        for (i, (seq, data)) in segments.iter().enumerate() {
            t.handle_frame(1 + i as u64, &frame(PORT, 6000, *seq, 0, data), &mut out);
        }
        assert_eq!(out, reference);
    }

    #[test]
    fn retransmits_are_dropped() {
        let mut t = table();
        let mut out = Vec::new();
        let bytes = stream_bytes();
        t.handle_frame(0, &frame(PORT, 5555, 10, TCP_SYN, &[]), &mut out);
        t.handle_frame(1, &frame(PORT, 5555, 11, 0, &bytes), &mut out);
        let n = out.len();
        // Same segment again: nothing new may come out.
        t.handle_frame(2, &frame(PORT, 5555, 11, 0, &bytes), &mut out);
        assert_eq!(out.len(), n);
    }

    #[test]
    fn syn_with_wrapping_sequence() {
        let mut t = table();
        let mut out = Vec::new();
        let bytes = stream_bytes();
        // SYN at u32::MAX: first payload byte is seq 0.
        t.handle_frame(0, &frame(PORT, 5555, u32::MAX, TCP_SYN, &[]), &mut out);
        let (a, b) = bytes.split_at(20);
        // Deliver the second half first across the wrap boundary.
        t.handle_frame(1, &frame(PORT, 5555, 20, 0, b), &mut out);
        assert!(out.is_empty());
        t.handle_frame(2, &frame(PORT, 5555, 0, 0, a), &mut out);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn fin_closes_flow() {
        let mut t = table();
        let mut out = Vec::new();
        t.handle_frame(0, &frame(PORT, 5555, 10, TCP_SYN, &[]), &mut out);
        t.handle_frame(1, &frame(PORT, 5555, 11, TCP_FIN, &stream_bytes()), &mut out);
        assert_eq!(t.active_flows(), 0);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn reorder_cap_overflow_resyncs_on_next_origin() {
        let mut t = FlowTable::new(PORT, SIG.to_vec(), 4096, 120_000);
        let mut out = Vec::new();
        t.handle_frame(0, &frame(PORT, 5555, 10, TCP_SYN, &[]), &mut out);
        // Future segments only; the hole at 11 never fills.
        let junk = vec![0u8; 2048];
        t.handle_frame(1, &frame(PORT, 5555, 100_011, 0, &junk), &mut out);
        t.handle_frame(2, &frame(PORT, 5555, 102_059, 0, &junk), &mut out);
        // Third future segment overflows the 4 KiB cap and rebases there.
        let mut fresh = SIG.to_vec();
        fresh.extend_from_slice(&encode_record(kind::SCENE_CHANGE, &3u32.to_le_bytes()));
        t.handle_frame(3, &frame(PORT, 5555, 104_107, 0, &fresh), &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, kind::SCENE_CHANGE);
    }

    #[test]
    fn idle_flows_evicted() {
        let mut t = table();
        let mut out = Vec::new();
        t.handle_frame(0, &frame(PORT, 5555, 10, TCP_SYN, &[]), &mut out);
        assert_eq!(t.active_flows(), 1);
        t.evict_idle(120_001);
        assert_eq!(t.active_flows(), 0);
    }

    #[test]
    fn non_game_ports_ignored() {
        let mut t = table();
        let mut out = Vec::new();
        t.handle_frame(0, &frame(80, 5555, 10, TCP_SYN, &[]), &mut out);
        assert_eq!(t.active_flows(), 0);
    }

    #[test]
    fn seq_compare_wraps() {
        assert!(seq_lt(u32::MAX, 0));
        assert!(seq_lt(0, 1));
        assert!(!seq_lt(1, 0));
        assert!(!seq_lt(5, 5));
    }
}
