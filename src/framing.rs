// src/framing.rs
//
// Length-delimited record extraction over a reassembled byte stream.
// Wire format per record: [u32 LE total length (header inclusive)]
// [u16 LE kind] [length - 6 body bytes]. Records never span flows but
// routinely span TCP segments.
//
// The stream opens with a fixed handshake marker; until it is seen the
// scanner discards bytes, which lets a capture attach mid-session. Suspected
// corruption (absurd length, a run of unknown kinds) drops into a resync
// scan that hunts for the next plausible header.
use crate::decoder;
use crate::metrics;
use bytes::{Buf, BytesMut};
use thiserror::Error;

pub const HEADER_LEN: usize = 6;
/// Sanity cap on a single record, header inclusive.
pub const MAX_RECORD_LEN: u32 = 1 << 20;
/// Consecutive unknown kinds tolerated before assuming lost framing.
const UNKNOWN_KIND_STREAK: u32 = 4;

/// One application-layer message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub kind: u16,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("zstd container: {0}")]
    Decompress(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitingSignature,
    Streaming,
    Resync,
}

pub struct FrameStream {
    buf: BytesMut,
    state: State,
    signature: Vec<u8>,
    unknown_streak: u32,
}

impl FrameStream {
    pub fn new(signature: Vec<u8>) -> Self {
        debug_assert!(!signature.is_empty());
        Self {
            buf: BytesMut::with_capacity(16 * 1024),
            state: State::AwaitingSignature,
            signature,
            unknown_streak: 0,
        }
    }

    /// Append reassembled payload bytes.
    pub fn feed(&mut self, payload: &[u8]) {
        self.buf.extend_from_slice(payload);
    }

    /// Forget buffered bytes and re-acquire framing at the next plausible
    /// record boundary. Entered by the reassembler after it had to discard a
    /// flow's reorder buffer.
    pub fn enter_resync(&mut self) {
        self.buf.clear();
        if self.state == State::Streaming {
            self.state = State::Resync;
        }
        self.unknown_streak = 0;
    }

    #[cfg(test)]
    fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Extract every complete record currently buffered, in stream order.
    pub fn drain(&mut self, out: &mut Vec<Record>) {
        loop {
            match self.state {
                State::AwaitingSignature => {
                    if !self.scan_signature() {
                        return;
                    }
                }
                State::Resync => {
                    if !self.scan_boundary() {
                        return;
                    }
                }
                State::Streaming => {
                    if !self.next_record(out) {
                        return;
                    }
                }
            }
        }
    }

    /// Scan for the handshake marker; consume through it on match.
    fn scan_signature(&mut self) -> bool {
        let sig = &self.signature;
        if self.buf.len() < sig.len() {
            return false;
        }
        if let Some(pos) = find(&self.buf, sig) {
            self.buf.advance(pos + sig.len());
            self.state = State::Streaming;
            return true;
        }
        // Keep a tail that could still be a marker prefix.
        let keep = sig.len() - 1;
        let drop = self.buf.len() - keep;
        self.buf.advance(drop);
        false
    }

    /// Byte-by-byte hunt for a length+kind pair that passes sanity checks.
    fn scan_boundary(&mut self) -> bool {
        let mut off = 0usize;
        while off + HEADER_LEN <= self.buf.len() {
            let len = u32::from_le_bytes([
                self.buf[off],
                self.buf[off + 1],
                self.buf[off + 2],
                self.buf[off + 3],
            ]);
            let kind = u16::from_le_bytes([self.buf[off + 4], self.buf[off + 5]]);
            if len as usize >= HEADER_LEN && len <= MAX_RECORD_LEN && decoder::is_known_kind(kind)
            {
                self.buf.advance(off);
                self.state = State::Streaming;
                self.unknown_streak = 0;
                metrics::inc_record_resync_locked();
                return true;
            }
            off += 1;
        }
        let keep = HEADER_LEN - 1;
        if self.buf.len() > keep {
            let drop = self.buf.len() - keep;
            self.buf.advance(drop);
        }
        false
    }

    /// Emit one record if fully buffered. Returns false when more bytes are
    /// needed or the state changed.
    fn next_record(&mut self, out: &mut Vec<Record>) -> bool {
        if self.buf.len() < HEADER_LEN {
            return false;
        }
        let len =
            u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
        if (len as usize) < HEADER_LEN {
            metrics::inc_record_schema_error();
            self.state = State::Resync;
            self.buf.advance(1);
            return true;
        }
        if len > MAX_RECORD_LEN {
            metrics::inc_record_resync_entered();
            self.state = State::Resync;
            self.buf.advance(1);
            return true;
        }
        if self.buf.len() < len as usize {
            return false;
        }
        let kind = u16::from_le_bytes([self.buf[4], self.buf[5]]);
        if decoder::is_known_kind(kind) {
            self.unknown_streak = 0;
        } else {
            self.unknown_streak += 1;
            if self.unknown_streak >= UNKNOWN_KIND_STREAK {
                // A run of alien kinds means the length chain is suspect.
                metrics::inc_record_resync_entered();
                self.state = State::Resync;
                self.unknown_streak = 0;
                self.buf.advance(1);
                return true;
            }
        }

        let mut rec = self.buf.split_to(len as usize);
        rec.advance(HEADER_LEN);
        let body = rec.to_vec();

        if decoder::is_compressed_kind(kind) {
            match inflate_container(&body, out) {
                Ok(n) => metrics::inc_records(n as u64),
                Err(e) => {
                    log::debug!("record kind {kind:#06x} dropped: {e}");
                    metrics::inc_record_decompress_error();
                    // The outer length was valid, so the very next header
                    // re-locks the scan immediately.
                    self.state = State::Resync;
                }
            }
        } else {
            out.push(Record { kind, body });
            metrics::inc_records(1);
        }
        true
    }
}

/// Decode a zstd container body: the inflated buffer is a concatenation of
/// length-prefixed inner records, one nesting level only. Returns the number
/// of inner records emitted.
fn inflate_container(body: &[u8], out: &mut Vec<Record>) -> Result<usize, FrameError> {
    let inner = zstd::stream::decode_all(body)
        .map_err(|e| FrameError::Decompress(e.to_string()))?;
    let mut off = 0usize;
    let mut emitted = 0usize;
    while off + HEADER_LEN <= inner.len() {
        let len = u32::from_le_bytes([
            inner[off],
            inner[off + 1],
            inner[off + 2],
            inner[off + 3],
        ]) as usize;
        if len < HEADER_LEN || off + len > inner.len() {
            // Truncated or corrupt tail inside the container; keep what we got.
            metrics::inc_record_schema_error();
            break;
        }
        let kind = u16::from_le_bytes([inner[off + 4], inner[off + 5]]);
        if decoder::is_compressed_kind(kind) {
            // No second nesting level.
            metrics::inc_record_schema_error();
        } else {
            out.push(Record { kind, body: inner[off + HEADER_LEN..off + len].to_vec() });
            emitted += 1;
        }
        off += len;
    }
    Ok(emitted)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Build the on-wire bytes for one record.
pub fn encode_record(kind: u16, body: &[u8]) -> Vec<u8> {
    let len = (HEADER_LEN + body.len()) as u32;
    let mut v = Vec::with_capacity(len as usize);
    v.extend_from_slice(&len.to_le_bytes());
    v.extend_from_slice(&kind.to_le_bytes());
    v.extend_from_slice(body);
    v
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::kind;

    const SIG: &[u8] = b"\x00\x63\x33\x53\x42\x00";

    fn stream() -> FrameStream {
        FrameStream::new(SIG.to_vec())
    }

    #[test]
    fn single_record_after_signature() {
        let mut s = stream();
        s.feed(SIG);
        s.feed(&encode_record(kind::SELF_IDENTIFY, &42u64.to_le_bytes()));
        let mut out = Vec::new();
        s.drain(&mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, kind::SELF_IDENTIFY);
        assert_eq!(out[0].body.len(), 8);
    }

    #[test]
    fn garbage_then_signature_locks() {
        // 50 junk bytes, then the marker, then one record: exactly that
        // record must come out, with its kind intact.
        let mut s = stream();
        let junk: Vec<u8> = (0..50u8).map(|i| i.wrapping_mul(37).wrapping_add(101)).collect();
        s.feed(&junk);
        s.feed(SIG);
        s.feed(&encode_record(kind::SCENE_CHANGE, &7u32.to_le_bytes()));
        let mut out = Vec::new();
        s.drain(&mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, kind::SCENE_CHANGE);
    }

    #[test]
    fn record_split_across_feeds() {
        let mut s = stream();
        s.feed(SIG);
        let rec = encode_record(kind::SELF_IDENTIFY, &9u64.to_le_bytes());
        let mut out = Vec::new();
        s.feed(&rec[..3]);
        s.drain(&mut out);
        assert!(out.is_empty());
        s.feed(&rec[3..]);
        s.drain(&mut out);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn body_len_matches_header() {
        let mut s = stream();
        s.feed(SIG);
        let body = vec![0u8; 123];
        s.feed(&encode_record(kind::DAMAGE, &body));
        let mut out = Vec::new();
        s.drain(&mut out);
        assert_eq!(out[0].body.len(), 123);
    }

    #[test]
    fn zero_length_enters_resync_and_recovers() {
        let mut s = stream();
        s.feed(SIG);
        s.feed(&0u32.to_le_bytes());
        s.feed(&kind::DAMAGE.to_le_bytes());
        s.feed(&encode_record(kind::SELF_IDENTIFY, &1u64.to_le_bytes()));
        let mut out = Vec::new();
        s.drain(&mut out);
        // The zero header is skipped; the valid record still surfaces.
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, kind::SELF_IDENTIFY);
    }

    #[test]
    fn over_cap_length_triggers_resync() {
        let mut s = stream();
        s.feed(SIG);
        s.feed(&(MAX_RECORD_LEN + 1).to_le_bytes());
        s.feed(&kind::DAMAGE.to_le_bytes());
        s.feed(&encode_record(kind::SELF_IDENTIFY, &1u64.to_le_bytes()));
        let mut out = Vec::new();
        s.drain(&mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, kind::SELF_IDENTIFY);
    }

    #[test]
    fn length_equal_to_cap_accepted() {
        let mut s = stream();
        s.feed(SIG);
        let body = vec![0u8; MAX_RECORD_LEN as usize - HEADER_LEN];
        s.feed(&encode_record(kind::DAMAGE, &body));
        let mut out = Vec::new();
        s.drain(&mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].body.len(), MAX_RECORD_LEN as usize - HEADER_LEN);
    }

    #[test]
    fn zstd_container_unpacks_inner_records() {
        let inner_a = encode_record(kind::SELF_IDENTIFY, &5u64.to_le_bytes());
        let inner_b = encode_record(kind::SCENE_CHANGE, &2u32.to_le_bytes());
        let mut concat = inner_a.clone();
        concat.extend_from_slice(&inner_b);
        let packed = zstd::stream::encode_all(&concat[..], 0).unwrap();

        let mut s = stream();
        s.feed(SIG);
        s.feed(&encode_record(kind::NOTIFY_BATCH, &packed));
        let mut out = Vec::new();
        s.drain(&mut out);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].kind, kind::SELF_IDENTIFY);
        assert_eq!(out[1].kind, kind::SCENE_CHANGE);
    }

    #[test]
    fn corrupt_container_skipped_stream_continues() {
        let mut s = stream();
        s.feed(SIG);
        s.feed(&encode_record(kind::NOTIFY_BATCH, b"definitely not zstd"));
        s.feed(&encode_record(kind::SELF_IDENTIFY, &1u64.to_le_bytes()));
        let mut out = Vec::new();
        s.drain(&mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, kind::SELF_IDENTIFY);
    }

    #[test]
    fn signature_tail_kept_across_feeds() {
        let mut s = stream();
        s.feed(&[0xAA; 32]);
        s.feed(&SIG[..3]);
        let mut out = Vec::new();
        s.drain(&mut out);
        assert!(s.buffered() < 40);
        s.feed(&SIG[3..]);
        s.feed(&encode_record(kind::SELF_IDENTIFY, &1u64.to_le_bytes()));
        s.drain(&mut out);
        assert_eq!(out.len(), 1);
    }
}
