//! Splitting oversized framed buffers into bounded segments, and putting them
//! back together on the receiving side.
//!
//! The split operates on the raw encoded bytes of an already-framed unit, not
//! on the logical event. Each fragment becomes its own framed
//! [`SegmentEvent`] carrying the original correlation hash, so every fragment
//! is an independent transport unit.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::CodecError;
use crate::event::SegmentEvent;
use crate::frame::{encode_framed, FrameTags};

/// Splits `frame` into `ceil(n/max)` framed segment units when it exceeds
/// `max`; under the limit the frame passes through as the single unit.
pub fn split_frame(frame: &[u8], max: usize, hash: u32, tags: &FrameTags) -> Vec<Vec<u8>> {
    assert!(max > 0, "max package size must be positive");
    if frame.len() <= max {
        return vec![frame.to_vec()];
    }
    let total = frame.len().div_ceil(max) as u32;
    frame
        .chunks(max)
        .enumerate()
        .map(|(i, chunk)| {
            let seg = SegmentEvent {
                sequence: i as u32,
                total,
                content: chunk.to_vec(),
                hash,
            };
            let mut buf = Vec::with_capacity(chunk.len() + 64);
            encode_framed(&mut buf, tags, &seg);
            buf
        })
        .collect()
}

struct PendingSet {
    total: u32,
    parts: HashMap<u32, Vec<u8>>,
    last_seen: Instant,
}

/// Accumulates segments per correlation hash and yields the reconstituted
/// frame once a set is complete.
///
/// Sets that stop receiving segments are evicted after the idle timeout so an
/// abandoned hash never blocks others. A single lock guards the table; it is
/// held only for table bookkeeping, never across I/O.
pub struct Reassembler {
    sets: Mutex<HashMap<u32, PendingSet>>,
    idle_timeout: Duration,
}

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

impl Reassembler {
    pub fn new(idle_timeout: Duration) -> Self {
        Reassembler { sets: Mutex::new(HashMap::new()), idle_timeout }
    }

    /// Feeds one segment in. Returns the concatenated frame bytes once the
    /// segment's set is complete, `None` while it is still partial.
    ///
    /// A segment contradicting its set (mismatched total, out-of-range or
    /// duplicate sequence) drops the whole set and fails.
    pub fn accept(&self, seg: SegmentEvent) -> Result<Option<Vec<u8>>, CodecError> {
        if seg.total == 0 {
            return Err(CodecError::BadSegment("zero total"));
        }
        if seg.sequence >= seg.total {
            return Err(CodecError::BadSegment("sequence out of range"));
        }

        let mut sets = self.sets.lock().unwrap_or_else(|e| e.into_inner());
        let idle = self.idle_timeout;
        sets.retain(|_, set| set.last_seen.elapsed() < idle);

        let set = sets.entry(seg.hash).or_insert_with(|| PendingSet {
            total: seg.total,
            parts: HashMap::new(),
            last_seen: Instant::now(),
        });
        if set.total != seg.total {
            sets.remove(&seg.hash);
            return Err(CodecError::BadSegment("total mismatch within set"));
        }
        if set.parts.contains_key(&seg.sequence) {
            sets.remove(&seg.hash);
            return Err(CodecError::BadSegment("duplicate sequence"));
        }
        set.last_seen = Instant::now();
        set.parts.insert(seg.sequence, seg.content);

        if set.parts.len() as u32 == set.total {
            let total = set.total;
            let mut parts = std::mem::take(&mut set.parts);
            sets.remove(&seg.hash);
            let mut frame = Vec::new();
            for i in 0..total {
                // Every sequence 0..total is present once the set is full.
                if let Some(part) = parts.remove(&i) {
                    frame.extend_from_slice(&part);
                }
            }
            return Ok(Some(frame));
        }
        Ok(None)
    }

    /// Number of incomplete sets currently held.
    pub fn pending(&self) -> usize {
        self.sets.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Reassembler::new(DEFAULT_IDLE_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::registry::Registry;

    fn decode_segment(registry: &Registry, buf: &[u8]) -> SegmentEvent {
        let (_, ev) = registry.parse_framed(buf).unwrap();
        let seg = ev.as_any().downcast_ref::<SegmentEvent>().unwrap();
        SegmentEvent {
            sequence: seg.sequence,
            total: seg.total,
            content: seg.content.clone(),
            hash: ev.hash(),
        }
    }

    #[test]
    fn small_frame_passes_through() {
        let frame = vec![7u8; 100];
        let units = split_frame(&frame, 512, 1, &FrameTags::new("t"));
        assert_eq!(units, vec![frame]);
    }

    #[test]
    fn split_produces_ceil_units_that_reassemble() {
        let registry = Registry::with_core_events().unwrap();
        let frame: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
        let units = split_frame(&frame, 300, 42, &FrameTags::new("t"));
        assert_eq!(units.len(), 4); // ceil(1000/300)

        let reassembler = Reassembler::default();
        let mut result = None;
        for unit in &units {
            let seg = decode_segment(&registry, unit);
            assert_eq!(seg.hash, 42);
            assert_eq!(seg.total, 4);
            if let Some(frame) = reassembler.accept(seg).unwrap() {
                result = Some(frame);
            }
        }
        assert_eq!(result.as_deref(), Some(&frame[..]));
        assert_eq!(reassembler.pending(), 0);
    }

    #[test]
    fn out_of_order_segments_complete() {
        let reassembler = Reassembler::default();
        let parts: Vec<SegmentEvent> = (0..3u32)
            .map(|i| SegmentEvent {
                sequence: i,
                total: 3,
                content: vec![i as u8; 4],
                hash: 9,
            })
            .collect();
        let mut iter = parts.into_iter().rev();
        assert_eq!(reassembler.accept(iter.next().unwrap()).unwrap(), None);
        assert_eq!(reassembler.accept(iter.next().unwrap()).unwrap(), None);
        let frame = reassembler.accept(iter.next().unwrap()).unwrap().unwrap();
        assert_eq!(frame, [0, 0, 0, 0, 1, 1, 1, 1, 2, 2, 2, 2]);
    }

    #[test]
    fn mismatched_total_drops_the_set() {
        let reassembler = Reassembler::default();
        reassembler
            .accept(SegmentEvent { sequence: 0, total: 3, content: vec![1], hash: 5 })
            .unwrap();
        let err = reassembler
            .accept(SegmentEvent { sequence: 1, total: 4, content: vec![2], hash: 5 })
            .unwrap_err();
        assert_eq!(err, CodecError::BadSegment("total mismatch within set"));
        assert_eq!(reassembler.pending(), 0);
    }

    #[test]
    fn duplicate_sequence_drops_the_set() {
        let reassembler = Reassembler::default();
        reassembler
            .accept(SegmentEvent { sequence: 0, total: 3, content: vec![1], hash: 5 })
            .unwrap();
        let err = reassembler
            .accept(SegmentEvent { sequence: 0, total: 3, content: vec![1], hash: 5 })
            .unwrap_err();
        assert_eq!(err, CodecError::BadSegment("duplicate sequence"));
    }

    #[test]
    fn rejects_out_of_range_sequence() {
        let reassembler = Reassembler::default();
        let err = reassembler
            .accept(SegmentEvent { sequence: 3, total: 3, content: vec![1], hash: 5 })
            .unwrap_err();
        assert_eq!(err, CodecError::BadSegment("sequence out of range"));
    }

    #[test]
    fn idle_sets_are_evicted() {
        let reassembler = Reassembler::new(Duration::from_millis(10));
        reassembler
            .accept(SegmentEvent { sequence: 0, total: 2, content: vec![1], hash: 1 })
            .unwrap();
        assert_eq!(reassembler.pending(), 1);
        std::thread::sleep(Duration::from_millis(25));
        // An unrelated hash triggers bookkeeping and must not be blocked.
        reassembler
            .accept(SegmentEvent { sequence: 0, total: 2, content: vec![2], hash: 2 })
            .unwrap();
        assert_eq!(reassembler.pending(), 1);
    }
}
