//! The segment event: one bounded-size fragment of a larger framed buffer.
//!
//! Splitting and reassembly logic lives in [`crate::segment`]; this is just
//! the wire type.

use crate::codec::{put_bytes, put_uvarint, Reader};
use crate::error::CodecError;
use crate::event::{event_identity, read_u32, Event, RegisteredEvent, SEGMENT_EVENT_TYPE};
use crate::registry::Registry;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SegmentEvent {
    /// Zero-based position of this fragment within its set.
    pub sequence: u32,
    /// Number of fragments in the set this fragment belongs to.
    pub total: u32,
    pub content: Vec<u8>,
    pub hash: u32,
}

impl Event for SegmentEvent {
    event_identity!(SegmentEvent, SEGMENT_EVENT_TYPE);

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        put_uvarint(buf, u64::from(self.sequence));
        put_uvarint(buf, u64::from(self.total));
        put_bytes(buf, &self.content);
    }

    fn decode_payload(
        &mut self,
        r: &mut Reader<'_>,
        _registry: &Registry,
    ) -> Result<(), CodecError> {
        self.sequence = read_u32(r, "segment sequence")?;
        self.total = read_u32(r, "segment total")?;
        self.content = r.bytes()?;
        Ok(())
    }
}

impl RegisteredEvent for SegmentEvent {
    const TYPE_ID: u32 = SEGMENT_EVENT_TYPE;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;

    #[test]
    fn round_trip() {
        let registry = Registry::with_core_events().unwrap();
        let ev = SegmentEvent { sequence: 2, total: 5, content: vec![9; 32], hash: 42 };
        let mut buf = Vec::new();
        ev.encode_payload(&mut buf);
        let mut decoded = SegmentEvent::default();
        decoded.decode_payload(&mut Reader::new(&buf), &registry).unwrap();
        assert_eq!(decoded, ev);
    }

    #[test]
    fn truncated_content_errors() {
        let registry = Registry::with_core_events().unwrap();
        let ev = SegmentEvent { sequence: 0, total: 1, content: vec![1; 16], hash: 0 };
        let mut buf = Vec::new();
        ev.encode_payload(&mut buf);
        buf.truncate(buf.len() - 4);
        let mut decoded = SegmentEvent::default();
        assert_eq!(
            decoded.decode_payload(&mut Reader::new(&buf), &registry),
            Err(CodecError::Truncated)
        );
    }
}
