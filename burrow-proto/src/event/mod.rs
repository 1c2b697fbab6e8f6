//! The event type system.
//!
//! Every message crossing a backend transport implements [`Event`]. An event
//! knows its numeric `(type, version)` identity, carries the session
//! correlation hash, and encodes its payload with a hand-written codec (the
//! generic [`WireValue`](crate::codec::value::WireValue) path is a fallback
//! only, never used for these types).
//!
//! The correlation hash is a session number copied from request to response
//! so replies can be routed back to the session that asked. It is not a
//! checksum and no integrity property is attached to it.

use std::any::Any;

use crate::codec::{put_uvarint, Reader};
use crate::error::CodecError;
use crate::registry::Registry;

mod auth;
mod http;
mod segment;
mod tcp;
mod wrapper;

pub use auth::{AdminResponseEvent, AuthRequestEvent, AuthResponseEvent, UserLoginEvent};
pub use http::{
    HttpChunkEvent, HttpConnectionEvent, HttpErrorEvent, HttpRequestEvent, HttpResponseEvent,
};
pub use segment::SegmentEvent;
pub use tcp::{ConnectionStatus, SocketConnectionEvent, TcpChunkEvent};
pub use wrapper::{CompressEvent, CompressMethod, EncryptEvent, EncryptMethod};

pub const HTTP_REQUEST_EVENT_TYPE: u32 = 1000;
pub const HTTP_RESPONSE_EVENT_TYPE: u32 = 1001;
pub const HTTP_CHUNK_EVENT_TYPE: u32 = 1002;
pub const HTTP_ERROR_EVENT_TYPE: u32 = 1003;
pub const HTTP_CONNECTION_EVENT_TYPE: u32 = 1004;
pub const COMPRESS_EVENT_TYPE: u32 = 1500;
pub const ENCRYPT_EVENT_TYPE: u32 = 1501;
pub const TCP_CHUNK_EVENT_TYPE: u32 = 1510;
pub const SOCKET_CONNECTION_EVENT_TYPE: u32 = 1511;
pub const USER_LOGIN_EVENT_TYPE: u32 = 1600;
pub const AUTH_REQUEST_EVENT_TYPE: u32 = 2000;
pub const AUTH_RESPONSE_EVENT_TYPE: u32 = 2001;
pub const ADMIN_RESPONSE_EVENT_TYPE: u32 = 2020;
pub const SEGMENT_EVENT_TYPE: u32 = 48100;

/// A self-describing wire message.
///
/// Payload encoding is infallible; every decode failure is surfaced through
/// [`CodecError`] and aborts the whole parse, there is no partial decode.
pub trait Event: Any + Send {
    // Named to stay clear of `Any::type_id`, which every event also has.
    fn event_type(&self) -> u32;

    fn version(&self) -> u32 {
        1
    }

    /// The session correlation number.
    fn hash(&self) -> u32;
    fn set_hash(&mut self, hash: u32);

    /// Appends the payload bytes (everything after the [`EventHeader`]).
    fn encode_payload(&self, buf: &mut Vec<u8>);

    /// Replaces this event's fields with ones decoded from `r`. The registry
    /// is only consulted by wrapper types that contain a nested event.
    fn decode_payload(
        &mut self,
        r: &mut Reader<'_>,
        registry: &Registry,
    ) -> Result<(), CodecError>;

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

/// A concrete event type eligible for [`Registry`] registration.
pub trait RegisteredEvent: Event + Default {
    const TYPE_ID: u32;
    const VERSION: u32 = 1;
}

/// Implements the identity and downcasting boilerplate of [`Event`] for a
/// struct with a `hash: u32` field. The payload codec stays hand-written.
macro_rules! event_identity {
    ($name:ident, $type_id:expr) => {
        fn event_type(&self) -> u32 {
            $type_id
        }

        fn hash(&self) -> u32 {
            self.hash
        }

        fn set_hash(&mut self, hash: u32) {
            self.hash = hash;
        }

        fn as_any(&self) -> &dyn ::std::any::Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn ::std::any::Any {
            self
        }

        fn into_any(self: Box<Self>) -> Box<dyn ::std::any::Any> {
            self
        }
    };
}
pub(crate) use event_identity;

/// The `(type, version, hash)` triple prefixed to every payload as three
/// uvarints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventHeader {
    pub type_id: u32,
    pub version: u32,
    pub hash: u32,
}

impl EventHeader {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        put_uvarint(buf, u64::from(self.type_id));
        put_uvarint(buf, u64::from(self.version));
        put_uvarint(buf, u64::from(self.hash));
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let type_id = read_u32(r, "event type")?;
        let version = read_u32(r, "event version")?;
        let hash = read_u32(r, "event hash")?;
        Ok(EventHeader { type_id, version, hash })
    }
}

pub(crate) fn read_u32(r: &mut Reader<'_>, what: &'static str) -> Result<u32, CodecError> {
    u32::try_from(r.uvarint()?).map_err(|_| CodecError::InvalidValue(what))
}

/// Serializes `ev` as `EventHeader ++ payload`. The header is written even
/// for zero-payload event types.
pub fn encode_event(buf: &mut Vec<u8>, ev: &dyn Event) {
    let header = EventHeader {
        type_id: ev.event_type(),
        version: ev.version(),
        hash: ev.hash(),
    };
    header.encode(buf);
    ev.encode_payload(buf);
}

/// Strips any number of compress/encrypt wrappers, returning the innermost
/// event with the outermost correlation hash propagated onto it. Events that
/// are not wrappers come back unchanged.
pub fn unwrap_event(mut ev: Box<dyn Event>) -> Box<dyn Event> {
    loop {
        let hash = ev.hash();
        let inner = if let Some(w) = ev.as_any_mut().downcast_mut::<CompressEvent>() {
            w.take_inner()
        } else if let Some(w) = ev.as_any_mut().downcast_mut::<EncryptEvent>() {
            w.take_inner()
        } else {
            return ev;
        };
        match inner {
            Some(mut next) => {
                next.set_hash(hash);
                ev = next;
            }
            // A wrapper whose inner event was already taken; nothing left to
            // unwrap.
            None => return ev,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let header = EventHeader { type_id: HTTP_REQUEST_EVENT_TYPE, version: 1, hash: 0xdead };
        let mut buf = Vec::new();
        header.encode(&mut buf);
        let decoded = EventHeader::decode(&mut Reader::new(&buf)).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn truncated_header_errors() {
        let header = EventHeader { type_id: SEGMENT_EVENT_TYPE, version: 1, hash: 7 };
        let mut buf = Vec::new();
        header.encode(&mut buf);
        buf.pop();
        assert!(EventHeader::decode(&mut Reader::new(&buf)).is_err());
    }
}
