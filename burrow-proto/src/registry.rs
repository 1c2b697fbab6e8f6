//! The type registry: reconstructs concrete events from raw bytes without the
//! caller knowing the type in advance.
//!
//! A registry is built once at startup, then shared read-only (typically
//! behind an `Arc`). There is no process-global registry.

use std::collections::HashMap;

use crate::codec::Reader;
use crate::error::{CodecError, DuplicateRegistration};
use crate::event::{
    AdminResponseEvent, AuthRequestEvent, AuthResponseEvent, CompressEvent, EncryptEvent, Event,
    EventHeader, HttpChunkEvent, HttpConnectionEvent, HttpErrorEvent, HttpRequestEvent,
    HttpResponseEvent, RegisteredEvent, SegmentEvent, SocketConnectionEvent, TcpChunkEvent,
    UserLoginEvent,
};
use crate::frame::FrameTags;

type Constructor = fn() -> Box<dyn Event>;

pub struct Registry {
    constructors: HashMap<(u32, u32), Constructor>,
}

impl Registry {
    pub fn new() -> Self {
        Registry { constructors: HashMap::new() }
    }

    /// A registry holding every event type this crate defines.
    pub fn with_core_events() -> Result<Self, DuplicateRegistration> {
        let mut reg = Registry::new();
        reg.register::<HttpRequestEvent>()?;
        reg.register::<HttpResponseEvent>()?;
        reg.register::<HttpChunkEvent>()?;
        reg.register::<HttpErrorEvent>()?;
        reg.register::<HttpConnectionEvent>()?;
        reg.register::<TcpChunkEvent>()?;
        reg.register::<SocketConnectionEvent>()?;
        reg.register::<UserLoginEvent>()?;
        reg.register::<AuthRequestEvent>()?;
        reg.register::<AuthResponseEvent>()?;
        reg.register::<AdminResponseEvent>()?;
        reg.register::<CompressEvent>()?;
        reg.register::<EncryptEvent>()?;
        reg.register::<SegmentEvent>()?;
        Ok(reg)
    }

    /// Claims `(T::TYPE_ID, T::VERSION)`. Claiming a pair twice is a
    /// programming error and fails rather than silently replacing.
    pub fn register<T: RegisteredEvent>(&mut self) -> Result<(), DuplicateRegistration> {
        let key = (T::TYPE_ID, T::VERSION);
        if self.constructors.contains_key(&key) {
            return Err(DuplicateRegistration { type_id: key.0, version: key.1 });
        }
        self.constructors.insert(key, || Box::new(T::default()));
        Ok(())
    }

    pub fn is_registered(&self, type_id: u32, version: u32) -> bool {
        self.constructors.contains_key(&(type_id, version))
    }

    /// Decodes `EventHeader ++ payload` into a fresh event with the header's
    /// hash copied in. A decode failure at any nesting level aborts the whole
    /// parse.
    pub fn parse_event(&self, r: &mut Reader<'_>) -> Result<Box<dyn Event>, CodecError> {
        let header = EventHeader::decode(r)?;
        let construct = self
            .constructors
            .get(&(header.type_id, header.version))
            .ok_or(CodecError::Unregistered {
                type_id: header.type_id,
                version: header.version,
            })?;
        let mut ev = construct();
        ev.set_hash(header.hash);
        ev.decode_payload(r, self)?;
        Ok(ev)
    }

    /// Decodes a complete framed unit: tag header, then the event.
    pub fn parse_framed(&self, buf: &[u8]) -> Result<(FrameTags, Box<dyn Event>), CodecError> {
        let mut r = Reader::new(buf);
        let tags = FrameTags::decode(&mut r)?;
        let ev = self.parse_event(&mut r)?;
        Ok((tags, ev))
    }
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new()
    }
}
