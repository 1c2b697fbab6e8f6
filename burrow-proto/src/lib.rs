//! The event protocol engine used by the burrow tunneling proxy.
//!
//! Everything that crosses a backend transport is an *event*: a self-describing,
//! versioned unit of wire data. An event is framed as a magic-numbered tag header
//! carrying the session token, followed by an [`EventHeader`](event::EventHeader)
//! with the event's `(type, version)` identity and correlation hash, followed by
//! the type-specific payload.
//!
//! Events may be nested inside transform wrappers ([`CompressEvent`](event::CompressEvent),
//! [`EncryptEvent`](event::EncryptEvent)) which apply a reversible byte-level
//! transform to the serialized inner event, and an oversized framed buffer may be
//! split into bounded [`SegmentEvent`](event::SegmentEvent)s for transports with a
//! hard message-size ceiling.
//!
//! The [`Registry`](registry::Registry) reconstructs a concrete event from raw
//! bytes without the caller knowing its type in advance.

pub mod block;
pub mod codec;
pub mod error;
pub mod event;
pub mod frame;
pub mod registry;
pub mod segment;
pub mod shift;

pub use error::{CodecError, DuplicateRegistration};
pub use event::Event;
pub use frame::FrameTags;
pub use registry::Registry;
