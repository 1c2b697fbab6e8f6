use thiserror::Error;

/// Errors produced while decoding wire data.
///
/// All of these are fatal to the single message being decoded, never to the
/// process; connections stay usable unless the transport requires one message
/// per round trip.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// Fewer bytes remained in the buffer than a field declared. A short read
    /// is always an error, never a partial success.
    #[error("unexpected end of buffer")]
    Truncated,

    /// A varint had a continuation bit set past the 10th group.
    #[error("varint does not fit in 64 bits")]
    Overlong,

    /// A string field did not hold valid UTF-8.
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,

    /// The tag header's magic number did not match [`frame::MAGIC`](crate::frame::MAGIC).
    #[error("bad magic number {found:#06x}")]
    BadMagic { found: u16 },

    /// The header named a `(type, version)` pair nothing was registered for.
    #[error("no event registered for type {type_id} version {version}")]
    Unregistered { type_id: u32, version: u32 },

    /// A compress wrapper carried a method code this build cannot reverse.
    #[error("unsupported compress method code {0}")]
    UnsupportedCompress(u32),

    /// An encrypt wrapper carried a method code this build cannot reverse.
    #[error("unsupported encrypt method code {0}")]
    UnsupportedEncrypt(u32),

    /// A compressed block violated the format's window or length bounds.
    #[error("corrupt compressed block: {0}")]
    CorruptBlock(&'static str),

    /// A field held a value outside its legal wire range.
    #[error("invalid value for {0}")]
    InvalidValue(&'static str),

    /// A segment contradicted the set it belongs to (mismatched total,
    /// out-of-range or duplicate sequence).
    #[error("malformed segment: {0}")]
    BadSegment(&'static str),
}

/// Returned by [`Registry::register`](crate::Registry::register) when a
/// `(type, version)` pair is claimed twice. Duplicate registration is a
/// programming error, not a runtime condition to tolerate.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("event type {type_id} version {version} is already registered")]
pub struct DuplicateRegistration {
    pub type_id: u32,
    pub version: u32,
}
