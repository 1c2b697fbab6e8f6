//! Transform wrappers: events that hold one nested event and apply a
//! reversible byte transform to its serialized form.
//!
//! Senders nest them encrypt-outermost so compression sees plaintext:
//! `EncryptEvent(CompressEvent(payload))`. The format itself does not bound
//! the nesting depth.

use crate::block::{block_compress, block_decompress};
use crate::codec::{put_uvarint, Reader};
use crate::error::CodecError;
use crate::event::{
    encode_event, event_identity, Event, RegisteredEvent, COMPRESS_EVENT_TYPE,
    ENCRYPT_EVENT_TYPE,
};
use crate::registry::Registry;
use crate::shift::{shift_decrypt, shift_encrypt};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum CompressMethod {
    #[default]
    None,
    Block,
}

impl CompressMethod {
    pub fn code(self) -> u32 {
        match self {
            CompressMethod::None => 0,
            CompressMethod::Block => 1,
        }
    }

    /// Strict mapping, used on decode where an unknown code means the bytes
    /// cannot be interpreted.
    pub fn from_code(code: u32) -> Result<Self, CodecError> {
        match code {
            0 => Ok(CompressMethod::None),
            1 => Ok(CompressMethod::Block),
            other => Err(CodecError::UnsupportedCompress(other)),
        }
    }

    /// Lossy mapping for the send path: an unknown code degrades to no
    /// compression rather than failing the encode.
    pub fn from_code_lossy(code: u32) -> Self {
        Self::from_code(code).unwrap_or(CompressMethod::None)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum EncryptMethod {
    #[default]
    None,
    Shift,
}

impl EncryptMethod {
    pub fn code(self) -> u32 {
        match self {
            EncryptMethod::None => 0,
            EncryptMethod::Shift => 1,
        }
    }

    pub fn from_code(code: u32) -> Result<Self, CodecError> {
        match code {
            0 => Ok(EncryptMethod::None),
            1 => Ok(EncryptMethod::Shift),
            other => Err(CodecError::UnsupportedEncrypt(other)),
        }
    }

    pub fn from_code_lossy(code: u32) -> Self {
        Self::from_code(code).unwrap_or(EncryptMethod::None)
    }
}

/// Wraps an inner event whose serialized bytes are block-compressed.
///
/// `inner` is only `None` on a freshly constructed prototype before decode or
/// after [`take_inner`](Self::take_inner); encoding such a wrapper produces a
/// frame no decoder accepts.
#[derive(Default)]
pub struct CompressEvent {
    pub method: CompressMethod,
    inner: Option<Box<dyn Event>>,
    pub hash: u32,
}

impl CompressEvent {
    pub fn new(method: CompressMethod, inner: Box<dyn Event>) -> Self {
        let hash = inner.hash();
        CompressEvent { method, inner: Some(inner), hash }
    }

    pub fn inner(&self) -> Option<&dyn Event> {
        self.inner.as_deref()
    }

    pub fn take_inner(&mut self) -> Option<Box<dyn Event>> {
        self.inner.take()
    }
}

impl Event for CompressEvent {
    event_identity!(CompressEvent, COMPRESS_EVENT_TYPE);

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        put_uvarint(buf, u64::from(self.method.code()));
        let mut scratch = Vec::new();
        if let Some(inner) = &self.inner {
            encode_event(&mut scratch, inner.as_ref());
        }
        match self.method {
            CompressMethod::None => buf.extend_from_slice(&scratch),
            CompressMethod::Block => buf.extend_from_slice(&block_compress(&scratch)),
        }
    }

    fn decode_payload(
        &mut self,
        r: &mut Reader<'_>,
        registry: &Registry,
    ) -> Result<(), CodecError> {
        let code = u32::try_from(r.uvarint()?)
            .map_err(|_| CodecError::InvalidValue("compress method"))?;
        self.method = CompressMethod::from_code(code)?;
        let inner = match self.method {
            CompressMethod::None => registry.parse_event(r)?,
            CompressMethod::Block => {
                let plain = block_decompress(r.rest())?;
                registry.parse_event(&mut Reader::new(&plain))?
            }
        };
        self.inner = Some(inner);
        Ok(())
    }
}

impl RegisteredEvent for CompressEvent {
    const TYPE_ID: u32 = COMPRESS_EVENT_TYPE;
}

/// Wraps an inner event whose serialized bytes pass through a stream cipher.
/// Same shape as [`CompressEvent`] with the cipher code in place of the
/// compressor code.
#[derive(Default)]
pub struct EncryptEvent {
    pub method: EncryptMethod,
    inner: Option<Box<dyn Event>>,
    pub hash: u32,
}

impl EncryptEvent {
    pub fn new(method: EncryptMethod, inner: Box<dyn Event>) -> Self {
        let hash = inner.hash();
        EncryptEvent { method, inner: Some(inner), hash }
    }

    pub fn inner(&self) -> Option<&dyn Event> {
        self.inner.as_deref()
    }

    pub fn take_inner(&mut self) -> Option<Box<dyn Event>> {
        self.inner.take()
    }
}

impl Event for EncryptEvent {
    event_identity!(EncryptEvent, ENCRYPT_EVENT_TYPE);

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        put_uvarint(buf, u64::from(self.method.code()));
        let mut scratch = Vec::new();
        if let Some(inner) = &self.inner {
            encode_event(&mut scratch, inner.as_ref());
        }
        if let EncryptMethod::Shift = self.method {
            shift_encrypt(&mut scratch);
        }
        buf.extend_from_slice(&scratch);
    }

    fn decode_payload(
        &mut self,
        r: &mut Reader<'_>,
        registry: &Registry,
    ) -> Result<(), CodecError> {
        let code = u32::try_from(r.uvarint()?)
            .map_err(|_| CodecError::InvalidValue("encrypt method"))?;
        self.method = EncryptMethod::from_code(code)?;
        let inner = match self.method {
            EncryptMethod::None => registry.parse_event(r)?,
            EncryptMethod::Shift => {
                let mut plain = r.rest().to_vec();
                shift_decrypt(&mut plain);
                registry.parse_event(&mut Reader::new(&plain))?
            }
        };
        self.inner = Some(inner);
        Ok(())
    }
}

impl RegisteredEvent for EncryptEvent {
    const TYPE_ID: u32 = ENCRYPT_EVENT_TYPE;
}
