//! HTTP-shaped events: a normalized request, its response, streamed body
//! chunks, and connection status markers.

use crate::codec::{put_bytes, put_str, put_uvarint, Reader};
use crate::error::CodecError;
use crate::event::{
    event_identity, read_u32, Event, RegisteredEvent, HTTP_CHUNK_EVENT_TYPE,
    HTTP_CONNECTION_EVENT_TYPE, HTTP_ERROR_EVENT_TYPE, HTTP_REQUEST_EVENT_TYPE,
    HTTP_RESPONSE_EVENT_TYPE,
};
use crate::registry::Registry;

fn encode_headers(buf: &mut Vec<u8>, headers: &[(String, String)]) {
    put_uvarint(buf, headers.len() as u64);
    for (name, value) in headers {
        put_str(buf, name);
        put_str(buf, value);
    }
}

fn decode_headers(r: &mut Reader<'_>) -> Result<Vec<(String, String)>, CodecError> {
    let count = r.uvarint()?;
    let mut headers = Vec::with_capacity(count.min(128) as usize);
    for _ in 0..count {
        let name = r.string()?;
        let value = r.string()?;
        headers.push((name, value));
    }
    Ok(headers)
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<usize> {
    headers.iter().position(|(n, _)| n.eq_ignore_ascii_case(name))
}

/// A normalized HTTP request. Headers keep their arrival order; lookups are
/// case-insensitive.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HttpRequestEvent {
    pub url: String,
    pub method: String,
    pub headers: Vec<(String, String)>,
    pub content: Vec<u8>,
    pub hash: u32,
}

impl HttpRequestEvent {
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name).map(|i| self.headers[i].1.as_str())
    }

    /// Replaces the first header with this name, or appends one.
    pub fn set_header(&mut self, name: &str, value: &str) {
        match find_header(&self.headers, name) {
            Some(i) => self.headers[i].1 = value.to_string(),
            None => self.headers.push((name.to_string(), value.to_string())),
        }
    }

    pub fn add_header(&mut self, name: &str, value: &str) {
        self.headers.push((name.to_string(), value.to_string()));
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    /// Serializes the request as raw HTTP/1.1 bytes, for backends that speak
    /// to the destination server directly.
    pub fn to_raw(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256 + self.content.len());
        out.extend_from_slice(self.method.as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.url.as_bytes());
        out.extend_from_slice(b" HTTP/1.1\r\n");
        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.content);
        out
    }
}

impl Event for HttpRequestEvent {
    event_identity!(HttpRequestEvent, HTTP_REQUEST_EVENT_TYPE);

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        put_str(buf, &self.url);
        put_str(buf, &self.method);
        encode_headers(buf, &self.headers);
        put_bytes(buf, &self.content);
    }

    fn decode_payload(
        &mut self,
        r: &mut Reader<'_>,
        _registry: &Registry,
    ) -> Result<(), CodecError> {
        self.url = r.string()?;
        self.method = r.string()?;
        self.headers = decode_headers(r)?;
        self.content = r.bytes()?;
        Ok(())
    }
}

impl RegisteredEvent for HttpRequestEvent {
    const TYPE_ID: u32 = HTTP_REQUEST_EVENT_TYPE;
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HttpResponseEvent {
    pub status: u32,
    pub headers: Vec<(String, String)>,
    pub content: Vec<u8>,
    pub hash: u32,
}

impl HttpResponseEvent {
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name).map(|i| self.headers[i].1.as_str())
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        match find_header(&self.headers, name) {
            Some(i) => self.headers[i].1 = value.to_string(),
            None => self.headers.push((name.to_string(), value.to_string())),
        }
    }

    /// Serializes a well-formed HTTP/1.1 response head plus body.
    pub fn to_raw(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128 + self.content.len());
        out.extend_from_slice(b"HTTP/1.1 ");
        out.extend_from_slice(self.status.to_string().as_bytes());
        out.push(b' ');
        out.extend_from_slice(status_reason(self.status).as_bytes());
        out.extend_from_slice(b"\r\n");
        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.content);
        out
    }
}

fn status_reason(status: u32) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        408 => "Request Timeout",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

impl Event for HttpResponseEvent {
    event_identity!(HttpResponseEvent, HTTP_RESPONSE_EVENT_TYPE);

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        put_uvarint(buf, u64::from(self.status));
        encode_headers(buf, &self.headers);
        put_bytes(buf, &self.content);
    }

    fn decode_payload(
        &mut self,
        r: &mut Reader<'_>,
        _registry: &Registry,
    ) -> Result<(), CodecError> {
        self.status = read_u32(r, "http status")?;
        self.headers = decode_headers(r)?;
        self.content = r.bytes()?;
        Ok(())
    }
}

impl RegisteredEvent for HttpResponseEvent {
    const TYPE_ID: u32 = HTTP_RESPONSE_EVENT_TYPE;
}

/// A piece of a streamed response body that did not fit the first response
/// event.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HttpChunkEvent {
    pub content: Vec<u8>,
    pub hash: u32,
}

impl Event for HttpChunkEvent {
    event_identity!(HttpChunkEvent, HTTP_CHUNK_EVENT_TYPE);

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        put_bytes(buf, &self.content);
    }

    fn decode_payload(
        &mut self,
        r: &mut Reader<'_>,
        _registry: &Registry,
    ) -> Result<(), CodecError> {
        self.content = r.bytes()?;
        Ok(())
    }
}

impl RegisteredEvent for HttpChunkEvent {
    const TYPE_ID: u32 = HTTP_CHUNK_EVENT_TYPE;
}

/// A backend-side failure translated into HTTP terms.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HttpErrorEvent {
    pub code: u32,
    pub cause: String,
    pub hash: u32,
}

impl Event for HttpErrorEvent {
    event_identity!(HttpErrorEvent, HTTP_ERROR_EVENT_TYPE);

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        put_uvarint(buf, u64::from(self.code));
        put_str(buf, &self.cause);
    }

    fn decode_payload(
        &mut self,
        r: &mut Reader<'_>,
        _registry: &Registry,
    ) -> Result<(), CodecError> {
        self.code = read_u32(r, "error code")?;
        self.cause = r.string()?;
        Ok(())
    }
}

impl RegisteredEvent for HttpErrorEvent {
    const TYPE_ID: u32 = HTTP_ERROR_EVENT_TYPE;
}

/// Connection lifecycle marker for a proxied HTTP exchange.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HttpConnectionEvent {
    pub status: u32,
    pub hash: u32,
}

impl HttpConnectionEvent {
    pub const STATUS_OPEN: u32 = 1;
    pub const STATUS_CLOSED: u32 = 2;
}

impl Event for HttpConnectionEvent {
    event_identity!(HttpConnectionEvent, HTTP_CONNECTION_EVENT_TYPE);

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        put_uvarint(buf, u64::from(self.status));
    }

    fn decode_payload(
        &mut self,
        r: &mut Reader<'_>,
        _registry: &Registry,
    ) -> Result<(), CodecError> {
        self.status = read_u32(r, "connection status")?;
        Ok(())
    }
}

impl RegisteredEvent for HttpConnectionEvent {
    const TYPE_ID: u32 = HTTP_CONNECTION_EVENT_TYPE;
}
