//! Raw-tunnel events: ordered byte chunks and connection status changes for
//! CONNECT and SOCKS tunnels relayed through a backend.

use crate::codec::{put_bytes, put_str, put_uvarint, Reader};
use crate::error::CodecError;
use crate::event::{
    event_identity, read_u32, Event, RegisteredEvent, SOCKET_CONNECTION_EVENT_TYPE,
    TCP_CHUNK_EVENT_TYPE,
};
use crate::registry::Registry;

/// A slice of raw tunnel traffic. `sequence` preserves write order when
/// chunks travel over a transport that may reorder independent units.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TcpChunkEvent {
    pub sequence: u32,
    pub content: Vec<u8>,
    pub hash: u32,
}

impl Event for TcpChunkEvent {
    event_identity!(TcpChunkEvent, TCP_CHUNK_EVENT_TYPE);

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        put_uvarint(buf, u64::from(self.sequence));
        put_bytes(buf, &self.content);
    }

    fn decode_payload(
        &mut self,
        r: &mut Reader<'_>,
        _registry: &Registry,
    ) -> Result<(), CodecError> {
        self.sequence = read_u32(r, "chunk sequence")?;
        self.content = r.bytes()?;
        Ok(())
    }
}

impl RegisteredEvent for TcpChunkEvent {
    const TYPE_ID: u32 = TCP_CHUNK_EVENT_TYPE;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    #[default]
    Connected,
    Closed,
}

impl ConnectionStatus {
    pub fn code(self) -> u32 {
        match self {
            ConnectionStatus::Connected => 1,
            ConnectionStatus::Closed => 2,
        }
    }

    pub fn from_code(code: u32) -> Result<Self, CodecError> {
        match code {
            1 => Ok(ConnectionStatus::Connected),
            2 => Ok(ConnectionStatus::Closed),
            _ => Err(CodecError::InvalidValue("connection status")),
        }
    }
}

/// Announces that the remote side of a tunnel has opened or gone away.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SocketConnectionEvent {
    pub status: ConnectionStatus,
    pub addr: String,
    pub hash: u32,
}

impl Event for SocketConnectionEvent {
    event_identity!(SocketConnectionEvent, SOCKET_CONNECTION_EVENT_TYPE);

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        put_uvarint(buf, u64::from(self.status.code()));
        put_str(buf, &self.addr);
    }

    fn decode_payload(
        &mut self,
        r: &mut Reader<'_>,
        _registry: &Registry,
    ) -> Result<(), CodecError> {
        self.status = ConnectionStatus::from_code(read_u32(r, "connection status")?)?;
        self.addr = r.string()?;
        Ok(())
    }
}

impl RegisteredEvent for SocketConnectionEvent {
    const TYPE_ID: u32 = SOCKET_CONNECTION_EVENT_TYPE;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;

    #[test]
    fn chunk_round_trip() {
        let registry = Registry::with_core_events().unwrap();
        let ev = TcpChunkEvent { sequence: 17, content: vec![1, 2, 3], hash: 0 };
        let mut buf = Vec::new();
        ev.encode_payload(&mut buf);
        let mut decoded = TcpChunkEvent::default();
        decoded.decode_payload(&mut Reader::new(&buf), &registry).unwrap();
        assert_eq!(decoded, ev);
    }

    #[test]
    fn connection_round_trip() {
        let registry = Registry::with_core_events().unwrap();
        let ev = SocketConnectionEvent {
            status: ConnectionStatus::Closed,
            addr: "example.com:443".to_string(),
            hash: 0,
        };
        let mut buf = Vec::new();
        ev.encode_payload(&mut buf);
        let mut decoded = SocketConnectionEvent::default();
        decoded.decode_payload(&mut Reader::new(&buf), &registry).unwrap();
        assert_eq!(decoded, ev);
    }

    #[test]
    fn unknown_status_code_fails() {
        assert!(ConnectionStatus::from_code(9).is_err());
    }
}
