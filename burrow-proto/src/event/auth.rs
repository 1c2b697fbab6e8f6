//! Authentication and administrative envelope events.
//!
//! Tokens are carried mechanically; no policy is attached to any of these on
//! this side of the wire.

use crate::codec::{put_str, put_uvarint, Reader};
use crate::error::CodecError;
use crate::event::{
    event_identity, read_u32, Event, RegisteredEvent, ADMIN_RESPONSE_EVENT_TYPE,
    AUTH_REQUEST_EVENT_TYPE, AUTH_RESPONSE_EVENT_TYPE, USER_LOGIN_EVENT_TYPE,
};
use crate::registry::Registry;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AuthRequestEvent {
    pub appid: String,
    pub user: String,
    pub passwd: String,
    pub hash: u32,
}

impl Event for AuthRequestEvent {
    event_identity!(AuthRequestEvent, AUTH_REQUEST_EVENT_TYPE);

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        put_str(buf, &self.appid);
        put_str(buf, &self.user);
        put_str(buf, &self.passwd);
    }

    fn decode_payload(
        &mut self,
        r: &mut Reader<'_>,
        _registry: &Registry,
    ) -> Result<(), CodecError> {
        self.appid = r.string()?;
        self.user = r.string()?;
        self.passwd = r.string()?;
        Ok(())
    }
}

impl RegisteredEvent for AuthRequestEvent {
    const TYPE_ID: u32 = AUTH_REQUEST_EVENT_TYPE;
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AuthResponseEvent {
    pub appid: String,
    pub token: String,
    pub error: String,
    /// Bit set of server-granted capabilities; zero grants nothing special.
    pub capability: u64,
    pub hash: u32,
}

impl Event for AuthResponseEvent {
    event_identity!(AuthResponseEvent, AUTH_RESPONSE_EVENT_TYPE);

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        put_str(buf, &self.appid);
        put_str(buf, &self.token);
        put_str(buf, &self.error);
        put_uvarint(buf, self.capability);
    }

    fn decode_payload(
        &mut self,
        r: &mut Reader<'_>,
        _registry: &Registry,
    ) -> Result<(), CodecError> {
        self.appid = r.string()?;
        self.token = r.string()?;
        self.error = r.string()?;
        self.capability = r.uvarint()?;
        Ok(())
    }
}

impl RegisteredEvent for AuthResponseEvent {
    const TYPE_ID: u32 = AUTH_RESPONSE_EVENT_TYPE;
}

/// Announces the local user to a relay worker when the pull loop starts, so
/// the worker can associate queued replies with this client.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UserLoginEvent {
    pub user: String,
    pub hash: u32,
}

impl Event for UserLoginEvent {
    event_identity!(UserLoginEvent, USER_LOGIN_EVENT_TYPE);

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        put_str(buf, &self.user);
    }

    fn decode_payload(
        &mut self,
        r: &mut Reader<'_>,
        _registry: &Registry,
    ) -> Result<(), CodecError> {
        self.user = r.string()?;
        Ok(())
    }
}

impl RegisteredEvent for UserLoginEvent {
    const TYPE_ID: u32 = USER_LOGIN_EVENT_TYPE;
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AdminResponseEvent {
    pub response: String,
    pub error_cause: String,
    pub errno: u32,
    pub hash: u32,
}

impl Event for AdminResponseEvent {
    event_identity!(AdminResponseEvent, ADMIN_RESPONSE_EVENT_TYPE);

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        put_str(buf, &self.response);
        put_str(buf, &self.error_cause);
        put_uvarint(buf, u64::from(self.errno));
    }

    fn decode_payload(
        &mut self,
        r: &mut Reader<'_>,
        _registry: &Registry,
    ) -> Result<(), CodecError> {
        self.response = r.string()?;
        self.error_cause = r.string()?;
        self.errno = read_u32(r, "admin errno")?;
        Ok(())
    }
}

impl RegisteredEvent for AdminResponseEvent {
    const TYPE_ID: u32 = ADMIN_RESPONSE_EVENT_TYPE;
}
