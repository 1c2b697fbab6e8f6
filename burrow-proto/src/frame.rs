//! The tag header framing every transport unit.
//!
//! Wire shape: magic `0xCAFE` as a big-endian u16, then one var-string
//! holding the session token, with the user token (when present) joined on
//! by the private `"@@"` separator. Receivers split on the first separator.

use crate::codec::{put_str, put_u16_be, Reader};
use crate::error::CodecError;
use crate::event::{encode_event, Event};

pub const MAGIC: u16 = 0xCAFE;

/// Tokens may not contain this sequence.
const USER_SEPARATOR: &str = "@@";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameTags {
    pub token: String,
    pub user: Option<String>,
}

impl FrameTags {
    pub fn new(token: impl Into<String>) -> Self {
        FrameTags { token: token.into(), user: None }
    }

    pub fn with_user(token: impl Into<String>, user: impl Into<String>) -> Self {
        FrameTags { token: token.into(), user: Some(user.into()) }
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        put_u16_be(buf, MAGIC);
        match &self.user {
            Some(user) => put_str(buf, &format!("{}{}{}", self.token, USER_SEPARATOR, user)),
            None => put_str(buf, &self.token),
        }
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let magic = r.u16_be()?;
        if magic != MAGIC {
            return Err(CodecError::BadMagic { found: magic });
        }
        let joined = r.string()?;
        match joined.split_once(USER_SEPARATOR) {
            Some((token, user)) => Ok(FrameTags {
                token: token.to_string(),
                user: Some(user.to_string()),
            }),
            None => Ok(FrameTags { token: joined, user: None }),
        }
    }
}

/// Serializes a complete transport unit: tag header, event header, payload.
pub fn encode_framed(buf: &mut Vec<u8>, tags: &FrameTags, ev: &dyn Event) {
    tags.encode(buf);
    encode_event(buf, ev);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::HttpChunkEvent;
    use crate::registry::Registry;

    #[test]
    fn tags_round_trip_without_user() {
        let tags = FrameTags::new("s3kr1t");
        let mut buf = Vec::new();
        tags.encode(&mut buf);
        assert_eq!(FrameTags::decode(&mut Reader::new(&buf)).unwrap(), tags);
    }

    #[test]
    fn tags_round_trip_with_user() {
        let tags = FrameTags::with_user("s3kr1t", "alice");
        let mut buf = Vec::new();
        tags.encode(&mut buf);
        assert_eq!(FrameTags::decode(&mut Reader::new(&buf)).unwrap(), tags);
    }

    #[test]
    fn bad_magic_is_a_hard_failure() {
        let mut buf = Vec::new();
        put_u16_be(&mut buf, 0xBEEF);
        put_str(&mut buf, "token");
        assert_eq!(
            FrameTags::decode(&mut Reader::new(&buf)),
            Err(CodecError::BadMagic { found: 0xBEEF })
        );
    }

    #[test]
    fn framed_unit_parses_back() {
        let registry = Registry::with_core_events().unwrap();
        let ev = HttpChunkEvent { content: b"abc".to_vec(), hash: 3 };
        let mut buf = Vec::new();
        encode_framed(&mut buf, &FrameTags::new("tok"), &ev);
        let (tags, parsed) = registry.parse_framed(&buf).unwrap();
        assert_eq!(tags.token, "tok");
        assert_eq!(parsed.hash(), 3);
    }
}
