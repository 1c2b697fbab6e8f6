//! A generic structured-value codec, kept as a fallback for ad-hoc payloads
//! and testing aids.
//!
//! Every wire-visible event type implements its own explicit encode/decode;
//! this module must never carry protocol-stability-sensitive data, since its
//! encoding follows the shape of the Rust value rather than a frozen schema.
//!
//! Encoding rules: booleans are 0/1 uvarints, unsigned integers are uvarints,
//! signed integers are zig-zag varints, strings are length-prefixed bytes,
//! sequences are a uvarint count followed by their elements (an empty sequence
//! and an absent one encode identically), maps are a uvarint count followed by
//! interleaved key/value pairs in unspecified order, and boxed values encode
//! the referenced value directly (decoding always allocates a fresh box).

use std::collections::HashMap;
use std::hash::Hash;

use crate::codec::{put_str, put_uvarint, put_varint, Reader};
use crate::error::CodecError;

/// A value that can be encoded to and decoded from the wire with the generic
/// field rules above.
pub trait WireValue: Sized {
    fn encode_value(&self, buf: &mut Vec<u8>);
    fn decode_value(r: &mut Reader<'_>) -> Result<Self, CodecError>;
}

impl WireValue for bool {
    fn encode_value(&self, buf: &mut Vec<u8>) {
        put_uvarint(buf, u64::from(*self));
    }

    fn decode_value(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(r.uvarint()? != 0)
    }
}

macro_rules! unsigned_wire_value {
    ($($t:ty),*) => {$(
        impl WireValue for $t {
            fn encode_value(&self, buf: &mut Vec<u8>) {
                put_uvarint(buf, u64::from(*self));
            }

            fn decode_value(r: &mut Reader<'_>) -> Result<Self, CodecError> {
                <$t>::try_from(r.uvarint()?).map_err(|_| CodecError::InvalidValue(stringify!($t)))
            }
        }
    )*};
}

macro_rules! signed_wire_value {
    ($($t:ty),*) => {$(
        impl WireValue for $t {
            fn encode_value(&self, buf: &mut Vec<u8>) {
                put_varint(buf, i64::from(*self));
            }

            fn decode_value(r: &mut Reader<'_>) -> Result<Self, CodecError> {
                <$t>::try_from(r.varint()?).map_err(|_| CodecError::InvalidValue(stringify!($t)))
            }
        }
    )*};
}

unsigned_wire_value!(u8, u16, u32);
signed_wire_value!(i8, i16, i32);

impl WireValue for u64 {
    fn encode_value(&self, buf: &mut Vec<u8>) {
        put_uvarint(buf, *self);
    }

    fn decode_value(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        r.uvarint()
    }
}

impl WireValue for i64 {
    fn encode_value(&self, buf: &mut Vec<u8>) {
        put_varint(buf, *self);
    }

    fn decode_value(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        r.varint()
    }
}

impl WireValue for String {
    fn encode_value(&self, buf: &mut Vec<u8>) {
        put_str(buf, self);
    }

    fn decode_value(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        r.string()
    }
}

impl<T: WireValue> WireValue for Vec<T> {
    fn encode_value(&self, buf: &mut Vec<u8>) {
        put_uvarint(buf, self.len() as u64);
        for ele in self {
            ele.encode_value(buf);
        }
    }

    fn decode_value(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let len = r.uvarint()?;
        let mut v = Vec::with_capacity(len.min(1024) as usize);
        for _ in 0..len {
            v.push(T::decode_value(r)?);
        }
        Ok(v)
    }
}

impl<K, V> WireValue for HashMap<K, V>
where
    K: WireValue + Eq + Hash,
    V: WireValue,
{
    fn encode_value(&self, buf: &mut Vec<u8>) {
        put_uvarint(buf, self.len() as u64);
        for (k, v) in self {
            k.encode_value(buf);
            v.encode_value(buf);
        }
    }

    fn decode_value(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let len = r.uvarint()?;
        let mut m = HashMap::with_capacity(len.min(1024) as usize);
        for _ in 0..len {
            let k = K::decode_value(r)?;
            let v = V::decode_value(r)?;
            m.insert(k, v);
        }
        Ok(m)
    }
}

impl<T: WireValue> WireValue for Box<T> {
    fn encode_value(&self, buf: &mut Vec<u8>) {
        (**self).encode_value(buf);
    }

    fn decode_value(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Box::new(T::decode_value(r)?))
    }
}

/// Implements [`WireValue`] for a struct by encoding its fields in declaration
/// order, the way the generic codec treats any structured value.
#[macro_export]
macro_rules! wire_value_struct {
    ($name:ident { $($field:ident),+ $(,)? }) => {
        impl $crate::codec::value::WireValue for $name {
            fn encode_value(&self, buf: &mut Vec<u8>) {
                $(self.$field.encode_value(buf);)+
            }

            fn decode_value(
                r: &mut $crate::codec::Reader<'_>,
            ) -> Result<Self, $crate::error::CodecError> {
                Ok($name {
                    $($field: $crate::codec::value::WireValue::decode_value(r)?,)+
                })
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Sample {
        flag: bool,
        count: i64,
        name: String,
        tags: Vec<String>,
        scores: HashMap<String, u32>,
        boxed: Box<u64>,
    }

    wire_value_struct!(Sample {
        flag,
        count,
        name,
        tags,
        scores,
        boxed,
    });

    #[test]
    fn struct_round_trip() {
        let mut scores = HashMap::new();
        scores.insert("a".to_string(), 1u32);
        scores.insert("b".to_string(), 200);
        let sample = Sample {
            flag: true,
            count: -42,
            name: "burrow".to_string(),
            tags: vec!["x".to_string(), "y".to_string()],
            scores,
            boxed: Box::new(99),
        };

        let mut buf = Vec::new();
        sample.encode_value(&mut buf);
        let decoded = Sample::decode_value(&mut Reader::new(&buf)).unwrap();
        assert_eq!(decoded, sample);
    }

    #[test]
    fn empty_and_absent_sequences_encode_identically() {
        let mut a = Vec::new();
        Vec::<String>::new().encode_value(&mut a);
        let mut b = Vec::new();
        put_uvarint(&mut b, 0);
        assert_eq!(a, b);
    }

    #[test]
    fn truncated_struct_fails() {
        let sample = Sample {
            flag: false,
            count: 7,
            name: "n".to_string(),
            tags: Vec::new(),
            scores: HashMap::new(),
            boxed: Box::new(3),
        };
        let mut buf = Vec::new();
        sample.encode_value(&mut buf);
        buf.truncate(buf.len() - 1);
        assert!(Sample::decode_value(&mut Reader::new(&buf)).is_err());
    }

    #[test]
    fn map_round_trips_regardless_of_order() {
        let mut m = HashMap::new();
        for i in 0..32u32 {
            m.insert(format!("key-{i}"), i);
        }
        let mut buf = Vec::new();
        m.encode_value(&mut buf);
        let decoded = HashMap::<String, u32>::decode_value(&mut Reader::new(&buf)).unwrap();
        assert_eq!(decoded, m);
    }
}
