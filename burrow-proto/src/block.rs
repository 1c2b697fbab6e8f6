//! LZ77-style block compression.
//!
//! Format: a uvarint decoded-length header followed by tagged elements. The
//! low two bits of each tag byte select the element class: literal run (length
//! in 1 to 5 bytes depending on magnitude), one-byte-offset copy, or
//! two-byte-offset copy. The four-byte-offset copy class is a deliberate
//! format restriction and is rejected on decode.

use crate::codec::{put_uvarint, Reader};
use crate::error::CodecError;

const TAG_LITERAL: u8 = 0b00;
const TAG_COPY1: u8 = 0b01;
const TAG_COPY2: u8 = 0b10;
const TAG_COPY4: u8 = 0b11;

/// Back-references never reach further than a two-byte offset can express.
const MAX_OFFSET: usize = 65535;

const HASH_TABLE_BITS: u32 = 14;

fn load32(src: &[u8], i: usize) -> u32 {
    u32::from_le_bytes([src[i], src[i + 1], src[i + 2], src[i + 3]])
}

fn hash32(v: u32) -> usize {
    (v.wrapping_mul(0x1e35a7bd) >> (32 - HASH_TABLE_BITS)) as usize
}

fn emit_literal(dst: &mut Vec<u8>, lit: &[u8]) {
    if lit.is_empty() {
        return;
    }
    let n = lit.len() - 1;
    if n < 60 {
        dst.push((n as u8) << 2 | TAG_LITERAL);
    } else if n < 1 << 8 {
        dst.push(60 << 2 | TAG_LITERAL);
        dst.push(n as u8);
    } else if n < 1 << 16 {
        dst.push(61 << 2 | TAG_LITERAL);
        dst.extend_from_slice(&(n as u16).to_le_bytes());
    } else if n < 1 << 24 {
        dst.push(62 << 2 | TAG_LITERAL);
        dst.extend_from_slice(&(n as u32).to_le_bytes()[..3]);
    } else {
        dst.push(63 << 2 | TAG_LITERAL);
        dst.extend_from_slice(&(n as u32).to_le_bytes());
    }
    dst.extend_from_slice(lit);
}

fn emit_copy(dst: &mut Vec<u8>, offset: usize, mut length: usize) {
    // Long matches split into 64-byte copies, leaving at least 4 bytes for
    // the final copy so it stays expressible as a copy1 when the offset is
    // short.
    while length >= 68 {
        dst.push(63 << 2 | TAG_COPY2);
        dst.extend_from_slice(&(offset as u16).to_le_bytes());
        length -= 64;
    }
    if length > 64 {
        dst.push(59 << 2 | TAG_COPY2);
        dst.extend_from_slice(&(offset as u16).to_le_bytes());
        length -= 60;
    }
    if length >= 4 && length <= 11 && offset < 2048 {
        dst.push(((offset >> 8) as u8) << 5 | ((length - 4) as u8) << 2 | TAG_COPY1);
        dst.push(offset as u8);
    } else {
        dst.push(((length - 1) as u8) << 2 | TAG_COPY2);
        dst.extend_from_slice(&(offset as u16).to_le_bytes());
    }
}

/// Compresses `src` into a self-contained block.
pub fn block_compress(src: &[u8]) -> Vec<u8> {
    let mut dst = Vec::with_capacity(src.len() / 2 + 16);
    put_uvarint(&mut dst, src.len() as u64);
    if src.len() < 4 {
        emit_literal(&mut dst, src);
        return dst;
    }

    let mut table = vec![0usize; 1 << HASH_TABLE_BITS];
    let mut lit_start = 0;
    let mut i = 0;
    while i + 4 <= src.len() {
        let h = hash32(load32(src, i));
        let prev = table[h];
        table[h] = i + 1;
        let candidate = prev.wrapping_sub(1);
        if prev != 0
            && i - candidate <= MAX_OFFSET
            && load32(src, candidate) == load32(src, i)
        {
            let mut len = 4;
            while i + len < src.len() && src[candidate + len] == src[i + len] {
                len += 1;
            }
            emit_literal(&mut dst, &src[lit_start..i]);
            emit_copy(&mut dst, i - candidate, len);
            i += len;
            lit_start = i;
        } else {
            i += 1;
        }
    }
    emit_literal(&mut dst, &src[lit_start..]);
    dst
}

/// Decompresses a block produced by [`block_compress`] or any compatible
/// encoder. Rejects malformed input rather than producing partial output.
pub fn block_decompress(src: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut r = Reader::new(src);
    let decoded_len = usize::try_from(r.uvarint()?)
        .map_err(|_| CodecError::CorruptBlock("declared length too large"))?;
    let body = r.rest();

    let mut dst = Vec::with_capacity(decoded_len.min(1 << 20));
    let mut pos = 0;
    while pos < body.len() {
        let tag = body[pos];
        pos += 1;
        match tag & 0b11 {
            TAG_LITERAL => {
                let len_field = (tag >> 2) as usize;
                let lit_len = if len_field < 60 {
                    len_field + 1
                } else {
                    let extra = len_field - 59;
                    if pos + extra > body.len() {
                        return Err(CodecError::Truncated);
                    }
                    let mut n = 0usize;
                    for (shift, &b) in body[pos..pos + extra].iter().enumerate() {
                        n |= (b as usize) << (shift * 8);
                    }
                    pos += extra;
                    n + 1
                };
                if pos + lit_len > body.len() {
                    return Err(CodecError::Truncated);
                }
                if dst.len() + lit_len > decoded_len {
                    return Err(CodecError::CorruptBlock("literal overruns declared length"));
                }
                dst.extend_from_slice(&body[pos..pos + lit_len]);
                pos += lit_len;
            }
            TAG_COPY1 => {
                if pos >= body.len() {
                    return Err(CodecError::Truncated);
                }
                let length = 4 + ((tag >> 2) & 0x7) as usize;
                let offset = ((tag & 0xe0) as usize) << 3 | body[pos] as usize;
                pos += 1;
                copy_back(&mut dst, offset, length, decoded_len)?;
            }
            TAG_COPY2 => {
                if pos + 2 > body.len() {
                    return Err(CodecError::Truncated);
                }
                let length = (tag >> 2) as usize + 1;
                let offset = body[pos] as usize | (body[pos + 1] as usize) << 8;
                pos += 2;
                copy_back(&mut dst, offset, length, decoded_len)?;
            }
            _ => return Err(CodecError::CorruptBlock("four-byte-offset copy")),
        }
    }
    if dst.len() != decoded_len {
        return Err(CodecError::CorruptBlock("output shorter than declared length"));
    }
    Ok(dst)
}

fn copy_back(
    dst: &mut Vec<u8>,
    offset: usize,
    length: usize,
    decoded_len: usize,
) -> Result<(), CodecError> {
    if offset == 0 || offset > dst.len() {
        return Err(CodecError::CorruptBlock("copy offset before output start"));
    }
    if dst.len() + length > decoded_len {
        return Err(CodecError::CorruptBlock("copy overruns declared length"));
    }
    // Byte-at-a-time on purpose, the source may overlap the destination.
    let start = dst.len() - offset;
    for i in 0..length {
        let b = dst[start + i];
        dst.push(b);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_empty() {
        let compressed = block_compress(&[]);
        assert_eq!(block_decompress(&compressed).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn round_trip_short_literal() {
        let data = b"abc";
        let compressed = block_compress(data);
        assert_eq!(block_decompress(&compressed).unwrap(), data);
    }

    #[test]
    fn round_trip_repetitive_data_shrinks() {
        let data: Vec<u8> = b"GET http://example.com/index.html HTTP/1.1\r\n"
            .iter()
            .cycle()
            .take(4096)
            .copied()
            .collect();
        let compressed = block_compress(&data);
        assert!(compressed.len() < data.len());
        assert_eq!(block_decompress(&compressed).unwrap(), data);
    }

    #[test]
    fn round_trip_incompressible_data() {
        let data: Vec<u8> = (0..1024u32).map(|i| (i.wrapping_mul(2654435761) >> 13) as u8).collect();
        let compressed = block_compress(&data);
        assert_eq!(block_decompress(&compressed).unwrap(), data);
    }

    #[test]
    fn overlapping_copy_decodes() {
        // Literal "ab" then a copy of length 6 at offset 2 yields "abababab".
        let mut src = Vec::new();
        put_uvarint(&mut src, 8);
        src.push(1 << 2); // literal, length 2
        src.extend_from_slice(b"ab");
        src.push((6 - 4) << 2 | 0b01); // copy1, length 6
        src.push(2); // offset 2
        assert_eq!(block_decompress(&src).unwrap(), b"abababab");
    }

    #[test]
    fn rejects_four_byte_offset_copy() {
        let mut src = Vec::new();
        put_uvarint(&mut src, 4);
        src.push(0b11);
        src.extend_from_slice(&[0, 0, 0, 0, 4]);
        assert_eq!(
            block_decompress(&src),
            Err(CodecError::CorruptBlock("four-byte-offset copy"))
        );
    }

    #[test]
    fn rejects_offset_before_output_start() {
        let mut src = Vec::new();
        put_uvarint(&mut src, 8);
        src.push(0); // literal, length 1
        src.push(b'x');
        src.push((6 - 4) << 2 | 0b01); // copy1, length 6
        src.push(5); // offset 5, only 1 byte decoded so far
        assert!(matches!(
            block_decompress(&src),
            Err(CodecError::CorruptBlock(_))
        ));
    }

    #[test]
    fn rejects_copy_past_declared_length() {
        let mut src = Vec::new();
        put_uvarint(&mut src, 4);
        src.push(1 << 2); // literal, length 2
        src.extend_from_slice(b"ab");
        src.push((4 - 4) << 2 | 0b01); // copy1, length 4, would make 6 > 4
        src.push(2);
        assert!(matches!(
            block_decompress(&src),
            Err(CodecError::CorruptBlock(_))
        ));
    }

    #[test]
    fn rejects_truncated_literal() {
        let mut src = Vec::new();
        put_uvarint(&mut src, 10);
        src.push(9 << 2); // literal, length 10
        src.extend_from_slice(b"abc");
        assert_eq!(block_decompress(&src), Err(CodecError::Truncated));
    }

    #[test]
    fn rejects_short_output() {
        let mut src = Vec::new();
        put_uvarint(&mut src, 10);
        src.push(1 << 2);
        src.extend_from_slice(b"ab");
        assert!(matches!(
            block_decompress(&src),
            Err(CodecError::CorruptBlock(_))
        ));
    }
}
