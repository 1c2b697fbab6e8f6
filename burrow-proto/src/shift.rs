//! The byte-shift stream cipher, scheme "SE1".
//!
//! Obfuscation, not cryptography: each byte is decremented by one (wrapping)
//! on encrypt and incremented by one on decrypt. It exists so that transport
//! payloads never hit middleboxes as cleartext with recognizable structure.

/// Encrypts `data` in place by shifting every byte down by one.
pub fn shift_encrypt(data: &mut [u8]) {
    for b in data.iter_mut() {
        *b = b.wrapping_sub(1);
    }
}

/// Decrypts `data` in place by shifting every byte up by one.
pub fn shift_decrypt(data: &mut [u8]) {
    for b in data.iter_mut() {
        *b = b.wrapping_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let original: Vec<u8> = (0..=255).collect();
        let mut data = original.clone();
        shift_encrypt(&mut data);
        assert_ne!(data, original);
        shift_decrypt(&mut data);
        assert_eq!(data, original);
    }

    #[test]
    fn wraps_at_boundaries() {
        let mut data = [0x00, 0xff];
        shift_encrypt(&mut data);
        assert_eq!(data, [0xff, 0xfe]);
        shift_decrypt(&mut data);
        assert_eq!(data, [0x00, 0xff]);
    }

    #[test]
    fn empty_is_fine() {
        let mut data: [u8; 0] = [];
        shift_encrypt(&mut data);
        shift_decrypt(&mut data);
    }
}
