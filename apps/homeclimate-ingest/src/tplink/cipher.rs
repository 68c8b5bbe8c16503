//! TP-Link smart-home framing: a big-endian `u32` length prefix followed by
//! the payload run through an autokey XOR cipher seeded with 171.
//!
//! Both directions advance the key with the ciphertext byte, which is what
//! makes `decrypt(encrypt(x)) == x`.

use bytes::{BufMut, Bytes, BytesMut};

pub const INITIAL_KEY: u8 = 0xAB;
pub const LENGTH_PREFIX_LEN: usize = 4;

pub fn encrypt(plaintext: &[u8]) -> Vec<u8> {
    let mut key = INITIAL_KEY;
    plaintext
        .iter()
        .map(|&p| {
            let c = key ^ p;
            key = c;
            c
        })
        .collect()
}

pub fn decrypt(ciphertext: &[u8]) -> Vec<u8> {
    let mut key = INITIAL_KEY;
    ciphertext
        .iter()
        .map(|&c| {
            let p = key ^ c;
            key = c;
            p
        })
        .collect()
}

/// `u32_be(len) || encrypt(payload)`
pub fn encode_frame(payload: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(LENGTH_PREFIX_LEN + payload.len());
    frame.put_u32(payload.len() as u32);
    frame.put_slice(&encrypt(payload));
    frame.freeze()
}

/// Strips the length prefix and decrypts the rest. `None` when the frame is
/// shorter than the prefix.
pub fn decode_frame(frame: &[u8]) -> Option<Vec<u8>> {
    let body = frame.get(LENGTH_PREFIX_LEN..)?;
    Some(decrypt(body))
}
