// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC

//! Hexadecimal encoding and decoding of key material.

use core::fmt;

/// Error returned by [`decode_into()`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HexDecodeError {
    /// The input length is not exactly twice the destination length.
    InvalidLength,
    /// The input contains a character which is not a hexadecimal digit.
    InvalidDigit,
}

fn hex_digit_value(c: u8) -> Result<u8, HexDecodeError> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => Err(HexDecodeError::InvalidDigit),
    }
}

/// Determine the number of bytes a hex string decodes to.
///
/// Returns `None` if `hex` has an odd length.
pub fn decoded_len(hex: &str) -> Option<usize> {
    let len = hex.len();
    if len % 2 != 0 { None } else { Some(len / 2) }
}

/// Decode a hex string into a caller provided buffer.
///
/// Both lower and upper case digits are accepted.
///
/// # Arguments:
///
/// * `hex` - The hex string to decode. Its length must equal twice the
///   length of `dst`.
/// * `dst` - The destination buffer.
pub fn decode_into(hex: &str, dst: &mut [u8]) -> Result<(), HexDecodeError> {
    let hex = hex.as_bytes();
    if hex.len() != 2 * dst.len() {
        return Err(HexDecodeError::InvalidLength);
    }
    for (d, pair) in dst.iter_mut().zip(hex.chunks_exact(2)) {
        *d = (hex_digit_value(pair[0])? << 4) | hex_digit_value(pair[1])?;
    }
    Ok(())
}

/// Encode bytes as a lower case hex string.
///
/// # Arguments:
///
/// * `bytes` - The bytes to encode.
/// * `w` - The destination to format into.
pub fn encode<W: fmt::Write + ?Sized>(bytes: &[u8], w: &mut W) -> fmt::Result {
    for b in bytes {
        write!(w, "{:02x}", b)?;
    }
    Ok(())
}

#[test]
fn test_hex_decode() {
    let mut dst = [0u8; 4];
    decode_into("00aBcd7F", &mut dst).unwrap();
    assert_eq!(dst, [0x00, 0xab, 0xcd, 0x7f]);

    assert_eq!(decode_into("00aBcd7", &mut dst), Err(HexDecodeError::InvalidLength));
    assert_eq!(decode_into("00aBcd7g", &mut dst), Err(HexDecodeError::InvalidDigit));
    assert_eq!(decoded_len("abc"), None);
    assert_eq!(decoded_len("abcd"), Some(2));
}

#[test]
fn test_hex_encode() {
    extern crate alloc;
    use alloc::string::String;

    let mut s = String::new();
    encode(&[0x00, 0xab, 0x0f, 0xff], &mut s).unwrap();
    assert_eq!(s, "00ab0fff");
}
