//! Variable-length integer codec used by every length or ID prefix in a
//! serialized page.
//!
//! Each byte carries seven bits of the value, least significant group first.
//! Every byte except the last is stored as `-(group + 1)` in two's complement,
//! so a negative byte means "more bytes follow" and the first non-negative
//! byte terminates the number.

/// Longest encoding of a `u32`
pub const MAX_LEN: usize = 5;

/// Encode `num` into a fresh buffer
pub fn encode(num: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(MAX_LEN);
    encode_into(num, &mut buf);
    buf
}

/// Append the encoding of `num` to `buf`, returning the number of bytes written
pub fn encode_into(num: u32, buf: &mut Vec<u8>) -> usize {
    if num == 0 {
        buf.push(0);
        return 1;
    }

    let mut num = num;
    let mut len = 0;
    while num > 0 {
        let rem = (num % 128) as i8;
        num /= 128;
        let byte = if num > 0 { -rem - 1 } else { rem };
        buf.push(byte as u8);
        len += 1;
    }
    len
}

/// Decode a number from the front of `buf`.
///
/// `buf.len()` is the hard ceiling on bytes read. With fewer than two bytes
/// available exactly one byte is consumed and returned as a signed value,
/// which lets callers detect a dangling continuation byte as a negative
/// number. An empty buffer decodes to `(0, 0)`.
pub fn decode(buf: &[u8]) -> (i64, usize) {
    match buf.len() {
        0 => return (0, 0),
        1 => return (buf[0] as i8 as i64, 1),
        _ => {}
    }

    let mut num: i64 = 0;
    let mut base: i64 = 1;
    let mut i = 0;
    while i < buf.len() {
        let byte = buf[i] as i8 as i64;
        if byte >= 0 {
            num = num.saturating_add(byte.saturating_mul(base));
            break;
        }
        num = num.saturating_add(base.saturating_mul(-(byte + 1)));
        base = base.saturating_mul(128);
        i += 1;
    }

    // A buffer made only of continuation bytes consumes all of it
    (num, (i + 1).min(buf.len()))
}
