//! Key comparators
//!
//! The tree treats the comparator as an opaque total order over raw key
//! bytes. Four standard orders are provided; anything else can be plugged in
//! through [`Comparator::Custom`].

use std::cmp::Ordering;

/// Signature of a user-supplied key order
pub type CompareFn = fn(&[u8], &[u8]) -> Ordering;

/// Ordering applied to keys of a database
#[derive(Debug, Clone, Copy, Default)]
pub enum Comparator {
    /// Byte-wise lexical order, shorter key first on a common prefix
    #[default]
    Lexical,
    /// Keys are native-endian 32-bit signed integers
    NativeInt,
    /// Keys are fixed-width big-endian unsigned numbers
    BigEndianNum,
    /// Keys are numeric strings (decimal, or hexadecimal with a `0x` prefix)
    Decimal,
    /// Caller-supplied order
    Custom(CompareFn),
}

impl Comparator {
    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match self {
            Comparator::Lexical => lexical(a, b),
            Comparator::NativeInt => native_int(a, b),
            Comparator::BigEndianNum => big_endian_num(a, b),
            Comparator::Decimal => decimal(a, b),
            Comparator::Custom(f) => f(a, b),
        }
    }

    /// Short name used by the command-line tool
    pub fn name(&self) -> &'static str {
        match self {
            Comparator::Lexical => "lex",
            Comparator::NativeInt => "int",
            Comparator::BigEndianNum => "num",
            Comparator::Decimal => "dec",
            Comparator::Custom(_) => "custom",
        }
    }
}

fn lexical(a: &[u8], b: &[u8]) -> Ordering {
    // slice ordering is exactly byte-wise with length as the tie-break
    a.cmp(b)
}

fn native_int(a: &[u8], b: &[u8]) -> Ordering {
    if a.len() != b.len() {
        return a.len().cmp(&b.len());
    }
    as_native_i32(a).cmp(&as_native_i32(b))
}

fn as_native_i32(buf: &[u8]) -> i32 {
    match <[u8; 4]>::try_from(buf) {
        Ok(bytes) => i32::from_ne_bytes(bytes),
        Err(_) => i32::MIN,
    }
}

fn big_endian_num(a: &[u8], b: &[u8]) -> Ordering {
    if a.len() != b.len() {
        return a.len().cmp(&b.len());
    }
    a.cmp(b)
}

fn decimal(a: &[u8], b: &[u8]) -> Ordering {
    leading_number(a)
        .partial_cmp(&leading_number(b))
        .unwrap_or(Ordering::Equal)
}

/// Parse the longest numeric prefix of `buf`, yielding 0 when there is none
fn leading_number(buf: &[u8]) -> f64 {
    let text = String::from_utf8_lossy(buf);
    let text = text.trim_start();

    let (negative, body) = match text.as_bytes().first() {
        Some(b'-') => (true, &text[1..]),
        Some(b'+') => (false, &text[1..]),
        _ => (false, text),
    };

    let magnitude = if let Some(hex) = body.strip_prefix("0x").or_else(|| body.strip_prefix("0X")) {
        let digits: String = hex.chars().take_while(|c| c.is_ascii_hexdigit()).collect();
        u64::from_str_radix(&digits, 16).map(|v| v as f64).unwrap_or(0.0)
    } else {
        let candidate: String = body
            .chars()
            .take_while(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '+' | '-'))
            .collect();
        (1..=candidate.len())
            .rev()
            .find_map(|end| candidate[..end].parse::<f64>().ok())
            .unwrap_or(0.0)
    };

    if negative { -magnitude } else { magnitude }
}
