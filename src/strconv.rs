// Runtime number <-> string conversions.
//
// Only what the VM needs at runtime: string->number coercion for arithmetic
// (decimal and hex integers, decimal floats, hex floats) and the canonical
// string forms used by concatenation and error messages.

/// Parse a Lua integer literal: optional sign, decimal or 0x hex digits.
/// Surrounding ASCII whitespace is ignored.
pub fn parse_integer(s: &str) -> Option<i64> {
    let s = s.trim_matches(|c: char| c.is_ascii_whitespace());
    if s.is_empty() {
        return None;
    }
    let (neg, digits) = match s.as_bytes()[0] {
        b'-' => (true, &s[1..]),
        b'+' => (false, &s[1..]),
        _ => (false, s),
    };
    if digits.is_empty() {
        return None;
    }
    if let Some(hex) = strip_hex_prefix(digits) {
        if hex.is_empty() || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        // Hex integers wrap around like Lua's lexer: accumulate modulo 2^64.
        let mut acc: u64 = 0;
        for b in hex.bytes() {
            acc = acc.wrapping_mul(16).wrapping_add(hex_digit(b) as u64);
        }
        let i = acc as i64;
        return Some(if neg { i.wrapping_neg() } else { i });
    }
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let i = digits.parse::<u64>().ok()?;
    if neg {
        if i > i64::MIN.unsigned_abs() {
            return None;
        }
        Some((i as i64).wrapping_neg())
    } else {
        i64::try_from(i).ok()
    }
}

/// Parse a Lua number literal as a float: decimal float syntax or a hex
/// float (`0x1p4`, `0x.8`, `0xA.8p-2`).
pub fn parse_number(s: &str) -> Option<f64> {
    let s = s.trim_matches(|c: char| c.is_ascii_whitespace());
    if s.is_empty() {
        return None;
    }
    let (neg, body) = match s.as_bytes()[0] {
        b'-' => (true, &s[1..]),
        b'+' => (false, &s[1..]),
        _ => (false, s),
    };
    let f = if let Some(hex) = strip_hex_prefix(body) {
        parse_hex_float(hex)?
    } else {
        // Reject forms Rust accepts but Lua does not.
        if body.is_empty()
            || !body
                .bytes()
                .all(|b| b.is_ascii_digit() || matches!(b, b'.' | b'e' | b'E' | b'+' | b'-'))
        {
            return None;
        }
        body.parse::<f64>().ok()?
    };
    Some(if neg { -f } else { f })
}

fn strip_hex_prefix(s: &str) -> Option<&str> {
    if s.len() > 1 && s.as_bytes()[0] == b'0' && matches!(s.as_bytes()[1], b'x' | b'X') {
        Some(&s[2..])
    } else {
        None
    }
}

fn hex_digit(b: u8) -> u32 {
    match b {
        b'0'..=b'9' => (b - b'0') as u32,
        b'a'..=b'f' => (b - b'a' + 10) as u32,
        _ => (b - b'A' + 10) as u32,
    }
}

fn parse_hex_float(s: &str) -> Option<f64> {
    if s.is_empty() {
        return None;
    }
    let (mantissa, exponent) = match s.find(|c| matches!(c, 'p' | 'P')) {
        Some(i) => (&s[..i], Some(&s[i + 1..])),
        None => (s, None),
    };
    let (int_part, frac_part) = match mantissa.find('.') {
        Some(i) => (&mantissa[..i], &mantissa[i + 1..]),
        None => (mantissa, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    let mut f = 0.0f64;
    for b in int_part.bytes() {
        if !b.is_ascii_hexdigit() {
            return None;
        }
        f = f * 16.0 + hex_digit(b) as f64;
    }
    let mut scale = 1.0 / 16.0;
    for b in frac_part.bytes() {
        if !b.is_ascii_hexdigit() {
            return None;
        }
        f += hex_digit(b) as f64 * scale;
        scale /= 16.0;
    }
    if let Some(e) = exponent {
        let e = e.parse::<i32>().ok()?;
        f *= 2.0f64.powi(e);
    }
    Some(f)
}

/// Canonical decimal form of an integer.
pub fn format_integer(i: i64) -> String {
    let mut buf = itoa::Buffer::new();
    buf.format(i).to_string()
}

/// Canonical form of a float: shortest round-trip decimal with at least one
/// fractional digit, and `inf`/`-inf`/`nan` spellings.
pub fn format_float(f: f64) -> String {
    if f.is_nan() {
        return "nan".to_string();
    }
    if f.is_infinite() {
        return if f < 0.0 { "-inf" } else { "inf" }.to_string();
    }
    let s = format!("{}", f);
    if s.bytes().any(|b| matches!(b, b'.' | b'e' | b'E')) {
        s
    } else {
        format!("{}.0", s)
    }
}
