//! Number coercion and formatting.
//!
//! Numbers are always f64. Strings convert to numbers under the same rules
//! the lexer uses (decimal and hex literals, hex with binary exponent), plus
//! leading/trailing whitespace. Numbers format like C's `%.14g`.

use lunaria_core::string::StringInterner;
use lunaria_core::value::Value;

/// Coerce a value to a number: numbers pass through, strings are parsed.
pub fn to_number(val: Value, strings: &StringInterner) -> Option<f64> {
    if let Some(n) = val.as_number() {
        return Some(n);
    }
    if let Some(sid) = val.as_string_id() {
        return str_to_number(strings.get_bytes(sid));
    }
    None
}

/// Parse a numeric string. Accepts what `tonumber` accepts: optional sign,
/// decimal floats, and `0x` hex (with optional fraction and `p` exponent).
/// Trailing garbage rejects the whole string.
pub fn str_to_number(bytes: &[u8]) -> Option<f64> {
    let s = std::str::from_utf8(bytes).ok()?;
    let s = s.trim_matches(|c: char| c.is_ascii_whitespace());
    if s.is_empty() {
        return None;
    }
    let (negative, rest) = match s.as_bytes()[0] {
        b'-' => (true, &s[1..]),
        b'+' => (false, &s[1..]),
        _ => (false, s),
    };
    if rest.is_empty() || matches!(rest.as_bytes()[0], b'+' | b'-') {
        return None;
    }
    let magnitude = if rest.len() > 2 && (rest.starts_with("0x") || rest.starts_with("0X")) {
        parse_hex(&rest[2..])?
    } else {
        // Reject forms strtod takes but Lua does not.
        let lower = rest.to_ascii_lowercase();
        if lower.contains("inf") || lower.contains("nan") {
            return None;
        }
        rest.parse::<f64>().ok()?
    };
    Some(if negative { -magnitude } else { magnitude })
}

/// Hex float body after the `0x` prefix: hex digits, optional fraction,
/// optional binary exponent (`p` followed by a signed decimal).
fn parse_hex(s: &str) -> Option<f64> {
    let (mantissa, exponent) = match s.find(['p', 'P']) {
        Some(i) => (&s[..i], Some(&s[i + 1..])),
        None => (s, None),
    };
    let (int_part, frac_part) = match mantissa.find('.') {
        Some(i) => (&mantissa[..i], Some(&mantissa[i + 1..])),
        None => (mantissa, None),
    };
    let mut value = 0.0f64;
    let mut seen_digit = false;
    for c in int_part.chars() {
        value = value * 16.0 + c.to_digit(16)? as f64;
        seen_digit = true;
    }
    if let Some(frac) = frac_part {
        let mut scale = 1.0 / 16.0;
        for c in frac.chars() {
            value += c.to_digit(16)? as f64 * scale;
            scale /= 16.0;
            seen_digit = true;
        }
    }
    if !seen_digit {
        return None;
    }
    if let Some(exp) = exponent {
        if exp.is_empty() {
            return None;
        }
        let e: i32 = exp.parse().ok()?;
        value *= (e as f64).exp2();
    }
    Some(value)
}

/// Render a number the way Lua's default `%.14g` does: integral values
/// without a decimal point, 14 significant digits otherwise, exponent
/// notation outside the positional range.
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        return "nan".to_string();
    }
    if n.is_infinite() {
        return if n < 0.0 { "-inf" } else { "inf" }.to_string();
    }
    if n == n.trunc() && n.abs() < 1e15 {
        return format!("{}", n as i64);
    }
    // Decimal exponent of the value, from the shortest scientific form.
    let sci = format!("{n:e}");
    let exp: i32 = sci[sci.find('e').map_or(0, |i| i + 1)..].parse().unwrap_or(0);
    if (-5..15).contains(&exp) {
        let precision = (13 - exp).max(0) as usize;
        let mut out = format!("{n:.precision$}");
        if out.contains('.') {
            while out.ends_with('0') {
                out.pop();
            }
            if out.ends_with('.') {
                out.pop();
            }
        }
        out
    } else {
        let mut mantissa = format!("{n:.13e}");
        let e_pos = mantissa.find('e').unwrap_or(mantissa.len());
        let tail: i32 = mantissa[e_pos + 1..].parse().unwrap_or(0);
        mantissa.truncate(e_pos);
        if mantissa.contains('.') {
            while mantissa.ends_with('0') {
                mantissa.pop();
            }
            if mantissa.ends_with('.') {
                mantissa.pop();
            }
        }
        let sign = if tail < 0 { '-' } else { '+' };
        format!("{mantissa}e{sign}{:02}", tail.abs())
    }
}
