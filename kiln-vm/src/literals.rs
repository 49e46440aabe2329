//! Numeric literal parsing shared by the text parser and the translators.
//!
//! Integers take an optional sign, an optional `0x`/`0b` radix prefix and an
//! optional type suffix (`i8`..`u64`, `l`, `ul`). Without a suffix the
//! smallest of `{i32, i64, u64}` that fits is chosen. Floats take an
//! optional `f`/`f32`/`f64` suffix and default to `f64`.

use kiln_types::TypeId;

use crate::generator::Constant;

fn split_sign(text: &str) -> (bool, &str) {
    match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    }
}

fn split_radix(text: &str) -> (u32, &str) {
    if let Some(rest) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        (16, rest)
    } else if let Some(rest) = text.strip_prefix("0b").or_else(|| text.strip_prefix("0B")) {
        (2, rest)
    } else {
        (10, text)
    }
}

fn split_int_suffix(text: &str) -> (Option<TypeId>, &str) {
    const SUFFIXES: [(&str, TypeId); 10] = [
        ("i8", TypeId::I8),
        ("u8", TypeId::U8),
        ("i16", TypeId::I16),
        ("u16", TypeId::U16),
        ("i32", TypeId::I32),
        ("u32", TypeId::U32),
        ("i64", TypeId::I64),
        ("u64", TypeId::U64),
        ("ul", TypeId::U64),
        ("l", TypeId::I64),
    ];
    for (suffix, ty) in SUFFIXES {
        if let Some(body) = text.strip_suffix(suffix) {
            // `0b1` must not lose its last digit to the `l`/`u8` suffixes.
            if !body.is_empty() && body.chars().last().is_some_and(|c| c.is_ascii_hexdigit()) {
                return (Some(ty), body);
            }
        }
    }
    (None, text)
}

fn negate(value: u64) -> u64 {
    (value as i64).wrapping_neg() as u64
}

/// Parses an unsigned integer with an optional radix prefix and no suffix.
pub fn parse_u64(text: &str) -> Option<u64> {
    let (radix, digits) = split_radix(text);
    if digits.is_empty() {
        return None;
    }
    u64::from_str_radix(digits, radix).ok()
}

fn parse_integer(text: &str) -> Option<Constant> {
    let (neg, body) = split_sign(text);
    let (radix, body) = split_radix(body);
    let (suffix, digits) = split_int_suffix(body);
    if digits.is_empty() {
        return None;
    }
    let magnitude = u64::from_str_radix(digits, radix).ok()?;
    let value = if neg { negate(magnitude) } else { magnitude };

    let ty = suffix.unwrap_or({
        // Smallest of {i32, i64, u64} that fits the magnitude.
        if magnitude <= i32::MAX as u64 {
            TypeId::I32
        } else if magnitude <= i64::MAX as u64 {
            TypeId::I64
        } else {
            TypeId::U64
        }
    });

    Some(match ty {
        TypeId::I8 => Constant::I8(value as i8),
        TypeId::U8 => Constant::U8(value as u8),
        TypeId::I16 => Constant::I16(value as i16),
        TypeId::U16 => Constant::U16(value as u16),
        TypeId::I32 => Constant::I32(value as i32),
        TypeId::U32 => Constant::U32(value as u32),
        TypeId::I64 => Constant::I64(value as i64),
        _ => Constant::U64(value),
    })
}

fn parse_float(text: &str) -> Option<Constant> {
    let (body, single) = if let Some(body) = text.strip_suffix("f32") {
        (body, true)
    } else if let Some(body) = text.strip_suffix("f64") {
        (body, false)
    } else if let Some(body) = text.strip_suffix('f') {
        (body, true)
    } else {
        (text, false)
    };
    if body.is_empty() {
        return None;
    }
    let value: f64 = body.parse().ok()?;
    Some(if single {
        Constant::F32(value as f32)
    } else {
        Constant::F64(value)
    })
}

/// Parses any numeric literal into a typed constant.
pub fn parse_literal(text: &str) -> Option<Constant> {
    if text.is_empty() {
        return None;
    }
    let (_, unsigned) = split_sign(text);
    let (radix, _) = split_radix(unsigned);
    let looks_float = radix == 10
        && (unsigned.contains('.')
            || unsigned.contains(['e', 'E'])
            || unsigned.ends_with('f')
            || unsigned.ends_with("f32")
            || unsigned.ends_with("f64"));
    if looks_float {
        parse_float(text)
    } else {
        parse_integer(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("0", Constant::I32(0))]
    #[case("42", Constant::I32(42))]
    #[case("-5", Constant::I32(-5))]
    #[case("2147483647", Constant::I32(i32::MAX))]
    #[case("2147483648", Constant::I64(2147483648))]
    #[case("9223372036854775807", Constant::I64(i64::MAX))]
    #[case("9223372036854775808", Constant::U64(9223372036854775808))]
    #[case("0x40490FDB", Constant::I32(0x4049_0FDB))]
    #[case("0b1010", Constant::I32(10))]
    #[case("7u8", Constant::U8(7))]
    #[case("-1i16", Constant::I16(-1))]
    #[case("100u32", Constant::U32(100))]
    #[case("3l", Constant::I64(3))]
    #[case("3ul", Constant::U64(3))]
    fn integers(#[case] text: &str, #[case] expected: Constant) {
        assert_eq!(parse_literal(text), Some(expected));
    }

    #[rstest]
    #[case("1.5", Constant::F64(1.5))]
    #[case("-2.25", Constant::F64(-2.25))]
    #[case("1.5f", Constant::F32(1.5))]
    #[case("1.5f32", Constant::F32(1.5))]
    #[case("1.5f64", Constant::F64(1.5))]
    #[case("1e3", Constant::F64(1000.0))]
    fn floats(#[case] text: &str, #[case] expected: Constant) {
        assert_eq!(parse_literal(text), Some(expected));
    }

    #[rstest]
    #[case("")]
    #[case("-")]
    #[case("0x")]
    #[case("abc")]
    #[case("1.2.3")]
    fn rejects(#[case] text: &str) {
        assert_eq!(parse_literal(text), None);
    }

    #[test]
    fn unsigned_parse() {
        assert_eq!(parse_u64("16"), Some(16));
        assert_eq!(parse_u64("0x10"), Some(16));
        assert_eq!(parse_u64("0b100"), Some(4));
        assert_eq!(parse_u64("-1"), None);
    }
}
