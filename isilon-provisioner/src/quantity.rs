//! Storage quantity parsing
//!
//! Accepts the cluster's quantity notation: binary suffixes (`5Gi`), decimal
//! suffixes including milli (`500M`, `1500m`), decimal exponents (`1e9`,
//! `5E-3`) and fractions (`1.5Ti`). Returns an exact byte count, rounded up
//! to a whole byte. Integer arithmetic only, since the result becomes a
//! byte-exact quota.

/// Largest exponent magnitude accepted; keeps every intermediate in a u128
const MAX_EXPONENT: u32 = 18;

/// Multiplier of a suffix as a `(numerator, denominator)` pair
fn multiplier(suffix: &str) -> Option<(u128, u128)> {
    let binary = |shift: u32| Some((1u128 << shift, 1));
    let decimal = |power: u32| Some((10u128.pow(power), 1));

    match suffix {
        "" => decimal(0),
        "m" => Some((1, 1_000)),
        "k" => decimal(3),
        "M" => decimal(6),
        "G" => decimal(9),
        "T" => decimal(12),
        "P" => decimal(15),
        "E" => decimal(18),
        "Ki" => binary(10),
        "Mi" => binary(20),
        "Gi" => binary(30),
        "Ti" => binary(40),
        "Pi" => binary(50),
        "Ei" => binary(60),
        _ => exponent(suffix),
    }
}

/// `e<n>` / `E<n>` with an optionally signed integer `n`
fn exponent(suffix: &str) -> Option<(u128, u128)> {
    let digits = suffix
        .strip_prefix('e')
        .or_else(|| suffix.strip_prefix('E'))?;
    let unsigned = digits
        .strip_prefix(|c: char| c == '+' || c == '-')
        .unwrap_or(digits);
    if unsigned.is_empty() || !unsigned.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    let exp: i32 = digits.parse().ok()?;
    if exp.unsigned_abs() > MAX_EXPONENT {
        return None;
    }
    let scale = 10u128.pow(exp.unsigned_abs());
    Some(if exp >= 0 { (scale, 1) } else { (1, scale) })
}

/// Parse a quantity into bytes
pub fn parse_quantity(value: &str) -> Option<u64> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    let split = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(value.len());
    let (number, suffix) = value.split_at(split);
    let (numerator, denominator) = multiplier(suffix)?;

    let (whole, fraction) = match number.split_once('.') {
        Some((whole, fraction)) => (whole, fraction),
        None => (number, ""),
    };
    if whole.is_empty() && fraction.is_empty() {
        return None;
    }
    if fraction.len() > MAX_EXPONENT as usize || !fraction.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    // number = digits / scale
    let scale = 10u128.pow(fraction.len() as u32);
    let whole: u128 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let fraction: u128 = if fraction.is_empty() { 0 } else { fraction.parse().ok()? };
    let digits = whole.checked_mul(scale)?.checked_add(fraction)?;

    let top = digits.checked_mul(numerator)?;
    let bottom = scale * denominator;
    // Round partial bytes up; a quota may never be smaller than asked
    let bytes = top.checked_add(bottom - 1)? / bottom;

    u64::try_from(bytes).ok()
}

/// Format bytes using binary suffixes when the value divides evenly
pub fn format_quantity(bytes: u64) -> String {
    const SUFFIXES: [(&str, u64); 6] = [
        ("Ei", 1 << 60),
        ("Pi", 1 << 50),
        ("Ti", 1 << 40),
        ("Gi", 1 << 30),
        ("Mi", 1 << 20),
        ("Ki", 1 << 10),
    ];

    for (suffix, unit) in SUFFIXES {
        if bytes >= unit && bytes % unit == 0 {
            return format!("{}{}", bytes / unit, suffix);
        }
    }
    bytes.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_bytes() {
        assert_eq!(parse_quantity("5000000000"), Some(5_000_000_000));
        assert_eq!(parse_quantity(" 0 "), Some(0));
    }

    #[test]
    fn test_suffixes() {
        assert_eq!(parse_quantity("5Gi"), Some(5 * 1024 * 1024 * 1024));
        assert_eq!(parse_quantity("5G"), Some(5_000_000_000));
        assert_eq!(parse_quantity("500M"), Some(500_000_000));
        assert_eq!(parse_quantity("1Ki"), Some(1024));
        assert_eq!(parse_quantity("2k"), Some(2000));
    }

    #[test]
    fn test_fractions() {
        assert_eq!(parse_quantity("1.5Gi"), Some(1_610_612_736));
        assert_eq!(parse_quantity("0.5k"), Some(500));
        assert_eq!(parse_quantity(".5Ki"), Some(512));
    }

    #[test]
    fn test_milli_and_exponents() {
        assert_eq!(parse_quantity("1500m"), Some(2));
        assert_eq!(parse_quantity("2000m"), Some(2));
        assert_eq!(parse_quantity("1e9"), Some(1_000_000_000));
        assert_eq!(parse_quantity("5E3"), Some(5_000));
        assert_eq!(parse_quantity("1.5e+3"), Some(1_500));
        assert_eq!(parse_quantity("12e-1"), Some(2));
        // A bare `E` is still the exa suffix
        assert_eq!(parse_quantity("1E"), Some(1_000_000_000_000_000_000));
    }

    #[test]
    fn test_invalid() {
        assert_eq!(parse_quantity("1e"), None);
        assert_eq!(parse_quantity("1e+"), None);
        assert_eq!(parse_quantity("1e19"), None);
        assert_eq!(parse_quantity("1e9Gi"), None);
        assert_eq!(parse_quantity(""), None);
        assert_eq!(parse_quantity("Gi"), None);
        assert_eq!(parse_quantity("5GB"), None);
        assert_eq!(parse_quantity("-5Gi"), None);
        assert_eq!(parse_quantity("1.2.3"), None);
        assert_eq!(parse_quantity("100Ei"), None);
    }

    #[test]
    fn test_format() {
        assert_eq!(format_quantity(5 * 1024 * 1024 * 1024), "5Gi");
        assert_eq!(format_quantity(1536), "1536");
        assert_eq!(format_quantity(5_000_000_000), "5000000000");
        assert_eq!(format_quantity(0), "0");
    }
}
