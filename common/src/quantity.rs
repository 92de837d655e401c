use crate::ObjectError;

const BINARY_SUFFIXES: [(&str, u32); 6] = [
    ("Ki", 1),
    ("Mi", 2),
    ("Gi", 3),
    ("Ti", 4),
    ("Pi", 5),
    ("Ei", 6),
];

const DECIMAL_SUFFIXES: [(&str, u32); 6] = [
    ("k", 1),
    ("M", 2),
    ("G", 3),
    ("T", 4),
    ("P", 5),
    ("E", 6),
];

/// Parses a storage quantity such as `5Gi`, `500M` or `1073741824` into bytes.
pub fn parse_quantity(raw: &str) -> Result<u64, ObjectError> {
    let s = raw.trim();
    let invalid = || ObjectError::InvalidQuantity(raw.to_string());

    let (digits, multiplier) = if let Some((num, exp)) = BINARY_SUFFIXES
        .iter()
        .find_map(|(suffix, exp)| s.strip_suffix(suffix).map(|n| (n, *exp)))
    {
        (num, 1024u64.checked_pow(exp).ok_or_else(invalid)?)
    } else if let Some((num, exp)) = DECIMAL_SUFFIXES
        .iter()
        .find_map(|(suffix, exp)| s.strip_suffix(suffix).map(|n| (n, *exp)))
    {
        (num, 1000u64.checked_pow(exp).ok_or_else(invalid)?)
    } else {
        (s, 1)
    };

    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    digits
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(multiplier))
        .ok_or_else(invalid)
}
