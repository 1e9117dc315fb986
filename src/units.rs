// Size Strings
//
// Front ends accept sizes such as "512", "512MB", "4gb" or "1.5TB".
// Suffixes are case-insensitive binary multiples; a bare number is megabytes.

use thiserror::Error;

pub const KB: u64 = 1024;
pub const MB: u64 = 1024 * KB;
pub const GB: u64 = 1024 * MB;
pub const TB: u64 = 1024 * GB;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SizeParseError {
    #[error("Empty size string")]
    Empty,

    #[error("Invalid size '{0}': expected a number with an optional kb|mb|gb|tb suffix")]
    Invalid(String),

    #[error("Size '{0}' overflows 64 bits")]
    Overflow(String),
}

/// Parse a size string into bytes.
pub fn parse_size(input: &str) -> Result<u64, SizeParseError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(SizeParseError::Empty);
    }

    let lower = trimmed.to_ascii_lowercase();
    let (number, multiplier) = match lower.len().checked_sub(2).map(|i| lower.split_at(i)) {
        Some((n, "kb")) => (n, KB),
        Some((n, "mb")) => (n, MB),
        Some((n, "gb")) => (n, GB),
        Some((n, "tb")) => (n, TB),
        _ => (lower.as_str(), MB),
    };

    let number = number.trim();
    if number.is_empty() {
        return Err(SizeParseError::Invalid(input.to_string()));
    }

    if let Ok(whole) = number.parse::<u64>() {
        return whole
            .checked_mul(multiplier)
            .ok_or_else(|| SizeParseError::Overflow(input.to_string()));
    }

    let fractional: f64 = number
        .parse()
        .map_err(|_| SizeParseError::Invalid(input.to_string()))?;
    if !fractional.is_finite() || fractional < 0.0 {
        return Err(SizeParseError::Invalid(input.to_string()));
    }
    let bytes = fractional * multiplier as f64;
    if bytes >= u64::MAX as f64 {
        return Err(SizeParseError::Overflow(input.to_string()));
    }
    Ok(bytes.round() as u64)
}

/// Render bytes with the largest unit that divides them evenly, e.g. `4GB`.
pub fn format_size(bytes: u64) -> String {
    for (unit, suffix) in [(TB, "TB"), (GB, "GB"), (MB, "MB"), (KB, "KB")] {
        if bytes >= unit && bytes % unit == 0 {
            return format!("{}{}", bytes / unit, suffix);
        }
    }
    if bytes >= GB {
        return format!("{:.1}GB", bytes as f64 / GB as f64);
    }
    if bytes >= MB {
        return format!("{:.1}MB", bytes as f64 / MB as f64);
    }
    format!("{}B", bytes)
}
