/// Byte-size specifications like "1G", "2 MB" or "512k"
use crate::config::types::{Result, SandboxError};

pub fn parse_byte_spec(spec: &str) -> Result<u64> {
    let trimmed = spec.trim();
    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == ' '))
        .ok_or_else(|| unrecognized(spec))?;
    let (digits, suffix) = trimmed.split_at(split);

    let number: u64 = digits
        .replace(' ', "")
        .parse()
        .map_err(|_| unrecognized(spec))?;

    let suffix = suffix.trim();
    let unit = suffix.strip_suffix('B').unwrap_or(suffix);
    let multiplier: u64 = match unit {
        "k" | "K" => 1 << 10,
        "M" => 1 << 20,
        "G" => 1 << 30,
        "T" => 1 << 40,
        _ => {
            return Err(SandboxError::Config(format!(
                "Unrecognized multiplier in size specification: {}",
                spec
            )))
        }
    };

    number
        .checked_mul(multiplier)
        .ok_or_else(|| SandboxError::Config(format!("Size specification overflows: {}", spec)))
}

fn unrecognized(spec: &str) -> SandboxError {
    SandboxError::Config(format!("Unrecognized size specification: {}", spec))
}
