use std::time::Duration;

use crate::error::FleetError;

/// Parse a human-readable size string into bytes.
///
/// Accepts formats like `"20G"`, `"512M"`, `"100K"`, `"1073741824"`.
/// Uses binary units (1G = 1024³ = 1,073,741,824 bytes).
pub fn parse_size(s: &str) -> Result<u64, FleetError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(FleetError::Validation {
            message: "size cannot be empty".into(),
        });
    }

    let (num_str, suffix) = split_suffix(s);

    let num: u64 = num_str.parse().map_err(|_| FleetError::Validation {
        message: format!("invalid size number: '{num_str}'"),
    })?;

    let multiplier: u64 = match suffix.as_str() {
        "" => 1,
        "K" | "KB" => 1024,
        "M" | "MB" => 1024 * 1024,
        "G" | "GB" => 1024 * 1024 * 1024,
        "T" | "TB" => 1024 * 1024 * 1024 * 1024,
        _ => {
            return Err(FleetError::Validation {
                message: format!("unknown size suffix: '{suffix}' (use G, M, K, or T)"),
            });
        }
    };

    num.checked_mul(multiplier)
        .ok_or_else(|| FleetError::Validation {
            message: format!("size overflows: '{s}'"),
        })
}

/// Normalize a memory setting to whole mebibytes.
///
/// A bare number is already in MB (`"2048"`); suffixed values go through
/// [`parse_size`] (`"2G"` → 2048).
pub fn parse_memory_mb(s: &str) -> Result<u64, FleetError> {
    let s = s.trim();
    if !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()) {
        return s.parse().map_err(|_| FleetError::Validation {
            message: format!("invalid memory size: '{s}'"),
        });
    }
    let bytes = parse_size(s)?;
    if bytes % (1024 * 1024) != 0 {
        return Err(FleetError::Validation {
            message: format!("memory must be a whole number of MB (got '{s}')"),
        });
    }
    Ok(bytes / (1024 * 1024))
}

/// Parse a duration like `"90"`, `"30s"`, `"10m"`, `"2h"` or `"1d"`.
/// A bare number is seconds.
pub fn parse_duration(s: &str) -> Result<Duration, FleetError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(FleetError::Validation {
            message: "duration cannot be empty".into(),
        });
    }

    let (num_str, suffix) = split_suffix(s);
    let num: u64 = num_str.parse().map_err(|_| FleetError::Validation {
        message: format!("invalid duration number: '{num_str}'"),
    })?;

    let secs = match suffix.as_str() {
        "" | "S" => Some(num),
        "M" => num.checked_mul(60),
        "H" => num.checked_mul(3600),
        "D" => num.checked_mul(86400),
        _ => {
            return Err(FleetError::Validation {
                message: format!("unknown duration suffix: '{suffix}' (use s, m, h, or d)"),
            });
        }
    };

    secs.map(Duration::from_secs)
        .ok_or_else(|| FleetError::Validation {
            message: format!("duration overflows: '{s}'"),
        })
}

fn split_suffix(s: &str) -> (&str, String) {
    match s.find(|c: char| c.is_ascii_alphabetic()) {
        Some(i) => (&s[..i], s[i..].to_ascii_uppercase()),
        None => (s, String::new()),
    }
}

/// Quote an argument for a POSIX shell on the remote side of `ssh`.
pub fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@,+".contains(c))
    {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', r"'\''"))
}
