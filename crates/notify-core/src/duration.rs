use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DurationError {
    #[error("empty duration")]
    Empty,
    #[error("missing number in duration {0:?}")]
    MissingNumber(String),
    #[error("missing unit in duration {0:?}")]
    MissingUnit(String),
    #[error("unknown unit {unit:?} in duration {input:?}")]
    UnknownUnit { input: String, unit: String },
    #[error("duration {0:?} is zero")]
    Zero(String),
    #[error("duration {0:?} overflows")]
    Overflow(String),
}

const NANOS_PER_MS: u128 = 1_000_000;

// Descending, which is the order format_duration emits groups in.
const UNITS: &[(&str, u128)] = &[
    ("d", 86_400_000_000_000),
    ("h", 3_600_000_000_000),
    ("m", 60_000_000_000),
    ("s", 1_000_000_000),
    ("ms", 1_000_000),
    ("us", 1_000),
    ("\u{b5}s", 1_000),
    ("\u{3bc}s", 1_000),
    ("ns", 1),
];

// Fraction digits past this cannot change a nanosecond total.
const MAX_FRACTION_DIGITS: usize = 18;

/// Parses strings like `"60s"`, `"1h30m"`, `"1.5h"` or `"250ms"`, the same
/// grammar as Go's `time.ParseDuration` without signs, plus a `d` unit.
pub fn parse_duration(text: &str) -> Result<Duration, DurationError> {
    let input = text.trim();
    if input.is_empty() {
        return Err(DurationError::Empty);
    }
    let overflow = || DurationError::Overflow(input.to_string());
    let mut total: u128 = 0;
    let mut rest = input;
    while !rest.is_empty() {
        let int_len = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        let int_part = &rest[..int_len];
        rest = &rest[int_len..];
        let mut frac_part = "";
        if let Some(after_dot) = rest.strip_prefix('.') {
            let frac_len = after_dot
                .find(|c: char| !c.is_ascii_digit())
                .unwrap_or(after_dot.len());
            frac_part = &after_dot[..frac_len];
            rest = &after_dot[frac_len..];
        }
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(DurationError::MissingNumber(input.to_string()));
        }
        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        if unit_len == 0 {
            return Err(DurationError::MissingUnit(input.to_string()));
        }
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];
        let factor = UNITS
            .iter()
            .find(|(name, _)| *name == unit)
            .map(|(_, factor)| *factor)
            .ok_or_else(|| DurationError::UnknownUnit {
                input: input.to_string(),
                unit: unit.to_string(),
            })?;

        let whole = if int_part.is_empty() {
            0
        } else {
            int_part.parse::<u128>().map_err(|_| overflow())?
        };
        let mut group = whole.checked_mul(factor).ok_or_else(overflow)?;
        let frac_digits = &frac_part[..frac_part.len().min(MAX_FRACTION_DIGITS)];
        if !frac_digits.is_empty() {
            let numerator = frac_digits.parse::<u128>().map_err(|_| overflow())?;
            let scale = 10u128.pow(frac_digits.len() as u32);
            group = group
                .checked_add(numerator * factor / scale)
                .ok_or_else(overflow)?;
        }
        total = total.checked_add(group).ok_or_else(overflow)?;
    }
    if total == 0 {
        return Err(DurationError::Zero(input.to_string()));
    }
    let total = u64::try_from(total).map_err(|_| overflow())?;
    Ok(Duration::from_nanos(total))
}

/// Compact form without the `d` unit (`3600s` is `"1h"`, `90s` is `"1m30s"`).
pub fn format_duration(duration: Duration) -> String {
    let mut nanos = duration.as_nanos();
    if nanos == 0 {
        return "0s".to_string();
    }
    let mut out = String::new();
    for (name, factor) in UNITS.iter().filter(|(name, _)| name.is_ascii() && *name != "d") {
        let value = nanos / factor;
        if value > 0 {
            out.push_str(&value.to_string());
            out.push_str(name);
            nanos -= value * factor;
        }
    }
    out
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`.
pub fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos() / NANOS_PER_MS).unwrap_or(u64::MAX)
}

pub(crate) mod serde_duration {
    use super::{format_duration, parse_duration};
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
