//! Wait timeouts and Go-style duration strings (`30s`, `1m30s`, `500ms`, `-1s`).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::EngineError;

/// Deadline used for an unbounded wait.
pub const UNBOUNDED_WAIT: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// How long a wait may keep polling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Timeout {
    /// Check exactly once, never sleep.
    Once,
    After(Duration),
    /// No practical bound; resolved to [`UNBOUNDED_WAIT`].
    Unbounded,
}

impl Timeout {
    /// Zero means check once; negative means unbounded.
    pub fn parse(s: &str) -> Result<Self, EngineError> {
        let (negative, d) = parse_signed(s)?;
        Ok(if negative && !d.is_zero() {
            Timeout::Unbounded
        } else if d.is_zero() {
            Timeout::Once
        } else {
            Timeout::After(d)
        })
    }

    /// Span from the start of the wait to its deadline, capped at
    /// [`UNBOUNDED_WAIT`].
    pub fn budget(&self) -> Duration {
        match self {
            Timeout::Once => Duration::ZERO,
            Timeout::After(d) => (*d).min(UNBOUNDED_WAIT),
            Timeout::Unbounded => UNBOUNDED_WAIT,
        }
    }

    pub fn is_once(&self) -> bool {
        matches!(self, Timeout::Once)
    }
}

impl std::str::FromStr for Timeout {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Timeout::parse(s)
    }
}

/// Parse a non-negative duration such as `10s`, `2m`, `1h30m` or `250ms`.
pub fn parse_duration(s: &str) -> Result<Duration, EngineError> {
    match parse_signed(s)? {
        (true, d) if !d.is_zero() => Err(invalid(s, "negative duration")),
        (_, d) => Ok(d),
    }
}

fn invalid(s: &str, why: &str) -> EngineError {
    EngineError::ValidationRejected(format!("invalid duration {s:?}: {why}"))
}

fn parse_signed(raw: &str) -> Result<(bool, Duration), EngineError> {
    let s = raw.trim();
    let (negative, body) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    if body.is_empty() {
        return Err(invalid(raw, "empty"));
    }
    if body == "0" {
        return Ok((negative, Duration::ZERO));
    }
    let mut total = Duration::ZERO;
    let mut rest = body;
    while !rest.is_empty() {
        let num_len = rest.find(|c: char| !(c.is_ascii_digit() || c == '.')).unwrap_or(rest.len());
        if num_len == 0 {
            return Err(invalid(raw, "expected a number"));
        }
        let value: f64 = rest[..num_len].parse().map_err(|_| invalid(raw, "bad number"))?;
        rest = &rest[num_len..];
        let unit_len = rest.find(|c: char| c.is_ascii_digit() || c == '.').unwrap_or(rest.len());
        let nanos_per_unit = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 6e10,
            "h" => 3.6e12,
            "" => return Err(invalid(raw, "missing unit")),
            _ => return Err(invalid(raw, "unknown unit")),
        };
        rest = &rest[unit_len..];
        let nanos = (value * nanos_per_unit).round();
        if !nanos.is_finite() || nanos >= u64::MAX as f64 {
            return Err(invalid(raw, "out of range"));
        }
        total = total.checked_add(Duration::from_nanos(nanos as u64)).ok_or_else(|| invalid(raw, "out of range"))?;
    }
    Ok((negative, total))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_compound_durations() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
    }

    #[test]
    fn rejects_malformed_durations() {
        for s in ["", "10", "s", "5x", "-5s", "1m-3s"] {
            assert!(parse_duration(s).is_err(), "{s}");
        }
    }

    #[test]
    fn timeout_sentinels() {
        assert_eq!(Timeout::parse("0s").unwrap(), Timeout::Once);
        assert_eq!(Timeout::parse("0").unwrap(), Timeout::Once);
        assert_eq!(Timeout::parse("-1s").unwrap(), Timeout::Unbounded);
        assert_eq!(Timeout::parse("10m").unwrap(), Timeout::After(Duration::from_secs(600)));
        assert_eq!(Timeout::parse("-3s").unwrap(), Timeout::Unbounded);
        assert_eq!(Timeout::Unbounded.budget(), Duration::from_secs(604_800));
        assert_eq!(Timeout::Once.budget(), Duration::ZERO);
    }

    #[test]
    fn budget_never_exceeds_unbounded_wait() {
        assert_eq!(Timeout::After(Duration::MAX).budget(), UNBOUNDED_WAIT);
        assert_eq!(Timeout::After(UNBOUNDED_WAIT * 2).budget(), UNBOUNDED_WAIT);
        assert_eq!(Timeout::After(Duration::from_secs(90)).budget(), Duration::from_secs(90));
    }
}
