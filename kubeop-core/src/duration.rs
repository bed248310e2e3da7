//! Resync intervals and the duration grammar they are written in.
//!
//! Intervals are concatenated `<number><unit>` tokens where the unit is one of
//! `ms`, `s`, `m` or `h`, e.g. `"2h30m"`, `"45s"` or `"1.5m"`.
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str::FromStr, time};

/// The interval used whenever none is declared or the declared one does not parse
pub const DEFAULT_INTERVAL: time::Duration = time::Duration::from_secs(5 * 60);

const MINUTE: time::Duration = time::Duration::from_secs(60);
const HOUR: time::Duration = time::Duration::from_secs(60 * 60);

/// Errors returned by [`try_parse_interval`] and the [`FromStr`] implementation for [`Duration`].
#[derive(Debug, thiserror::Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum ParseError {
    /// The input was empty
    #[error("empty duration")]
    Empty,

    /// An invalid unit was provided.
    #[error("invalid unit: {}", EXPECTED_UNITS)]
    InvalidUnit,

    /// No unit was provided.
    #[error("missing a unit: {}", EXPECTED_UNITS)]
    NoUnit,

    /// The number associated with a given unit was invalid.
    #[error("invalid number: {0:?}")]
    NotANumber(String),

    /// The duration does not fit in a [`std::time::Duration`].
    #[error("duration is too large")]
    Overflow,
}

const EXPECTED_UNITS: &str = "expected one of 'ms', 's', 'm', or 'h'";

/// Parses an interval, returning a [`ParseError`] for anything outside the grammar.
///
/// ```
/// use kubeop_core::duration::try_parse_interval;
/// use std::time::Duration;
/// assert_eq!(try_parse_interval("1m30s"), Ok(Duration::from_secs(90)));
/// assert!(try_parse_interval("90").is_err());
/// ```
pub fn try_parse_interval(input: &str) -> Result<time::Duration, ParseError> {
    let mut s = input.trim();
    if s.is_empty() {
        return Err(ParseError::Empty);
    }

    let mut total = time::Duration::ZERO;
    while !s.is_empty() {
        let unit_start = s.find(|c: char| c.is_ascii_alphabetic()).ok_or(ParseError::NoUnit)?;
        let (val, rest) = s.split_at(unit_start);
        if !is_number(val) {
            return Err(ParseError::NotANumber(val.to_string()));
        }
        let val = val
            .parse::<f64>()
            .map_err(|_| ParseError::NotANumber(val.to_string()))?;

        let unit_len = rest
            .find(|c: char| !c.is_ascii_alphabetic())
            .unwrap_or(rest.len());
        let (unit, rest) = rest.split_at(unit_len);
        s = rest;

        let base = match unit {
            "ms" => time::Duration::from_millis(1),
            "s" => time::Duration::from_secs(1),
            "m" => MINUTE,
            "h" => HOUR,
            _ => return Err(ParseError::InvalidUnit),
        };
        let part = time::Duration::try_from_secs_f64(base.as_secs_f64() * val)
            .map_err(|_| ParseError::Overflow)?;
        total = total.checked_add(part).ok_or(ParseError::Overflow)?;
    }
    Ok(total)
}

// digits, optionally followed by a dot and more digits
fn is_number(s: &str) -> bool {
    let (int, frac) = match s.split_once('.') {
        Some((int, frac)) => (int, Some(frac)),
        None => (s, None),
    };
    let digits = |p: &str| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit());
    digits(int) && frac.is_none_or(digits)
}

/// Parses an interval, falling back to [`DEFAULT_INTERVAL`] (5 minutes) when the
/// input is empty or does not parse.
///
/// This never fails, so a malformed resync declaration cannot take down a controller.
///
/// ```
/// use kubeop_core::parse_interval;
/// use std::time::Duration;
/// assert_eq!(parse_interval("2h30m"), Duration::from_secs(2 * 3600 + 30 * 60));
/// assert_eq!(parse_interval("invalid"), Duration::from_secs(300));
/// ```
#[must_use]
pub fn parse_interval(input: &str) -> time::Duration {
    try_parse_interval(input).unwrap_or(DEFAULT_INTERVAL)
}

/// A duration written in the interval grammar.
///
/// This is a thin wrapper around [`std::time::Duration`] that can be serialized
/// and deserialized as a string (`"15s"`, `"1h"`), which is how durations appear in
/// operator configuration.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Duration(time::Duration);

impl From<time::Duration> for Duration {
    fn from(duration: time::Duration) -> Self {
        Self(duration)
    }
}

impl From<Duration> for time::Duration {
    fn from(Duration(duration): Duration) -> Self {
        duration
    }
}

impl PartialEq<time::Duration> for Duration {
    fn eq(&self, other: &time::Duration) -> bool {
        self.0 == *other
    }
}

impl fmt::Debug for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut millis = self.0.as_millis();
        if millis == 0 {
            return f.write_str("0s");
        }
        for (unit, size) in [("h", 3_600_000), ("m", 60_000), ("s", 1000), ("ms", 1)] {
            let n = millis / size;
            if n > 0 {
                write!(f, "{n}{unit}")?;
                millis %= size;
            }
        }
        Ok(())
    }
}

impl FromStr for Duration {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        try_parse_interval(s).map(Self)
    }
}

impl Serialize for Duration {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Duration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct Visitor;
        impl de::Visitor<'_> for Visitor {
            type Value = Duration;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a duration such as \"15s\" or \"2h30m\"")
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                value.parse::<Duration>().map_err(de::Error::custom)
            }
        }
        deserializer.deserialize_str(Visitor)
    }
}
