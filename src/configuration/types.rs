use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use std::str::FromStr;
use std::time::Duration;

/// Inactivity window after which a sandbox container is eligible for
/// teardown. Parsed from strings like `"30s"`, `"10m"`, `"2h"`, or `"never"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepAfter {
    Duration(Duration),
    Never,
}

impl SleepAfter {
    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            SleepAfter::Duration(d) => Some(*d),
            SleepAfter::Never => None,
        }
    }
}

impl Default for SleepAfter {
    fn default() -> Self {
        SleepAfter::Duration(Duration::from_secs(600))
    }
}

impl FromStr for SleepAfter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("never") {
            return Ok(SleepAfter::Never);
        }
        let (value, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
            Some(idx) => s.split_at(idx),
            None => (s, "s"),
        };
        let value: u64 = value
            .parse()
            .map_err(|_| format!("invalid duration: {}", s))?;
        let secs = match unit.trim() {
            "s" | "sec" | "secs" => value,
            "m" | "min" | "mins" => value * 60,
            "h" | "hour" | "hours" => value * 3600,
            other => return Err(format!("unknown duration unit: {}", other)),
        };
        if secs == 0 {
            return Err("duration must be positive".to_string());
        }
        Ok(SleepAfter::Duration(Duration::from_secs(secs)))
    }
}

impl<'de> Deserialize<'de> for SleepAfter {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        SleepAfter::from_str(&raw).map_err(D::Error::custom)
    }
}

impl std::fmt::Display for SleepAfter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SleepAfter::Never => write!(f, "never"),
            SleepAfter::Duration(d) => write!(f, "{}s", d.as_secs()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_units_and_never() {
        assert_eq!(
            "30s".parse::<SleepAfter>().unwrap(),
            SleepAfter::Duration(Duration::from_secs(30))
        );
        assert_eq!(
            "10m".parse::<SleepAfter>().unwrap(),
            SleepAfter::Duration(Duration::from_secs(600))
        );
        assert_eq!(
            "2h".parse::<SleepAfter>().unwrap(),
            SleepAfter::Duration(Duration::from_secs(7200))
        );
        assert_eq!("never".parse::<SleepAfter>().unwrap(), SleepAfter::Never);
        assert_eq!(
            "45".parse::<SleepAfter>().unwrap(),
            SleepAfter::Duration(Duration::from_secs(45))
        );
    }

    #[test]
    fn rejects_garbage() {
        assert!("".parse::<SleepAfter>().is_err());
        assert!("10x".parse::<SleepAfter>().is_err());
        assert!("0s".parse::<SleepAfter>().is_err());
    }
}
