//! The `<name>.<interval><unit>.<ext>` naming convention of plugin files.

use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::IntervalError;

/// The shortest supported refresh interval, used whenever a file name does not specify a usable one.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

static INTERVAL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d+)([smh])$").unwrap());

/// The parts of a plugin file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginFileName {
    pub name: String,
    pub interval: Result<Duration, IntervalError>,
    pub extension: Option<String>,
}

impl PluginFileName {
    /// The interval the plugin should run at, falling back to [`DEFAULT_INTERVAL`].
    pub fn interval_or_default(&self) -> Duration {
        self.interval.clone().unwrap_or(DEFAULT_INTERVAL)
    }
}

/// Split a file name like `weather.30m.py` into its parts. This never fails;
/// a missing or broken interval segment is reported through [`PluginFileName::interval`].
pub fn parse_file_name(file_name: &str) -> PluginFileName {
    let segments: Vec<&str> = file_name.split('.').collect();
    match segments.as_slice() {
        [name] => PluginFileName { name: name.to_string(), interval: Err(IntervalError::Missing), extension: None },
        [name, last] => match parse_interval(last) {
            Ok(interval) => PluginFileName { name: name.to_string(), interval: Ok(interval), extension: None },
            Err(_) => PluginFileName {
                name: name.to_string(),
                interval: Err(IntervalError::Missing),
                extension: Some(last.to_string()),
            },
        },
        [name @ .., interval, extension] => PluginFileName {
            name: name.join("."),
            interval: parse_interval(interval),
            extension: Some(extension.to_string()),
        },
        [] => unreachable!("split always yields at least one segment"),
    }
}

/// Parse an interval segment like `10s`, `5m` or `1h`.
pub fn parse_interval(s: &str) -> Result<Duration, IntervalError> {
    let captures = INTERVAL.captures(s).ok_or_else(|| IntervalError::Malformed(s.to_string()))?;
    let amount: u64 = captures[1].parse().map_err(|_| IntervalError::Malformed(s.to_string()))?;
    if amount == 0 {
        return Err(IntervalError::Zero(s.to_string()));
    }
    let factor = match &captures[2] {
        "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        _ => unreachable!(),
    };
    amount.checked_mul(factor).map(Duration::from_secs).ok_or_else(|| IntervalError::Malformed(s.to_string()))
}

/// Parse a duration as used in configuration files: everything [`parse_interval`] accepts, plus milliseconds (`500ms`).
pub fn parse_duration(s: &str) -> Result<Duration, IntervalError> {
    match s.strip_suffix("ms") {
        Some(millis) => match millis.parse::<u64>() {
            Ok(0) => Err(IntervalError::Zero(s.to_string())),
            Ok(millis) => Ok(Duration::from_millis(millis)),
            Err(_) => Err(IntervalError::Malformed(s.to_string())),
        },
        None => parse_interval(s),
    }
}

/// Format a duration the way it would be written in a file name, picking the largest unit that fits exactly.
pub fn format_interval(duration: Duration) -> String {
    let secs = duration.as_secs();
    if duration.subsec_millis() != 0 || secs == 0 {
        format!("{}ms", duration.as_millis())
    } else if secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_interval() {
        assert_eq!(Ok(Duration::from_secs(10)), parse_interval("10s"));
        assert_eq!(Ok(Duration::from_secs(300)), parse_interval("5m"));
        assert_eq!(Ok(Duration::from_secs(3600)), parse_interval("1h"));
        assert_eq!(Err(IntervalError::Zero("0s".to_string())), parse_interval("0s"));
        assert_eq!(Err(IntervalError::Malformed("10d".to_string())), parse_interval("10d"));
        assert_eq!(Err(IntervalError::Malformed("1.5m".to_string())), parse_interval("1.5m"));
        assert!(parse_interval("99999999999999999999h").is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(Ok(Duration::from_millis(500)), parse_duration("500ms"));
        assert_eq!(Ok(Duration::from_secs(10)), parse_duration("10s"));
        assert!(parse_duration("0ms").is_err());
    }

    #[test]
    fn test_parse_file_name() {
        assert_eq!(
            PluginFileName { name: "cpu".to_string(), interval: Ok(Duration::from_secs(10)), extension: Some("sh".to_string()) },
            parse_file_name("cpu.10s.sh")
        );
        assert_eq!(
            PluginFileName {
                name: "my.site-check".to_string(),
                interval: Ok(Duration::from_secs(60)),
                extension: Some("go".to_string())
            },
            parse_file_name("my.site-check.1m.go")
        );
        assert_eq!(Duration::from_secs(3600), parse_file_name("quotes.1h").interval_or_default());
    }

    #[test]
    fn test_broken_intervals_fall_back() {
        let parsed = parse_file_name("cpu.fast.sh");
        assert_eq!(Err(IntervalError::Malformed("fast".to_string())), parsed.interval);
        assert_eq!(DEFAULT_INTERVAL, parsed.interval_or_default());

        let parsed = parse_file_name("script.py");
        assert_eq!(Err(IntervalError::Missing), parsed.interval);
        assert_eq!(Some("py".to_string()), parsed.extension);

        assert_eq!(Err(IntervalError::Missing), parse_file_name("script").interval);
    }

    #[test]
    fn test_format_interval() {
        assert_eq!("10s", format_interval(Duration::from_secs(10)));
        assert_eq!("5m", format_interval(Duration::from_secs(300)));
        assert_eq!("2h", format_interval(Duration::from_secs(7200)));
        assert_eq!("1500ms", format_interval(Duration::from_millis(1500)));
    }
}
