//! Helpers for `key=value` plugin options
//!
//! Numbers follow the usual C conventions: a `0x` prefix selects
//! hexadecimal, a leading `0` selects octal, anything else is decimal.
//! Unlike `strtoull`, trailing garbage and signs are rejected.

use crate::error::ConfigError;

/// Split `key=value` on the first `=`
pub fn split_option(opt: &str) -> (&str, Option<&str>) {
    match opt.split_once('=') {
        Some((key, value)) => (key, Some(value)),
        None => (opt, None),
    }
}

/// Value of an option that requires one
pub fn require_value<'a>(key: &str, value: Option<&'a str>) -> Result<&'a str, ConfigError> {
    match value {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(ConfigError::MissingValue(key.to_string())),
    }
}

/// Parse an unsigned integer with C-style base detection
pub fn parse_u64(key: &str, token: &str) -> Result<u64, ConfigError> {
    let invalid = || ConfigError::InvalidNumber {
        key: key.to_string(),
        value: token.to_string(),
    };

    let (digits, radix) = if let Some(hex) = token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))
    {
        (hex, 16)
    } else if token.len() > 1 && token.starts_with('0') {
        (&token[1..], 8)
    } else {
        (token, 10)
    };

    // from_str_radix accepts a leading '+', which we do not
    if digits.is_empty() || !digits.chars().all(|c| c.is_digit(radix)) {
        return Err(invalid());
    }

    u64::from_str_radix(digits, radix).map_err(|_| invalid())
}

/// Parse a strictly positive count
///
/// Negative values are reported as "not positive" rather than as a
/// malformed number, since that is what the user meant.
pub fn parse_positive(key: &str, token: &str) -> Result<u64, ConfigError> {
    let not_positive = || ConfigError::NotPositive {
        key: key.to_string(),
        value: token.to_string(),
    };

    if token.trim_start().starts_with('-') {
        return Err(not_positive());
    }

    match parse_u64(key, token)? {
        0 => Err(not_positive()),
        count => Ok(count),
    }
}

/// Parse a process exit code
pub fn parse_exit_code(key: &str, token: &str) -> Result<i32, ConfigError> {
    let code = parse_u64(key, token)?;
    i32::try_from(code).map_err(|_| ConfigError::ExitCodeOutOfRange {
        key: key.to_string(),
        value: token.to_string(),
    })
}

/// Split `value[:exit_code]`, returning the value part and the exit code
///
/// The exit code defaults to 0 when absent.
pub fn split_exit_code<'a>(key: &str, value: &'a str) -> Result<(&'a str, i32), ConfigError> {
    match value.split_once(':') {
        Some((value, code)) => Ok((value, parse_exit_code(key, code)?)),
        None => Ok((value, 0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_option() {
        assert_eq!(split_option("icount=5"), ("icount", Some("5")));
        assert_eq!(split_option("addr=0x10:2"), ("addr", Some("0x10:2")));
        assert_eq!(split_option("savevm=a=b"), ("savevm", Some("a=b")));
        assert_eq!(split_option("flag"), ("flag", None));
    }

    #[test]
    fn test_parse_u64_bases() {
        assert_eq!(parse_u64("k", "42").unwrap(), 42);
        assert_eq!(parse_u64("k", "0x1000").unwrap(), 0x1000);
        assert_eq!(parse_u64("k", "0X1f").unwrap(), 0x1f);
        assert_eq!(parse_u64("k", "010").unwrap(), 8);
        assert_eq!(parse_u64("k", "0").unwrap(), 0);
    }

    #[test]
    fn test_parse_u64_rejects_malformed() {
        for token in ["", "0x", "12abc", "+5", "-1", "09", " 1", "0xfg"] {
            assert!(
                matches!(parse_u64("k", token), Err(ConfigError::InvalidNumber { .. })),
                "'{}' should be rejected",
                token
            );
        }
    }

    #[test]
    fn test_parse_positive() {
        assert_eq!(parse_positive("icount", "3").unwrap(), 3);
        assert!(matches!(
            parse_positive("icount", "0"),
            Err(ConfigError::NotPositive { .. })
        ));
        let err = parse_positive("icount", "-1").unwrap_err();
        assert_eq!(
            err.to_string(),
            "icount parsing failed: '-1' must be a positive integer"
        );
    }

    #[test]
    fn test_split_exit_code() {
        assert_eq!(split_exit_code("icount", "5:7").unwrap(), ("5", 7));
        assert_eq!(split_exit_code("icount", "5").unwrap(), ("5", 0));
        assert!(split_exit_code("icount", "5:x").is_err());
        assert!(matches!(
            split_exit_code("addr", "0x10:0x100000000"),
            Err(ConfigError::ExitCodeOutOfRange { .. })
        ));
    }

    #[test]
    fn test_require_value() {
        assert_eq!(require_value("savevm", Some("snap")).unwrap(), "snap");
        assert!(require_value("savevm", Some("")).is_err());
        assert!(require_value("savevm", None).is_err());
    }
}
