//! Expansion of Grafana's time macros in query text.
//!
//! Supported macros:
//!
//! - `$__timeFilter(col)`: `col BETWEEN <from> AND <to>`
//! - `$__timeFrom()` and `$__timeTo()`: the bounds of the dashboard time range
//! - `$__timeGroup(col, '5m')`: `col` truncated to multiples of the interval
//! - `$__timeGroupAlias(col, '5m')`: as `$__timeGroup`, aliased to `"time"`
//! - `$__unixEpochFilter(col)`: as `$__timeFilter`, for columns holding epoch seconds
//!
//! Timestamps are rendered as `from_iso8601_timestamp('...')` calls. Anything
//! else that looks like a macro is left untouched.

use std::sync::LazyLock;

use chrono::prelude::*;
use regex::Regex;
use thiserror::Error;

const KNOWN: &[&str] = &[
    "timeFilter",
    "timeFrom",
    "timeTo",
    "timeGroup",
    "timeGroupAlias",
    "unixEpochFilter",
];

static MACRO: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$__(\w+)\(").expect("macro pattern is valid"));

/// A macro could not be expanded.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum MacroError {
    /// A macro call is missing its closing parenthesis.
    #[error("unterminated call to macro $__{0}")]
    Unterminated(String),
    /// A macro was called with the wrong number of arguments.
    #[error("macro $__{name} expects {expected} argument(s), got {got}")]
    Arguments {
        /// The macro name.
        name: String,
        /// The number of arguments it takes.
        expected: usize,
        /// The number of arguments given.
        got: usize,
    },
    /// A `$__timeGroup` interval could not be parsed.
    #[error("invalid interval {0:?}; expected e.g. '30s', '5m', '1h' or '1d'")]
    InvalidInterval(String),
}

/// Expand the macros in `sql` for the time range `from`..`to`.
pub fn expand(sql: &str, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<String, MacroError> {
    let mut out = String::with_capacity(sql.len());
    let mut rest = sql;
    while let Some(caps) = MACRO.captures(rest) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            break;
        };
        let name = name.as_str();
        out.push_str(&rest[..whole.start()]);
        let after = &rest[whole.end()..];
        let Some(close) = closing_paren(after) else {
            if KNOWN.contains(&name) {
                return Err(MacroError::Unterminated(name.to_string()));
            }
            out.push_str(whole.as_str());
            rest = after;
            continue;
        };
        let args = split_args(&after[..close]);
        match apply(name, &args, from, to)? {
            Some(expanded) => out.push_str(&expanded),
            None => out.push_str(&rest[whole.start()..whole.end() + close + 1]),
        }
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Index of the parenthesis closing an already opened call.
fn closing_paren(s: &str) -> Option<usize> {
    let mut depth = 0_usize;
    let mut quoted = false;
    for (i, c) in s.char_indices() {
        match c {
            '\'' => quoted = !quoted,
            '(' if !quoted => depth += 1,
            ')' if !quoted => {
                if depth == 0 {
                    return Some(i);
                }
                depth -= 1;
            }
            _ => {}
        }
    }
    None
}

/// Split macro arguments on top-level commas.
fn split_args(s: &str) -> Vec<&str> {
    if s.trim().is_empty() {
        return Vec::new();
    }
    let mut args = Vec::new();
    let mut depth = 0_usize;
    let mut quoted = false;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '\'' => quoted = !quoted,
            '(' if !quoted => depth += 1,
            ')' if !quoted => depth = depth.saturating_sub(1),
            ',' if !quoted && depth == 0 => {
                args.push(s[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    args.push(s[start..].trim());
    args
}

fn timestamp(t: DateTime<Utc>) -> String {
    format!(
        "from_iso8601_timestamp('{}')",
        t.to_rfc3339_opts(SecondsFormat::Millis, true)
    )
}

fn expect_args(name: &str, args: &[&str], expected: usize) -> Result<(), MacroError> {
    if args.len() == expected {
        Ok(())
    } else {
        Err(MacroError::Arguments {
            name: name.to_string(),
            expected,
            got: args.len(),
        })
    }
}

fn apply(
    name: &str,
    args: &[&str],
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Option<String>, MacroError> {
    Ok(Some(match name {
        "timeFilter" => {
            expect_args(name, args, 1)?;
            format!("{} BETWEEN {} AND {}", args[0], timestamp(from), timestamp(to))
        }
        "timeFrom" => {
            expect_args(name, args, 0)?;
            timestamp(from)
        }
        "timeTo" => {
            expect_args(name, args, 0)?;
            timestamp(to)
        }
        "timeGroup" | "timeGroupAlias" => {
            expect_args(name, args, 2)?;
            let seconds = parse_interval(args[1])?;
            let group = format!(
                "from_unixtime(floor(to_unixtime({}) / {seconds}) * {seconds})",
                args[0]
            );
            if name == "timeGroupAlias" {
                format!("{group} AS \"time\"")
            } else {
                group
            }
        }
        "unixEpochFilter" => {
            expect_args(name, args, 1)?;
            format!(
                "{} BETWEEN {} AND {}",
                args[0],
                from.timestamp(),
                to.timestamp()
            )
        }
        _ => return Ok(None),
    }))
}

/// Parse an interval such as `'5m'` into whole seconds.
fn parse_interval(raw: &str) -> Result<u64, MacroError> {
    let invalid = || MacroError::InvalidInterval(raw.to_string());
    let s = raw.trim().trim_matches(|c: char| c == '\'' || c == '"').trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    let number: u64 = number.parse().map_err(|_| invalid())?;
    let scale = match unit {
        "" | "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        "d" => 24 * 60 * 60,
        "w" => 7 * 24 * 60 * 60,
        _ => return Err(invalid()),
    };
    match number.checked_mul(scale) {
        Some(seconds) if seconds > 0 => Ok(seconds),
        _ => Err(invalid()),
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    fn range() -> (DateTime<Utc>, DateTime<Utc>) {
        (
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 1, 6, 0, 0).unwrap(),
        )
    }

    #[test]
    fn time_filter() {
        let (from, to) = range();
        assert_eq!(
            expand("SELECT * FROM t WHERE $__timeFilter(ts)", from, to).unwrap(),
            "SELECT * FROM t WHERE ts BETWEEN from_iso8601_timestamp('2024-01-01T00:00:00.000Z') \
             AND from_iso8601_timestamp('2024-01-01T06:00:00.000Z')"
        );
    }

    #[test]
    fn time_from_and_to() {
        let (from, to) = range();
        assert_eq!(
            expand("SELECT $__timeFrom(), $__timeTo()", from, to).unwrap(),
            "SELECT from_iso8601_timestamp('2024-01-01T00:00:00.000Z'), \
             from_iso8601_timestamp('2024-01-01T06:00:00.000Z')"
        );
    }

    #[test]
    fn time_group() {
        let (from, to) = range();
        assert_eq!(
            expand("SELECT $__timeGroup(ts, '5m'), count(*)", from, to).unwrap(),
            "SELECT from_unixtime(floor(to_unixtime(ts) / 300) * 300), count(*)"
        );
        assert_eq!(
            expand("SELECT $__timeGroupAlias(cast(ts AS timestamp), '1h')", from, to).unwrap(),
            "SELECT from_unixtime(floor(to_unixtime(cast(ts AS timestamp)) / 3600) * 3600) AS \"time\""
        );
    }

    #[test]
    fn unix_epoch_filter() {
        let (from, to) = range();
        assert_eq!(
            expand("WHERE $__unixEpochFilter(epoch)", from, to).unwrap(),
            "WHERE epoch BETWEEN 1704067200 AND 1704088800"
        );
    }

    #[test]
    fn bad_interval() {
        let (from, to) = range();
        assert_eq!(
            expand("SELECT $__timeGroup(ts, 'soon')", from, to).unwrap_err(),
            MacroError::InvalidInterval("'soon'".to_string())
        );
        assert!(expand("SELECT $__timeGroup(ts, '0s')", from, to).is_err());
    }

    #[test]
    fn wrong_arguments() {
        let (from, to) = range();
        assert_eq!(
            expand("WHERE $__timeFilter()", from, to).unwrap_err(),
            MacroError::Arguments {
                name: "timeFilter".to_string(),
                expected: 1,
                got: 0
            }
        );
        assert!(matches!(
            expand("WHERE $__timeFilter(ts", from, to).unwrap_err(),
            MacroError::Unterminated(_)
        ));
    }

    #[test]
    fn unknown_macros_are_kept() {
        let (from, to) = range();
        let sql = "SELECT $__interval(x), '$__timeFrom' FROM t";
        assert_eq!(expand(sql, from, to).unwrap(), sql);
    }

    #[test]
    fn unterminated_unknown_macros_are_kept() {
        let (from, to) = range();
        let sql = "SELECT '$__foo(' AS s FROM t";
        assert_eq!(expand(sql, from, to).unwrap(), sql);
        assert_eq!(
            expand("SELECT '$__foo(' AS s, $__timeFrom()", from, to).unwrap(),
            "SELECT '$__foo(' AS s, from_iso8601_timestamp('2024-01-01T00:00:00.000Z')"
        );
    }

    #[test]
    fn intervals() {
        assert_eq!(parse_interval("'30s'"), Ok(30));
        assert_eq!(parse_interval("15"), Ok(15));
        assert_eq!(parse_interval("'1d'"), Ok(86_400));
        assert_eq!(parse_interval("'2w'"), Ok(1_209_600));
        assert!(parse_interval("'m'").is_err());
    }
}
