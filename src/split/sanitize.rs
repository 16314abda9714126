// src/split/sanitize.rs

use once_cell::sync::Lazy;
use regex::Regex;

/// Key used for rows whose partition column is empty.
pub const UNKNOWN_KEY: &str = "unknown";

static ILLEGAL_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"[<>:"/\\|?*\x00-\x1F]"#).expect("illegal-char pattern is valid"));
static UNDERSCORE_RUNS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"_+").expect("underscore pattern is valid"));

/// Resolve the partition key for a raw column value.
pub fn partition_key(raw: &str) -> &str {
    if raw.is_empty() {
        UNKNOWN_KEY
    } else {
        raw
    }
}

/// Turn a partition key into a name that is safe on every common filesystem.
///
/// Illegal characters become `_`, runs of `_` collapse to one, and leading or
/// trailing spaces, dots and underscores are trimmed. Applying it twice gives
/// the same result as applying it once.
pub fn sanitize_filename(name: &str) -> String {
    let replaced = ILLEGAL_CHARS.replace_all(name, "_");
    let collapsed = UNDERSCORE_RUNS.replace_all(&replaced, "_");
    let trimmed = collapsed.trim_matches(|c| c == ' ' || c == '.' || c == '_');
    if trimmed.is_empty() {
        UNKNOWN_KEY.to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replaces_illegal_characters() {
        assert_eq!(sanitize_filename("access_combined"), "access_combined");
        assert_eq!(sanitize_filename("WinEventLog:Security"), "WinEventLog_Security");
        assert_eq!(sanitize_filename("a/b\\c|d"), "a_b_c_d");
        assert_eq!(sanitize_filename("tab\there"), "tab_here");
        assert_eq!(sanitize_filename("x::<>y"), "x_y");
    }

    #[test]
    fn trims_edges_and_falls_back() {
        assert_eq!(sanitize_filename("  .hidden. "), "hidden");
        assert_eq!(sanitize_filename("__a__"), "a");
        assert_eq!(sanitize_filename("???"), "unknown");
        assert_eq!(sanitize_filename(""), "unknown");
    }

    #[test]
    fn sanitizing_is_idempotent() {
        let samples = [
            "WinEventLog:Security",
            " ._weird__name?.log._ ",
            "cisco:asa",
            "a<>b",
            "...",
            "plain",
            "mixed _:_ runs",
        ];
        for s in samples {
            let once = sanitize_filename(s);
            assert_eq!(sanitize_filename(&once), once, "input {:?}", s);
        }
    }

    #[test]
    fn empty_key_is_unknown() {
        assert_eq!(partition_key(""), "unknown");
        assert_eq!(partition_key("syslog"), "syslog");
    }
}
