// src/pgconf.rs
//! In-place editing of `postgresql.conf`.
//!
//! Only the keys being set are touched; every other line (comments, unrelated
//! settings, blank lines) is written back verbatim. For each key with a value:
//! - active lines setting it are replaced,
//! - otherwise the first commented-out default (`#key = ...`) is replaced,
//! - otherwise a new line is appended.
//!
//! A key without a value has its active lines commented out.

use anyhow::{Context, Result};
use regex::Regex;
use std::sync::OnceLock;

const SETTING_LINE: &str = r"^\s*(#)?\s*([A-Za-z_][A-Za-z0-9_.]*)\s*=";

fn setting_line() -> Result<&'static Regex> {
    static RE: OnceLock<Regex> = OnceLock::new();
    if let Some(re) = RE.get() {
        return Ok(re);
    }
    let re = Regex::new(SETTING_LINE).context("compile postgresql.conf line pattern")?;
    Ok(RE.get_or_init(|| re))
}

/// Quote a value the way postgresql.conf expects string literals
pub fn quote_value(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Apply `settings` to the text of a postgresql.conf and return the new text.
pub fn apply_settings<K, V>(text: &str, settings: &[(K, V)]) -> Result<String>
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    let all: Vec<(&str, Option<&str>)> = settings
        .iter()
        .map(|(k, v)| (k.as_ref(), Some(v.as_ref())))
        .collect();
    update_settings(text, &all)
}

/// Like [`apply_settings`], but a `None` value comments the key out.
pub fn update_settings(text: &str, settings: &[(&str, Option<&str>)]) -> Result<String> {
    let re = setting_line()?;
    let mut lines: Vec<String> = text.lines().map(str::to_string).collect();

    for &(key, value) in settings {
        let mut active = Vec::new();
        let mut first_commented = None;
        for (i, line) in lines.iter().enumerate() {
            if let Some(caps) = re.captures(line) {
                if &caps[2] != key {
                    continue;
                }
                if caps.get(1).is_some() {
                    first_commented.get_or_insert(i);
                } else {
                    active.push(i);
                }
            }
        }

        let Some(value) = value else {
            for i in active {
                lines[i] = format!("#{}", lines[i]);
            }
            continue;
        };
        let replacement = format!("{} = {}", key, quote_value(value));
        if !active.is_empty() {
            for i in active {
                lines[i] = replacement.clone();
            }
        } else if let Some(i) = first_commented {
            lines[i] = replacement;
        } else {
            lines.push(replacement);
        }
    }

    let mut out = lines.join("\n");
    out.push('\n');
    Ok(out)
}

/// Current value of `key` (last active line wins), unquoted
pub fn get_setting(text: &str, key: &str) -> Result<Option<String>> {
    let re = setting_line()?;
    Ok(text
        .lines()
        .filter_map(|line| {
            let caps = re.captures(line)?;
            if caps.get(1).is_some() || &caps[2] != key {
                return None;
            }
            let rest = line[caps.get(0)?.end()..].trim();
            let v = match rest.strip_prefix('\'') {
                Some(quoted) => unquote(quoted),
                None => rest.split('#').next().unwrap_or("").trim().to_string(),
            };
            Some(v)
        })
        .last())
}

/// Body of a single-quoted literal (opening quote already consumed)
fn unquote(quoted: &str) -> String {
    let mut out = String::new();
    let mut chars = quoted.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\'' {
            if chars.peek() == Some(&'\'') {
                chars.next();
                out.push('\'');
                continue;
            }
            break;
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONF: &str = "\
# - Connection Settings -

#listen_addresses = 'localhost'\t\t# what IP address(es) to listen on;
port = 5432\t\t\t\t# (change requires restart)
max_connections = 100
shared_buffers = 128MB\t\t\t# min 128kB
#work_mem = 4MB
";

    #[test]
    fn test_replaces_active_and_commented() {
        let out = apply_settings(
            CONF,
            &[("listen_addresses", "*"), ("shared_buffers", "2GB"), ("work_mem", "64MB")],
        )
        .unwrap();
        assert!(out.contains("listen_addresses = '*'\n"));
        assert!(out.contains("shared_buffers = '2GB'\n"));
        assert!(out.contains("work_mem = '64MB'\n"));
        assert!(!out.contains("128MB"));
        // untouched lines survive verbatim
        assert!(out.contains("max_connections = 100\n"));
        assert!(out.contains("# - Connection Settings -\n"));
        assert_eq!(out.lines().count(), CONF.lines().count());
    }

    #[test]
    fn test_appends_unknown_key() {
        let out = apply_settings(CONF, &[("pbm_evict_num_samples", "10")]).unwrap();
        assert!(out.ends_with("pbm_evict_num_samples = '10'\n"));
    }

    #[test]
    fn test_does_not_match_key_prefix() {
        let text = "shared_buffers_extra = 1\n";
        let out = apply_settings(text, &[("shared_buffers", "1GB")]).unwrap();
        assert!(out.contains("shared_buffers_extra = 1"));
        assert!(out.contains("shared_buffers = '1GB'"));
    }

    #[test]
    fn test_idempotent() {
        let s = [("port", "5432"), ("synchronize_seqscans", "on")];
        let once = apply_settings(CONF, &s).unwrap();
        let twice = apply_settings(&once, &s).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_get_setting() {
        let out = apply_settings(CONF, &[("shared_buffers", "8GB")]).unwrap();
        assert_eq!(get_setting(&out, "shared_buffers").unwrap().as_deref(), Some("8GB"));
        assert_eq!(get_setting(CONF, "max_connections").unwrap().as_deref(), Some("100"));
        assert_eq!(get_setting(CONF, "work_mem").unwrap(), None);
        assert_eq!(get_setting(CONF, "port").unwrap().as_deref(), Some("5432"));
        let quoted = "search_path = 'a''b' # it's a comment\n";
        assert_eq!(get_setting(quoted, "search_path").unwrap().as_deref(), Some("a'b"));
    }

    #[test]
    fn test_unset_key_is_commented_out() {
        let text = apply_settings(CONF, &[("pbm_evict_num_samples", "10"), ("work_mem", "64MB")]).unwrap();
        let out = update_settings(
            &text,
            &[("shared_buffers", Some("1GB")), ("pbm_evict_num_samples", None), ("work_mem", None)],
        )
        .unwrap();
        assert_eq!(get_setting(&out, "pbm_evict_num_samples").unwrap(), None);
        assert_eq!(get_setting(&out, "work_mem").unwrap(), None);
        assert!(out.contains("#pbm_evict_num_samples = '10'\n"));
        assert!(out.contains("shared_buffers = '1GB'\n"));

        // a later value reuses the commented line instead of appending
        let again = update_settings(&out, &[("pbm_evict_num_samples", Some("5"))]).unwrap();
        assert_eq!(get_setting(&again, "pbm_evict_num_samples").unwrap().as_deref(), Some("5"));
        assert_eq!(again.lines().count(), out.lines().count());

        // keys never present stay absent
        let untouched = update_settings(CONF, &[("pbm_lru_if_not_requested", None)]).unwrap();
        assert_eq!(untouched, CONF);
    }
}
