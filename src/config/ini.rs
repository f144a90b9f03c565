//! Minimal INI-style config parser (`spec.md` §6): `[section]` headers,
//! `key = value` pairs, `#` line comments, whitespace insensitive around
//! separators. Mirrors the original C `ini.c` parser's contract: each
//! `key = value` line is handed to the caller together with its current
//! section, and the caller decides whether it's recognized.

use crate::error::{Error, Result};

/// One parsed `key = value` line, together with the section it appeared
/// under (empty string if none has been seen yet).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub section: String,
    pub key: String,
    pub value: String,
}

/// Parse INI source into a flat list of entries, in file order.
///
/// Returns an error only for structurally malformed lines (a `key`
/// without `=`, outside of a comment or blank line); unrecognized
/// sections/keys are the caller's concern, per `spec.md` §6 ("unknown
/// sections or keys cause the load to fail") — that check happens in
/// `Entry` consumers (`ClientConfig`/`ServerConfig`), not here.
pub fn parse(source: &str) -> Result<Vec<Entry>> {
    let mut entries = Vec::new();
    let mut section = String::new();

    for (lineno, raw_line) in source.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(stripped) = line.strip_prefix('[') {
            let name = stripped.strip_suffix(']').ok_or_else(|| {
                Error::config(format!("line {}: unterminated section header", lineno + 1))
            })?;
            section = name.trim().to_string();
            continue;
        }

        let (key, value) = line.split_once('=').ok_or_else(|| {
            Error::config(format!("line {}: expected 'key = value'", lineno + 1))
        })?;

        entries.push(Entry {
            section: section.clone(),
            key: key.trim().to_string(),
            value: value.trim().to_string(),
        });
    }

    Ok(entries)
}
