use crate::error::KeelResult;
use crate::lockfile::{Lockfile, LockfileFlags};
use regex::Regex;
use std::io::prelude::*;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// key/value store over a sectioned plain-text file:
/// `[section]` headers, `key = value` lines, `#`/`;` comments, double-quoted
/// values with `\n \t \b \\ \"` escapes and trailing-backslash continuations.
///
/// mutation rewrites the file through `<config>.lock`: the preserved prefix,
/// the modified middle and the preserved suffix are written to the lock file
/// which is renamed over the original.
pub struct KeelConfig {
    path: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
struct ConfigEntry {
    section: String,
    key: String,
    value: String,
    /// byte span of the whole `key = value` line(s) including the newline
    line_span: Range<usize>,
}

impl ConfigEntry {
    fn matches(&self, section: &str, key: &str) -> bool {
        // section names are case-insensitive, keys are stored lowercased
        self.section.eq_ignore_ascii_case(section) && self.key == key
    }
}

pub trait KeelConfigValue: Sized {
    fn parse_config(s: &str) -> KeelResult<Self>;
}

impl KeelConfigValue for String {
    fn parse_config(s: &str) -> KeelResult<Self> {
        Ok(s.to_owned())
    }
}

impl KeelConfigValue for i64 {
    fn parse_config(s: &str) -> KeelResult<Self> {
        Ok(s.parse()?)
    }
}

impl KeelConfigValue for bool {
    // accepts `true`/`false` or an integer (nonzero is true)
    fn parse_config(s: &str) -> KeelResult<Self> {
        match s {
            "true" | "yes" | "on" => Ok(true),
            "false" | "no" | "off" | "" => Ok(false),
            _ => Ok(i64::from_str(s)? != 0),
        }
    }
}

impl KeelConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_text(&self) -> KeelResult<String> {
        if !self.path.exists() {
            return Ok(String::new());
        }
        Ok(std::fs::read_to_string(&self.path)?)
    }

    /// typed lookup of `section.key`; `None` if the key is absent
    pub fn get<T: KeelConfigValue>(&self, key: &str) -> KeelResult<Option<T>> {
        let (section, key) = split_key(key)?;
        let text = self.read_text()?;
        let entries = parse_entries(&text)?;
        entries
            .iter()
            .rev()
            .find(|entry| entry.matches(section, key))
            .map(|entry| T::parse_config(&entry.value))
            .transpose()
    }

    /// sets `section.key` to `value`, or deletes matching occurrences when
    /// `value` is `None`. `value_regex` restricts the edit to occurrences whose
    /// current value matches; with more than one match the call refuses to
    /// proceed unless `replace_all` is set.
    pub fn set(
        &self,
        key: &str,
        value: Option<&str>,
        value_regex: Option<&Regex>,
        replace_all: bool,
    ) -> KeelResult<()> {
        let (section, key) = split_key(key)?;

        Lockfile::with_mut(&self.path, LockfileFlags::empty(), |lockfile| {
            // parse the current contents under the lock so a concurrent writer
            // cannot invalidate the remembered offsets
            let text = match lockfile.file() {
                Some(mut file) => {
                    let mut text = String::new();
                    file.read_to_string(&mut text)?;
                    text
                }
                None => String::new(),
            };
            let entries = parse_entries(&text)?;

            let matches: Vec<&ConfigEntry> = entries
                .iter()
                .filter(|entry| entry.matches(section, key))
                .filter(|entry| value_regex.map_or(true, |re| re.is_match(&entry.value)))
                .collect();

            if matches.len() > 1 && !replace_all {
                bail!(
                    "key `{}.{}` has multiple values; refusing to modify without replace-all",
                    section,
                    key
                );
            }

            let new_text = match value {
                Some(value) => {
                    if matches.is_empty() {
                        insert_entry(&text, &entries, section, key, value)
                    } else {
                        splice_spans(
                            &text,
                            matches.iter().map(|entry| entry.line_span.clone()),
                            &format_entry_line(key, value),
                        )
                    }
                }
                None => splice_spans(
                    &text,
                    matches.iter().map(|entry| entry.line_span.clone()),
                    "",
                ),
            };

            lockfile.write_all(new_text.as_bytes())?;
            Ok(())
        })
    }
}

fn split_key(key: &str) -> KeelResult<(&str, &str)> {
    key.split_once('.').ok_or_else(|| anyhow!("config key `{}` has no section", key))
}

fn format_entry_line(key: &str, value: &str) -> String {
    let needs_quoting = value.is_empty()
        || value.starts_with(char::is_whitespace)
        || value.ends_with(char::is_whitespace)
        || value.contains(['#', ';', '"', '\\', '\n']);
    if needs_quoting {
        let escaped = value
            .replace('\\', "\\\\")
            .replace('"', "\\\"")
            .replace('\n', "\\n")
            .replace('\t', "\\t");
        format!("\t{} = \"{}\"\n", key, escaped)
    } else {
        format!("\t{} = {}\n", key, value)
    }
}

/// rewrites `text` replacing each span (ascending, non-overlapping) with
/// `replacement`; the bytes between spans are preserved untouched
fn splice_spans(
    text: &str,
    spans: impl IntoIterator<Item = Range<usize>>,
    replacement: &str,
) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pos = 0;
    for span in spans {
        debug_assert!(span.start >= pos);
        out.push_str(&text[pos..span.start]);
        out.push_str(replacement);
        pos = span.end;
    }
    out.push_str(&text[pos..]);
    out
}

/// appends `key = value` into `section`, creating the section when missing
fn insert_entry(
    text: &str,
    entries: &[ConfigEntry],
    section: &str,
    key: &str,
    value: &str,
) -> String {
    let line = format_entry_line(key, value);
    // insert after the last entry of the section when it exists
    if let Some(last) = entries.iter().filter(|e| e.section.eq_ignore_ascii_case(section)).last() {
        let pos = last.line_span.end;
        let mut out = String::with_capacity(text.len() + line.len());
        out.push_str(&text[..pos]);
        out.push_str(&line);
        out.push_str(&text[pos..]);
        return out;
    }

    // does the section header exist with no entries?
    if let Some(pos) = find_section_end(text, section) {
        let mut out = String::with_capacity(text.len() + line.len());
        out.push_str(&text[..pos]);
        out.push_str(&line);
        out.push_str(&text[pos..]);
        return out;
    }

    let mut out = text.to_owned();
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(&format!("[{}]\n", section));
    out.push_str(&line);
    out
}

/// byte offset just past the header line of `[section]`, if present
fn find_section_end(text: &str, section: &str) -> Option<usize> {
    let mut pos = 0;
    for line in text.split_inclusive('\n') {
        let trimmed = line.trim();
        if let Some(name) = trimmed.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            if name.trim().eq_ignore_ascii_case(section) {
                return Some(pos + line.len());
            }
        }
        pos += line.len();
    }
    None
}

/// parses the whole file into entries with their byte spans; malformed lines
/// are an error, matching the strictness of the original reader
fn parse_entries(text: &str) -> KeelResult<Vec<ConfigEntry>> {
    let mut entries = vec![];
    let mut section = String::new();
    let bytes = text.as_bytes();
    let mut pos = 0;

    while pos < bytes.len() {
        let line_start = pos;
        // leading whitespace
        while pos < bytes.len() && (bytes[pos] == b' ' || bytes[pos] == b'\t') {
            pos += 1;
        }

        match bytes.get(pos) {
            None => break,
            Some(b'\n') => {
                pos += 1;
                continue;
            }
            Some(b'#' | b';') => {
                pos = skip_line(bytes, pos);
                continue;
            }
            Some(b'[') => {
                pos += 1;
                let start = pos;
                while pos < bytes.len() && bytes[pos] != b']' && bytes[pos] != b'\n' {
                    pos += 1;
                }
                ensure!(bytes.get(pos) == Some(&b']'), "bad config section header");
                section = text[start..pos].trim().to_owned();
                pos = skip_line(bytes, pos);
            }
            Some(_) => {
                ensure!(!section.is_empty(), "config entry before any section header");
                let start = pos;
                while pos < bytes.len()
                    && (bytes[pos].is_ascii_alphanumeric() || bytes[pos] == b'-')
                {
                    pos += 1;
                }
                ensure!(pos > start, "bad config key");
                let key = text[start..pos].to_ascii_lowercase();

                while pos < bytes.len() && (bytes[pos] == b' ' || bytes[pos] == b'\t') {
                    pos += 1;
                }
                let value = match bytes.get(pos) {
                    Some(b'=') => {
                        pos += 1;
                        let (value, end) = parse_value(text, pos)?;
                        pos = end;
                        value
                    }
                    // a key with no `=` is a boolean true
                    Some(b'\n') | None => {
                        pos = skip_line(bytes, pos);
                        "true".to_owned()
                    }
                    Some(_) => bail!("bad config line for key `{}`", key),
                };

                entries.push(ConfigEntry {
                    section: section.clone(),
                    key,
                    value,
                    line_span: line_start..pos,
                });
            }
        }
    }
    Ok(entries)
}

fn skip_line(bytes: &[u8], mut pos: usize) -> usize {
    while pos < bytes.len() && bytes[pos] != b'\n' {
        pos += 1;
    }
    pos.min(bytes.len()) + usize::from(pos < bytes.len())
}

/// parses a value starting at `pos` (just past the `=`), handling quoting,
/// escapes, comments and line continuations; returns the value and the byte
/// offset just past the terminating newline
fn parse_value(text: &str, mut pos: usize) -> KeelResult<(String, usize)> {
    let bytes = text.as_bytes();
    let mut value = vec![];
    let mut quote = false;
    let mut space = 0usize;

    while pos < bytes.len() && (bytes[pos] == b' ' || bytes[pos] == b'\t') {
        pos += 1;
    }

    loop {
        let c = match bytes.get(pos) {
            None => break,
            Some(&c) => c,
        };
        pos += 1;

        match c {
            b'\n' => {
                ensure!(!quote, "unterminated quote in config value");
                break;
            }
            b' ' | b'\t' if !quote => space += 1,
            b'\\' => {
                let escaped = bytes.get(pos).copied();
                pos += 1;
                match escaped {
                    // trailing backslash continues the value on the next line
                    Some(b'\n') => continue,
                    Some(b't') => push_spaced(&mut value, &mut space, b'\t'),
                    Some(b'b') => push_spaced(&mut value, &mut space, 0x08),
                    Some(b'n') => push_spaced(&mut value, &mut space, b'\n'),
                    Some(b'\\') => push_spaced(&mut value, &mut space, b'\\'),
                    Some(b'"') => push_spaced(&mut value, &mut space, b'"'),
                    _ => bail!("bad escape in config value"),
                }
            }
            b'"' => quote = !quote,
            b'#' | b';' if !quote => {
                pos = skip_line(bytes, pos - 1);
                break;
            }
            _ => push_spaced(&mut value, &mut space, c),
        }
    }

    ensure!(!quote, "unterminated quote in config value");
    Ok((String::from_utf8(value)?, pos))
}

/// interior runs of whitespace collapse to a single space, trailing ones drop
fn push_spaced(value: &mut Vec<u8>, space: &mut usize, c: u8) {
    if *space > 0 && !value.is_empty() {
        value.push(b' ');
    }
    *space = 0;
    value.push(c);
}
