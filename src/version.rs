// src/version.rs

//! Debian package version ordering
//!
//! Versions have the form `[epoch:]upstream[-revision]` and are ordered the
//! way dpkg orders them, with two local rules:
//!
//! - non-digit characters keep their plain ASCII order (`~` excepted, which
//!   sorts before everything, even the end of a run)
//! - when every segment ties, the version with more segments is newer, so
//!   `1:1.0-0` sorts after `1:1.0`
//!
//! Numeric runs are compared by magnitude without any width limit.
//!
//! [`Version::sortable_key`] produces a string whose byte order is exactly
//! the version order, so the catalog can `ORDER BY` it without re-parsing.

use crate::error::{Error, Result};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// A parsed package version
#[derive(Debug, Clone)]
pub struct Version {
    raw: String,
    /// Epoch digits with leading zeros removed ("" means 0)
    epoch: String,
    upstream: String,
    revision: String,
}

impl Version {
    /// Parse a version string, rejecting anything outside the grammar
    pub fn parse(raw: &str) -> Result<Self> {
        let malformed = || Error::MalformedVersion(raw.to_string());

        let (epoch, body) = match raw.split_once(':') {
            Some((epoch, body)) => {
                if epoch.is_empty() || !epoch.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(malformed());
                }
                (epoch, body)
            }
            None => ("0", raw),
        };

        if body.is_empty() || !body.bytes().all(is_body_char) {
            return Err(malformed());
        }

        let (upstream, revision) = match body.rsplit_once('-') {
            Some((upstream, revision)) => (upstream, revision),
            None => (body, ""),
        };

        Ok(Self {
            raw: raw.to_string(),
            epoch: epoch.trim_start_matches('0').to_string(),
            upstream: upstream.to_string(),
            revision: revision.to_string(),
        })
    }

    /// The epoch as written, without leading zeros ("0" when absent)
    pub fn epoch(&self) -> &str {
        if self.epoch.is_empty() { "0" } else { &self.epoch }
    }

    pub fn upstream(&self) -> &str {
        &self.upstream
    }

    pub fn revision(&self) -> &str {
        &self.revision
    }

    /// The original string this version was parsed from
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Encode this version as a string whose byte order matches version order
    pub fn sortable_key(&self) -> String {
        let mut key = String::with_capacity(self.raw.len() * 2 + 8);
        push_number(&mut key, &self.epoch);
        key.push('!');
        push_body(&mut key, &self.upstream);
        key.push('!');
        push_body(&mut key, &self.revision);
        key
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Version::parse(s)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_number(&self.epoch, &other.epoch)
            .then_with(|| compare_body(&self.upstream, &other.upstream))
            .then_with(|| compare_body(&self.revision, &other.revision))
    }
}

/// Compare two raw version strings
///
/// Fails with `MalformedVersion` if either side is outside the grammar.
pub fn compare(a: &str, b: &str) -> Result<Ordering> {
    Ok(Version::parse(a)?.cmp(&Version::parse(b)?))
}

/// Sortable key for a raw version string
pub fn sortable_key(raw: &str) -> Result<String> {
    Ok(Version::parse(raw)?.sortable_key())
}

fn is_body_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'.' | b'+' | b'~' | b'-')
}

/// One run of a version body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Segment<'a> {
    Text(&'a str),
    /// Digits with leading zeros removed
    Number(&'a str),
}

/// Split a body into alternating non-digit and digit runs
///
/// The sequence always starts and ends with a (possibly empty) text run.
fn segments(body: &str) -> Vec<Segment<'_>> {
    let mut out = Vec::new();
    let mut rest = body;
    loop {
        let split = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let (text, tail) = rest.split_at(split);
        out.push(Segment::Text(text));
        if tail.is_empty() {
            break;
        }
        let split = tail.find(|c: char| !c.is_ascii_digit()).unwrap_or(tail.len());
        let (digits, tail) = tail.split_at(split);
        out.push(Segment::Number(digits.trim_start_matches('0')));
        rest = tail;
    }
    out
}

fn compare_body(a: &str, b: &str) -> Ordering {
    let sa = segments(a);
    let sb = segments(b);
    for (x, y) in sa.iter().zip(sb.iter()) {
        let ord = match (x, y) {
            (Segment::Text(x), Segment::Text(y)) => compare_text(x, y),
            (Segment::Number(x), Segment::Number(y)) => compare_number(x, y),
            // Runs alternate identically on both sides
            _ => unreachable!("version segments out of step"),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    sa.len().cmp(&sb.len())
}

/// Weight of a character within a non-digit run; `None` is the end of run
fn text_weight(c: Option<u8>) -> u16 {
    match c {
        Some(b'~') => 0,
        None => 1,
        Some(c) => u16::from(c) + 2,
    }
}

fn compare_text(a: &str, b: &str) -> Ordering {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    for i in 0..=a.len().max(b.len()) {
        let ord = text_weight(a.get(i).copied()).cmp(&text_weight(b.get(i).copied()));
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Compare digit strings that have no leading zeros
fn compare_number(a: &str, b: &str) -> Ordering {
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

fn push_body(key: &mut String, body: &str) {
    for segment in segments(body) {
        match segment {
            Segment::Text(text) => {
                for c in text.chars() {
                    key.push(if c == '~' { '#' } else { c });
                }
                key.push('%');
            }
            Segment::Number(digits) => push_number(key, digits),
        }
    }
}

/// Length-prefixed digits; `digits` carries no leading zeros
fn push_number(key: &mut String, digits: &str) {
    let digits = if digits.is_empty() { "0" } else { digits };
    push_length(key, digits.len());
    key.push_str(digits);
}

fn push_length(key: &mut String, len: usize) {
    if len <= 25 {
        key.push(char::from(b'a' + (len - 1) as u8));
    } else {
        key.push('z');
        push_number(key, &len.to_string());
    }
}
