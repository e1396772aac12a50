//! Debian version strings: parsing, policy ordering and DEP-14 tag mangling.
//!
//! A version has the shape `[epoch:]upstream[-revision]`. The revision is
//! everything after the last hyphen; a version without one is *native*.

pub mod changelog;

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::MetadataError;

pub use changelog::{Package, read_package};

/// An owned, parsed Debian version.
///
/// Equality and ordering follow Debian policy, so `1.0` and `0:1.0-0` compare
/// equal even though their textual forms differ. The original text is kept
/// for display and storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VersionString {
    raw: String,
    epoch: u64,
    upstream: String,
    revision: Option<String>,
}

impl VersionString {
    pub fn parse(s: &str) -> Result<Self, MetadataError> {
        let invalid = |reason: &str| MetadataError::InvalidVersion {
            version: s.to_string(),
            reason: reason.to_string(),
        };

        let raw = s.trim();
        if raw.is_empty() {
            return Err(invalid("empty version"));
        }
        if raw.chars().any(char::is_whitespace) {
            return Err(invalid("embedded whitespace"));
        }

        let (epoch, rest) = match raw.split_once(':') {
            Some((epoch, rest)) => {
                if epoch.is_empty() || !epoch.chars().all(|c| c.is_ascii_digit()) {
                    return Err(invalid("epoch is not a number"));
                }
                let epoch = epoch.parse::<u64>().map_err(|_| invalid("epoch too large"))?;
                (epoch, rest)
            }
            None => (0, raw),
        };

        let (upstream, revision) = match rest.rsplit_once('-') {
            Some((upstream, revision)) => {
                if revision.is_empty() {
                    return Err(invalid("empty revision"));
                }
                if !revision
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '.' | '~'))
                {
                    return Err(invalid("illegal character in revision"));
                }
                (upstream, Some(revision.to_string()))
            }
            None => (rest, None),
        };

        if upstream.is_empty() {
            return Err(invalid("empty upstream version"));
        }
        if !upstream.starts_with(|c: char| c.is_ascii_digit()) {
            return Err(invalid("upstream version must start with a digit"));
        }
        if !upstream
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '+' | '-' | '~' | ':'))
        {
            return Err(invalid("illegal character in upstream version"));
        }

        Ok(Self {
            raw: raw.to_string(),
            epoch,
            upstream: upstream.to_string(),
            revision,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn upstream(&self) -> &str {
        &self.upstream
    }

    pub fn revision(&self) -> Option<&str> {
        self.revision.as_deref()
    }

    /// True when the version carries no distribution revision.
    pub fn is_native(&self) -> bool {
        self.revision.is_none()
    }

    /// Derive the VCS tag name for the upstream part of this version.
    ///
    /// Native versions use the whole string; otherwise the trailing
    /// `-revision` is dropped. The result is then DEP-14 mangled.
    pub fn upstream_tag(&self) -> String {
        let base = match self.raw.rsplit_once('-') {
            Some((upstream, _)) if !self.is_native() => upstream,
            _ => self.raw.as_str(),
        };
        mangle_tag(base)
    }
}

/// Apply DEP-14 mangling so the string is a valid git ref component.
///
/// `:` becomes `%`, `~` becomes `_`, and a `#` is inserted after any `.` that
/// is followed by another `.`, ends the string, or starts a `lock` suffix.
pub fn mangle_tag(version: &str) -> String {
    let mut out = String::with_capacity(version.len() + 4);
    for (i, c) in version.char_indices() {
        match c {
            ':' => out.push('%'),
            '~' => out.push('_'),
            '.' => {
                out.push('.');
                let rest = &version[i + 1..];
                if rest.is_empty() || rest.starts_with('.') || rest == "lock" {
                    out.push('#');
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// Compare two versions by Debian policy.
pub fn compare(a: &VersionString, b: &VersionString) -> Ordering {
    a.epoch
        .cmp(&b.epoch)
        .then_with(|| compare_fragment(&a.upstream, &b.upstream))
        .then_with(|| {
            compare_fragment(
                a.revision.as_deref().unwrap_or(""),
                b.revision.as_deref().unwrap_or(""),
            )
        })
}

/// Sort weight of a character inside a non-digit run.
fn char_order(c: Option<u8>) -> i32 {
    match c {
        None => 0,
        Some(c) if c.is_ascii_digit() => 0,
        Some(c) if c.is_ascii_alphabetic() => i32::from(c),
        Some(b'~') => -1,
        Some(c) => i32::from(c) + 256,
    }
}

/// dpkg's `verrevcmp`: alternate non-digit and digit runs.
fn compare_fragment(a: &str, b: &str) -> Ordering {
    let a = a.as_bytes();
    let b = b.as_bytes();
    let (mut i, mut j) = (0, 0);

    while i < a.len() || j < b.len() {
        while (i < a.len() && !a[i].is_ascii_digit()) || (j < b.len() && !b[j].is_ascii_digit()) {
            let ac = char_order(a.get(i).copied());
            let bc = char_order(b.get(j).copied());
            if ac != bc {
                return ac.cmp(&bc);
            }
            i += 1;
            j += 1;
        }

        while i < a.len() && a[i] == b'0' {
            i += 1;
        }
        while j < b.len() && b[j] == b'0' {
            j += 1;
        }

        let mut first_diff = Ordering::Equal;
        while i < a.len() && j < b.len() && a[i].is_ascii_digit() && b[j].is_ascii_digit() {
            if first_diff == Ordering::Equal {
                first_diff = a[i].cmp(&b[j]);
            }
            i += 1;
            j += 1;
        }
        if i < a.len() && a[i].is_ascii_digit() {
            return Ordering::Greater;
        }
        if j < b.len() && b[j].is_ascii_digit() {
            return Ordering::Less;
        }
        if first_diff != Ordering::Equal {
            return first_diff;
        }
    }

    Ordering::Equal
}

impl PartialEq for VersionString {
    fn eq(&self, other: &Self) -> bool {
        compare(self, other) == Ordering::Equal
    }
}

impl Eq for VersionString {}

impl PartialOrd for VersionString {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for VersionString {
    fn cmp(&self, other: &Self) -> Ordering {
        compare(self, other)
    }
}

impl fmt::Display for VersionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for VersionString {
    type Err = MetadataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for VersionString {
    type Error = MetadataError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<VersionString> for String {
    fn from(value: VersionString) -> Self {
        value.raw
    }
}
