//! Reading package identity from `debian/changelog`.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::VersionString;
use crate::errors::MetadataError;

/// A source package as described by its newest changelog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    pub name: String,
    pub version: VersionString,
    /// Target distributions of the newest entry (e.g. `unstable`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub distributions: Vec<String>,
}

// Compile the entry header regex once
static HEADER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([a-z0-9][a-z0-9+.\-]+)\s+\(([^()\s]+)\)((?:\s+[A-Za-z0-9+.\-/]+)+)\s*;").unwrap()
});

/// Parse the first entry header of a changelog.
///
/// Leading blank lines are skipped.
pub fn parse_changelog(content: &str, path: &Path) -> Result<Package, MetadataError> {
    let malformed = |reason: String| MetadataError::Malformed {
        path: path.to_path_buf(),
        reason,
    };

    let header = content
        .lines()
        .map(str::trim_end)
        .find(|line| !line.trim().is_empty())
        .ok_or_else(|| malformed("changelog is empty".to_string()))?;

    let caps = HEADER_REGEX
        .captures(header)
        .ok_or_else(|| malformed(format!("unrecognised entry header: {}", header)))?;

    let version = VersionString::parse(&caps[2]).map_err(|e| malformed(e.to_string()))?;
    let distributions = caps[3].split_whitespace().map(str::to_string).collect();

    Ok(Package {
        name: caps[1].to_string(),
        version,
        distributions,
    })
}

/// Read `debian/changelog` below a package checkout.
pub fn read_package(checkout: &Path) -> Result<Package, MetadataError> {
    let path = checkout.join("debian").join("changelog");
    let content = std::fs::read_to_string(&path).map_err(|e| MetadataError::Malformed {
        path: path.clone(),
        reason: format!("cannot read changelog: {}", e),
    })?;
    parse_changelog(&content, &path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    const SAMPLE: &str = "\
hello (2.10-3) unstable; urgency=medium

  * New upload.

 -- Jane Doe <jane@example.org>  Mon, 01 Jan 2024 00:00:00 +0000

hello (2.10-2) unstable; urgency=low

  * Older upload.

 -- Jane Doe <jane@example.org>  Sun, 01 Jan 2023 00:00:00 +0000
";

    #[test]
    fn test_parse_newest_entry() {
        let pkg = parse_changelog(SAMPLE, Path::new("debian/changelog")).unwrap();
        assert_eq!(pkg.name, "hello");
        assert_eq!(pkg.version.as_str(), "2.10-3");
        assert_eq!(pkg.distributions, vec!["unstable".to_string()]);
    }

    #[test]
    fn test_parse_epoch_and_multiple_distributions() {
        let content = "libfoo++ (1:0.9~beta1) experimental stretch-backports; urgency=high\n";
        let pkg = parse_changelog(content, Path::new("c")).unwrap();
        assert_eq!(pkg.name, "libfoo++");
        assert_eq!(pkg.version.epoch(), 1);
        assert!(pkg.version.is_native());
        assert_eq!(pkg.distributions.len(), 2);
    }

    #[test]
    fn test_parse_rejects_garbage_header() {
        let err = parse_changelog("this is not a changelog\n", Path::new("c")).unwrap_err();
        assert!(matches!(err, MetadataError::Malformed { .. }));
    }

    #[test]
    fn test_parse_rejects_policy_invalid_names() {
        for header in [
            "a (1.0) unstable; urgency=medium\n",
            "pkgA (1.0) unstable; urgency=medium\n",
            "-foo (1.0) unstable; urgency=medium\n",
        ] {
            let err = parse_changelog(header, Path::new("c")).unwrap_err();
            assert!(
                matches!(err, MetadataError::Malformed { .. }),
                "accepted {:?}",
                header
            );
        }
        assert!(parse_changelog("aa (1.0) unstable; urgency=medium\n", Path::new("c")).is_ok());
    }

    #[test]
    fn test_parse_rejects_bad_version() {
        let err = parse_changelog("foo (abc-1) unstable; urgency=low\n", Path::new("c"));
        assert!(err.is_err());
    }

    #[test]
    fn test_parse_rejects_empty() {
        assert!(parse_changelog("\n\n", Path::new("c")).is_err());
    }

    #[test]
    fn test_read_package_from_checkout() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("debian")).unwrap();
        fs::write(dir.path().join("debian/changelog"), SAMPLE).unwrap();
        let pkg = read_package(dir.path()).unwrap();
        assert_eq!(pkg.name, "hello");
    }

    #[test]
    fn test_read_package_missing_changelog() {
        let dir = tempdir().unwrap();
        let err = read_package(dir.path()).unwrap_err();
        match err {
            MetadataError::Malformed { path, .. } => assert!(path.ends_with("debian/changelog")),
            other => panic!("Expected Malformed, got {:?}", other),
        }
    }
}
