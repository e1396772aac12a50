//! Integration tests for the debris CLI
//!
//! These run the real binary against throwaway config files and databases.
//! Nothing here invokes git, sbuild or the network.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Helper to create a debris Command isolated from the caller's environment
fn debris(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("debris");
    cmd.current_dir(dir.path()).env("HOME", dir.path());
    for (key, _) in std::env::vars() {
        if key.starts_with("DEBRIS_") {
            cmd.env_remove(key);
        }
    }
    cmd
}

/// Helper to write a debris.toml pointing all state into `dir`
fn write_config(dir: &TempDir, extra: &str) -> PathBuf {
    let path = dir.path().join("debris.toml");
    let content = format!(
        r#"
[history]
db_file = "{db}"

[run]
lock_file = "{lock}"

[sbuild]
arches = ["amd64", "i386"]
suites = ["stretch"]
{extra}
"#,
        db = dir.path().join("state/history.db").display(),
        lock = dir.path().join("state/debris.lock").display(),
        extra = extra,
    );
    fs::write(&path, content).unwrap();
    path
}

fn arg(path: &Path) -> &str {
    path.to_str().unwrap()
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_debris_help() {
        let dir = TempDir::new().unwrap();
        debris(&dir)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("run"))
            .stdout(predicate::str::contains("history"));
    }

    #[test]
    fn test_debris_version() {
        let dir = TempDir::new().unwrap();
        debris(&dir).arg("--version").assert().success();
    }

    #[test]
    fn test_unknown_subcommand_fails() {
        let dir = TempDir::new().unwrap();
        debris(&dir).arg("frobnicate").assert().failure();
    }
}

// =============================================================================
// Tag Tests
// =============================================================================

mod tag {
    use super::*;

    #[test]
    fn test_tag_strips_revision_and_mangles_epoch() {
        let dir = TempDir::new().unwrap();
        debris(&dir)
            .args(["tag", "1:2.0-1"])
            .assert()
            .success()
            .stdout(predicate::str::contains("upstream tag: 1%2.0"))
            .stdout(predicate::str::contains("native:       no"));
    }

    #[test]
    fn test_tag_native_version() {
        let dir = TempDir::new().unwrap();
        debris(&dir)
            .args(["tag", "2.0~rc1"])
            .assert()
            .success()
            .stdout(predicate::str::contains("upstream tag: 2.0_rc1"))
            .stdout(predicate::str::contains("native:       yes"));
    }

    #[test]
    fn test_tag_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        debris(&dir)
            .args(["tag", "not a version"])
            .assert()
            .code(1)
            .stderr(predicate::str::contains("Invalid version"));
    }
}

// =============================================================================
// Config Tests
// =============================================================================

mod config {
    use super::*;

    #[test]
    fn test_config_show_reports_sources() {
        let dir = TempDir::new().unwrap();
        let config = write_config(&dir, "");
        debris(&dir)
            .args(["--config", arg(&config), "config", "show"])
            .env("DEBRIS_SBUILD_CHROOT_SUFFIX", "buildd")
            .assert()
            .success()
            .stdout(predicate::str::contains("DEBRIS_SBUILD_CHROOT_ARCH"))
            .stdout(predicate::str::contains("amd64,i386"))
            .stdout(predicate::str::contains("[file]"))
            .stdout(predicate::str::contains("buildd"))
            .stdout(predicate::str::contains("[env]"))
            .stdout(predicate::str::contains("[default]"));
    }

    #[test]
    fn test_config_get_known_key() {
        let dir = TempDir::new().unwrap();
        let config = write_config(&dir, "");
        debris(&dir)
            .args(["--config", arg(&config), "config", "get", "DEBRIS_SBUILD_CHROOT_SUITE"])
            .assert()
            .success()
            .stdout(predicate::str::contains("stretch"));
    }

    #[test]
    fn test_config_get_unknown_key() {
        let dir = TempDir::new().unwrap();
        let config = write_config(&dir, "");
        debris(&dir)
            .args(["--config", arg(&config), "config", "get", "DEBRIS_NOPE"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("DEBRIS_NOPE"));
    }

    #[test]
    fn test_config_bad_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "[sbuild\narches = ").unwrap();
        debris(&dir)
            .args(["--config", arg(&path), "config", "show"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Failed to parse config file"));
    }
}

// =============================================================================
// History Tests
// =============================================================================

mod history {
    use super::*;

    #[test]
    fn test_history_on_fresh_database() {
        let dir = TempDir::new().unwrap();
        let config = write_config(&dir, "");
        debris(&dir)
            .args(["--config", arg(&config), "history"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No build attempts recorded."));
        assert!(dir.path().join("state/history.db").exists());
    }

    #[test]
    fn test_history_json_lists_recorded_attempts() {
        use debris::history::{AttemptOutcome, BuildAttempt, FailureKind, HistoryDb};
        use debris::version::VersionString;

        let dir = TempDir::new().unwrap();
        let config = write_config(&dir, "");
        {
            let db = HistoryDb::open(&dir.path().join("state/history.db")).unwrap();
            db.record(&BuildAttempt {
                timestamp: chrono::Utc::now(),
                target: "stretch-amd64-sbuild".into(),
                package: "hello".into(),
                version: VersionString::parse("2.10-1").unwrap(),
                outcome: AttemptOutcome::Failure(FailureKind::Timeout),
                stdout: None,
                stderr: None,
            })
            .unwrap();
        }

        debris(&dir)
            .args(["--config", arg(&config), "history", "hello", "--json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"package\": \"hello\""))
            .stdout(predicate::str::contains("\"kind\": \"timeout\""));

        debris(&dir)
            .args(["--config", arg(&config), "history", "--built"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No packages built yet."));
    }
}

// =============================================================================
// Run Tests
// =============================================================================

mod run {
    use super::*;

    #[test]
    fn test_run_without_checkout_location_is_config_error() {
        let dir = TempDir::new().unwrap();
        let config = write_config(&dir, "output_dir = \"/srv/out\"");
        debris(&dir)
            .args(["--config", arg(&config), "run"])
            .assert()
            .code(1)
            .stderr(predicate::str::contains("DEBRIS_GIT_REPO_LOCAL"));
        assert!(!dir.path().join("state/debris.lock").exists());
    }

    #[test]
    fn test_run_without_output_dir_is_config_error() {
        let dir = TempDir::new().unwrap();
        let config = write_config(&dir, "");
        debris(&dir)
            .args(["--config", arg(&config), "run"])
            .env("DEBRIS_GIT_REPO_LOCAL", dir.path().join("repo"))
            .assert()
            .code(1)
            .stderr(predicate::str::contains("DEBRIS_SBUILD_OUTPUTDIR"));
    }

    #[test]
    fn test_run_while_locked_exits_with_contention_code() {
        use debris::lock::RunLock;

        let dir = TempDir::new().unwrap();
        let config = write_config(&dir, "output_dir = \"/srv/out\"");
        let _held = RunLock::acquire(&dir.path().join("state/debris.lock")).unwrap();

        debris(&dir)
            .args(["--config", arg(&config), "run", "--no-pull"])
            .env("DEBRIS_GIT_REPO_LOCAL", dir.path().join("repo"))
            .assert()
            .code(2)
            .stderr(predicate::str::contains("Another debris run"));
    }

    #[test]
    fn test_update_only_conflicts_with_skip_prepare() {
        let dir = TempDir::new().unwrap();
        debris(&dir)
            .args(["run", "--update-only", "--skip-prepare"])
            .assert()
            .failure();
    }
}
