//! Layered configuration for debris.
//!
//! Every setting is a named [`ConfigKey`] resolved from, in order of
//! precedence:
//! 1. the environment variable of the same name (`DEBRIS_*`)
//! 2. the dotted path in `debris.toml`
//! 3. a built-in default
//!
//! # Configuration File Format
//!
//! ```toml
//! [history]
//! db_file = "/var/cache/debris/history.db"
//!
//! [run]
//! lock_file = "/var/cache/debris/debris.lock"
//! work_dir = "/var/cache/debris/work"
//!
//! [repo]
//! url = "https://github.com/debiancn/repo"
//! local = "/srv/debris/repo"
//! aux_branch = "pristine-tar"
//! pull = true
//!
//! [sbuild]
//! arches = ["amd64", "i386"]
//! suites = ["stretch"]
//! chroot_suffix = "sbuild"
//! output_dir = "/srv/debris/output"
//! build_timeout_secs = 14400
//!
//! [packages.hello]
//! arches = ["amd64"]
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

/// Name of the configuration file looked up in the default locations.
pub const CONFIG_FILE_NAME: &str = "debris.toml";

/// Every recognised setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigKey {
    DbFile,
    LockFile,
    WorkDir,
    RepoUrl,
    RepoLocal,
    AuxBranch,
    Pull,
    ChrootArch,
    ChrootSuite,
    ChrootSuffix,
    OutputDir,
    BuildTimeout,
}

impl ConfigKey {
    pub const ALL: [ConfigKey; 12] = [
        ConfigKey::DbFile,
        ConfigKey::LockFile,
        ConfigKey::WorkDir,
        ConfigKey::RepoUrl,
        ConfigKey::RepoLocal,
        ConfigKey::AuxBranch,
        ConfigKey::Pull,
        ConfigKey::ChrootArch,
        ConfigKey::ChrootSuite,
        ConfigKey::ChrootSuffix,
        ConfigKey::OutputDir,
        ConfigKey::BuildTimeout,
    ];

    /// Environment variable name, also the canonical key name.
    pub fn env_name(self) -> &'static str {
        match self {
            ConfigKey::DbFile => "DEBRIS_DB_FILE",
            ConfigKey::LockFile => "DEBRIS_LOCK_FILE",
            ConfigKey::WorkDir => "DEBRIS_WORK_DIR",
            ConfigKey::RepoUrl => "DEBRIS_GIT_REPO_URL",
            ConfigKey::RepoLocal => "DEBRIS_GIT_REPO_LOCAL",
            ConfigKey::AuxBranch => "DEBRIS_GIT_AUX_BRANCH",
            ConfigKey::Pull => "DEBRIS_GIT_PULL",
            ConfigKey::ChrootArch => "DEBRIS_SBUILD_CHROOT_ARCH",
            ConfigKey::ChrootSuite => "DEBRIS_SBUILD_CHROOT_SUITE",
            ConfigKey::ChrootSuffix => "DEBRIS_SBUILD_CHROOT_SUFFIX",
            ConfigKey::OutputDir => "DEBRIS_SBUILD_OUTPUTDIR",
            ConfigKey::BuildTimeout => "DEBRIS_SBUILD_BUILD_TIMEOUT",
        }
    }

    /// Dotted path inside `debris.toml`.
    pub fn toml_path(self) -> &'static str {
        match self {
            ConfigKey::DbFile => "history.db_file",
            ConfigKey::LockFile => "run.lock_file",
            ConfigKey::WorkDir => "run.work_dir",
            ConfigKey::RepoUrl => "repo.url",
            ConfigKey::RepoLocal => "repo.local",
            ConfigKey::AuxBranch => "repo.aux_branch",
            ConfigKey::Pull => "repo.pull",
            ConfigKey::ChrootArch => "sbuild.arches",
            ConfigKey::ChrootSuite => "sbuild.suites",
            ConfigKey::ChrootSuffix => "sbuild.chroot_suffix",
            ConfigKey::OutputDir => "sbuild.output_dir",
            ConfigKey::BuildTimeout => "sbuild.build_timeout_secs",
        }
    }

    pub fn builtin_default(self) -> Option<&'static str> {
        match self {
            ConfigKey::DbFile => Some("/var/cache/debris/history.db"),
            ConfigKey::LockFile => Some("/var/cache/debris/debris.lock"),
            ConfigKey::RepoUrl => Some("https://github.com/debiancn/repo"),
            ConfigKey::AuxBranch => Some("pristine-tar"),
            ConfigKey::Pull => Some("true"),
            ConfigKey::ChrootArch => Some("amd64"),
            ConfigKey::ChrootSuite => Some("stretch"),
            ConfigKey::ChrootSuffix => Some("sbuild"),
            ConfigKey::BuildTimeout => Some("14400"),
            ConfigKey::WorkDir | ConfigKey::RepoLocal | ConfigKey::OutputDir => None,
        }
    }

    pub fn is_list(self) -> bool {
        matches!(self, ConfigKey::ChrootArch | ConfigKey::ChrootSuite)
    }

    /// Look up a key by its canonical (environment variable) name.
    pub fn from_name(name: &str) -> Result<Self, ConfigError> {
        Self::ALL
            .into_iter()
            .find(|k| k.env_name() == name)
            .ok_or_else(|| ConfigError::KeyNotRecognized {
                key: name.to_string(),
            })
    }
}

impl std::fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.env_name())
    }
}

/// Where a resolved value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueSource {
    Env,
    File,
    Default,
}

impl std::fmt::Display for ValueSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValueSource::Env => write!(f, "env"),
            ValueSource::File => write!(f, "file"),
            ValueSource::Default => write!(f, "default"),
        }
    }
}

/// A resolved value. List keys always resolve to `List`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigValue {
    Scalar(String),
    List(Vec<String>),
}

impl std::fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigValue::Scalar(s) => f.write_str(s),
            ConfigValue::List(items) => write!(f, "{}", items.join(",")),
        }
    }
}

/// Per-package restriction of build targets (`[packages.<name>]`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageTargets {
    #[serde(default)]
    pub arches: Option<Vec<String>>,
    #[serde(default)]
    pub suites: Option<Vec<String>>,
}

impl PackageTargets {
    pub fn allows(&self, arch: &str, suite: &str) -> bool {
        let arch_ok = self
            .arches
            .as_ref()
            .is_none_or(|a| a.iter().any(|x| x == arch));
        let suite_ok = self
            .suites
            .as_ref()
            .is_none_or(|s| s.iter().any(|x| x == suite));
        arch_ok && suite_ok
    }
}

/// Raw layered sources, before typed extraction.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    file: toml::Table,
    file_path: Option<PathBuf>,
    env: HashMap<String, String>,
}

impl Settings {
    /// Build settings from an already-parsed file table and an environment map.
    pub fn from_parts(file: toml::Table, env: HashMap<String, String>) -> Self {
        Self {
            file,
            file_path: None,
            env,
        }
    }

    /// Load from the given file (or the default locations) and the process
    /// environment.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let env: HashMap<String, String> = std::env::vars()
            .filter(|(k, _)| k.starts_with("DEBRIS_"))
            .collect();

        let path = match explicit {
            Some(p) => Some(p.to_path_buf()),
            None => env
                .get("DEBRIS_CONFIG")
                .map(PathBuf::from)
                .or_else(default_config_path),
        };

        let file = match &path {
            Some(p) => parse_file(p)?,
            None => toml::Table::new(),
        };

        Ok(Self {
            file,
            file_path: path,
            env,
        })
    }

    pub fn file_path(&self) -> Option<&Path> {
        self.file_path.as_deref()
    }

    /// Resolve a key through env → file → default.
    pub fn resolve(&self, key: ConfigKey) -> Result<(ConfigValue, ValueSource), ConfigError> {
        self.resolve_optional(key)?
            .ok_or_else(|| ConfigError::KeyNotRecognized {
                key: key.env_name().to_string(),
            })
    }

    /// Like [`resolve`](Self::resolve), but a key with no value anywhere is `None`.
    pub fn resolve_optional(
        &self,
        key: ConfigKey,
    ) -> Result<Option<(ConfigValue, ValueSource)>, ConfigError> {
        if let Some(raw) = self.env.get(key.env_name()) {
            return Ok(Some((from_text(key, raw), ValueSource::Env)));
        }
        if let Some(value) = lookup_path(&self.file, key.toml_path()) {
            return Ok(Some((from_toml(key, value)?, ValueSource::File)));
        }
        Ok(key
            .builtin_default()
            .map(|raw| (from_text(key, raw), ValueSource::Default)))
    }

    /// Resolve a setting by its canonical name, e.g. `DEBRIS_DB_FILE`.
    pub fn lookup(&self, name: &str) -> Result<ConfigValue, ConfigError> {
        let key = ConfigKey::from_name(name)?;
        self.resolve(key).map(|(value, _)| value)
    }

    pub fn get(&self, key: ConfigKey) -> Result<String, ConfigError> {
        match self.resolve(key)?.0 {
            ConfigValue::Scalar(s) => Ok(s),
            ConfigValue::List(items) => Ok(items.join(",")),
        }
    }

    pub fn get_optional(&self, key: ConfigKey) -> Result<Option<String>, ConfigError> {
        Ok(self.resolve_optional(key)?.map(|(value, _)| value.to_string()))
    }

    pub fn get_list(&self, key: ConfigKey) -> Result<Vec<String>, ConfigError> {
        match self.resolve(key)?.0 {
            ConfigValue::List(items) => Ok(items),
            ConfigValue::Scalar(s) => Ok(vec![s]),
        }
    }

    pub fn get_bool(&self, key: ConfigKey) -> Result<bool, ConfigError> {
        let raw = self.get(key)?;
        match raw.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                key: key.env_name().to_string(),
                message: format!("'{}' is not a boolean", raw),
            }),
        }
    }

    pub fn get_u64(&self, key: ConfigKey) -> Result<u64, ConfigError> {
        let raw = self.get(key)?;
        raw.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.env_name().to_string(),
            message: format!("'{}' is not a non-negative integer", raw),
        })
    }

    /// `[packages.<name>]` tables from the config file.
    pub fn package_targets(&self) -> Result<BTreeMap<String, PackageTargets>, ConfigError> {
        match self.file.get("packages") {
            Some(value) => value
                .clone()
                .try_into()
                .map_err(|e: toml::de::Error| ConfigError::InvalidValue {
                    key: "packages".to_string(),
                    message: e.to_string(),
                }),
            None => Ok(BTreeMap::new()),
        }
    }
}

fn default_config_path() -> Option<PathBuf> {
    let user = dirs::config_dir().map(|d| d.join("debris").join(CONFIG_FILE_NAME));
    let system = PathBuf::from("/etc/debris").join(CONFIG_FILE_NAME);
    user.into_iter().chain(Some(system)).find(|p| p.exists())
}

fn parse_file(path: &Path) -> Result<toml::Table, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFailed {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::ParseFailed {
        path: path.to_path_buf(),
        source,
    })
}

fn lookup_path<'a>(table: &'a toml::Table, dotted: &str) -> Option<&'a toml::Value> {
    let mut parts = dotted.split('.');
    let first = parts.next()?;
    let mut current = table.get(first)?;
    for part in parts {
        current = current.as_table()?.get(part)?;
    }
    Some(current)
}

fn from_text(key: ConfigKey, raw: &str) -> ConfigValue {
    if key.is_list() {
        ConfigValue::List(
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        )
    } else {
        ConfigValue::Scalar(raw.to_string())
    }
}

fn from_toml(key: ConfigKey, value: &toml::Value) -> Result<ConfigValue, ConfigError> {
    let scalar = |v: &toml::Value| -> Result<String, ConfigError> {
        match v {
            toml::Value::String(s) => Ok(s.clone()),
            toml::Value::Integer(i) => Ok(i.to_string()),
            toml::Value::Boolean(b) => Ok(b.to_string()),
            toml::Value::Float(f) => Ok(f.to_string()),
            other => Err(ConfigError::InvalidValue {
                key: key.env_name().to_string(),
                message: format!("unsupported {} value", other.type_str()),
            }),
        }
    };

    match value {
        toml::Value::Array(items) if key.is_list() => Ok(ConfigValue::List(
            items.iter().map(scalar).collect::<Result<_, _>>()?,
        )),
        toml::Value::String(s) if key.is_list() => Ok(from_text(key, s)),
        other if key.is_list() => Ok(ConfigValue::List(vec![scalar(other)?])),
        other => Ok(ConfigValue::Scalar(scalar(other)?)),
    }
}

/// Git-related settings.
#[derive(Debug, Clone)]
pub struct RepoConfig {
    pub url: String,
    pub local: PathBuf,
    pub aux_branch: String,
    pub pull: bool,
}

/// sbuild-related settings.
#[derive(Debug, Clone)]
pub struct SbuildConfig {
    pub arches: Vec<String>,
    pub suites: Vec<String>,
    pub chroot_suffix: String,
    pub output_dir: Option<PathBuf>,
    pub build_timeout: Duration,
}

/// Typed configuration passed to every component at construction.
#[derive(Debug, Clone)]
pub struct DebrisConfig {
    pub db_file: PathBuf,
    pub lock_file: PathBuf,
    pub work_dir: Option<PathBuf>,
    pub repo: RepoConfig,
    pub sbuild: SbuildConfig,
    pub packages: BTreeMap<String, PackageTargets>,
}

impl DebrisConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self, ConfigError> {
        let arches = settings.get_list(ConfigKey::ChrootArch)?;
        let suites = settings.get_list(ConfigKey::ChrootSuite)?;
        if arches.is_empty() || suites.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: if arches.is_empty() {
                    ConfigKey::ChrootArch.env_name().to_string()
                } else {
                    ConfigKey::ChrootSuite.env_name().to_string()
                },
                message: "at least one value is required".to_string(),
            });
        }

        Ok(Self {
            db_file: PathBuf::from(settings.get(ConfigKey::DbFile)?),
            lock_file: PathBuf::from(settings.get(ConfigKey::LockFile)?),
            work_dir: settings.get_optional(ConfigKey::WorkDir)?.map(PathBuf::from),
            repo: RepoConfig {
                url: settings.get(ConfigKey::RepoUrl)?,
                local: PathBuf::from(settings.get(ConfigKey::RepoLocal)?),
                aux_branch: settings.get(ConfigKey::AuxBranch)?,
                pull: settings.get_bool(ConfigKey::Pull)?,
            },
            sbuild: SbuildConfig {
                arches,
                suites,
                chroot_suffix: settings.get(ConfigKey::ChrootSuffix)?,
                output_dir: settings.get_optional(ConfigKey::OutputDir)?.map(PathBuf::from),
                build_timeout: Duration::from_secs(settings.get_u64(ConfigKey::BuildTimeout)?),
            },
            packages: settings.package_targets()?,
        })
    }

    /// The sbuild output directory; builds cannot run without one.
    pub fn require_output_dir(&self) -> Result<&Path, ConfigError> {
        self.sbuild
            .output_dir
            .as_deref()
            .ok_or_else(|| ConfigError::KeyNotRecognized {
                key: ConfigKey::OutputDir.env_name().to_string(),
            })
    }

    /// Whether `package` should be built on the given arch/suite.
    pub fn package_allows(&self, package: &str, arch: &str, suite: &str) -> bool {
        self.packages
            .get(package)
            .is_none_or(|targets| targets.allows(arch, suite))
    }
}
