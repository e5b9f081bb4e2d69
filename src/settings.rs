use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

const SETTINGS_FILE_NAMES: [&str; 3] = [".benchbuild.yml", ".benchbuild.yaml", ".benchbuild.toml"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerSettings {
    pub root: PathBuf,
    pub runroot: PathBuf,
    pub storage_driver: String,
    pub buildah: String,
    pub podman: String,
    pub keep: bool,
    pub keep_suffix: String,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            root: PathBuf::from("containers/lib"),
            runroot: PathBuf::from("containers/run"),
            storage_driver: String::from("vfs"),
            buildah: String::from("buildah"),
            podman: String::from("podman"),
            keep: false,
            keep_suffix: String::from("failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DbSettings {
    pub path: PathBuf,
}

impl Default for DbSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("var/benchbuild.db"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub build_dir: PathBuf,
    pub tmp_dir: PathBuf,
    pub container: ContainerSettings,
    pub db: DbSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            build_dir: PathBuf::from("results"),
            tmp_dir: std::env::temp_dir(),
            container: ContainerSettings::default(),
            db: DbSettings::default(),
        }
    }
}

impl Settings {
    /// Dotted lookup over the resolved tree, e.g. `value("container.root")`.
    pub fn value(&self, dotted_key: &str) -> Option<Value> {
        let tree = serde_json::to_value(self).ok()?;
        dotted_key
            .split('.')
            .filter(|segment| !segment.is_empty())
            .try_fold(tree, |node, segment| node.get(segment).cloned())
    }

    /// Resolves relative paths against `base`.
    pub fn anchored_at(mut self, base: &Path) -> Self {
        for path in [
            &mut self.build_dir,
            &mut self.tmp_dir,
            &mut self.container.root,
            &mut self.container.runroot,
            &mut self.db.path,
        ] {
            if path.is_relative() {
                *path = base.join(path.as_path());
            }
        }
        self
    }
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings '{path}': {message}")]
    ReadFile { path: String, message: String },
    #[error("failed to parse settings YAML '{path}': {message}")]
    ParseYaml { path: String, message: String },
    #[error("failed to parse settings TOML '{path}': {message}")]
    ParseToml { path: String, message: String },
    #[error("failed to parse settings JSON '{path}': {message}")]
    ParseJson { path: String, message: String },
    #[error("settings field '{field}' has invalid value '{value}'")]
    InvalidOverride { field: String, value: String },
}

/// Loads settings from `explicit_path`, or from the nearest settings file
/// above `cwd`, then applies `BB_*` environment overrides.
pub fn load_settings(explicit_path: Option<&Path>, cwd: &Path) -> Result<Settings, SettingsError> {
    let located = explicit_path
        .map(|p| {
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                cwd.join(p)
            }
        })
        .or_else(|| find_settings_file(cwd));

    let settings = match located {
        Some(path) => {
            let base = path.parent().unwrap_or(cwd).to_path_buf();
            load_settings_file(path.as_path())?.anchored_at(base.as_path())
        }
        None => Settings::default().anchored_at(cwd),
    };
    apply_env_overrides(settings, |key| std::env::var(key).ok())
}

pub fn find_settings_file(start: &Path) -> Option<PathBuf> {
    start.ancestors().find_map(|dir| {
        SETTINGS_FILE_NAMES
            .iter()
            .map(|name| dir.join(name))
            .find(|candidate| candidate.is_file())
    })
}

pub fn load_settings_file(path: &Path) -> Result<Settings, SettingsError> {
    let raw = fs::read_to_string(path).map_err(|error| SettingsError::ReadFile {
        path: path.display().to_string(),
        message: error.to_string(),
    })?;
    let tree = match path
        .extension()
        .and_then(|v| v.to_str())
        .map(|v| v.to_ascii_lowercase())
    {
        Some(ext) if ext == "toml" => parse_toml(path, raw.as_str())?,
        Some(ext) if ext == "json" => {
            serde_json::from_str::<Value>(raw.as_str()).map_err(|error| {
                SettingsError::ParseJson {
                    path: path.display().to_string(),
                    message: error.to_string(),
                }
            })?
        }
        _ => parse_yaml(path, raw.as_str())?,
    };
    if tree.is_null() {
        return Ok(Settings::default());
    }
    serde_json::from_value(tree).map_err(|error| SettingsError::ParseJson {
        path: path.display().to_string(),
        message: error.to_string(),
    })
}

fn parse_yaml(path: &Path, raw: &str) -> Result<Value, SettingsError> {
    serde_yaml::from_str::<Value>(raw).map_err(|error| SettingsError::ParseYaml {
        path: path.display().to_string(),
        message: error.to_string(),
    })
}

fn parse_toml(path: &Path, raw: &str) -> Result<Value, SettingsError> {
    let parsed = toml::from_str::<toml::Value>(raw).map_err(|error| SettingsError::ParseToml {
        path: path.display().to_string(),
        message: error.to_string(),
    })?;
    serde_json::to_value(parsed).map_err(|error| SettingsError::ParseToml {
        path: path.display().to_string(),
        message: error.to_string(),
    })
}

pub fn apply_env_overrides<F>(mut settings: Settings, lookup: F) -> Result<Settings, SettingsError>
where
    F: Fn(&str) -> Option<String>,
{
    let read = |key: &str| {
        lookup(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };

    if let Some(v) = read("BB_CONTAINER_ROOT") {
        settings.container.root = PathBuf::from(v);
    }
    if let Some(v) = read("BB_CONTAINER_RUNROOT") {
        settings.container.runroot = PathBuf::from(v);
    }
    if let Some(v) = read("BB_CONTAINER_STORAGE_DRIVER") {
        settings.container.storage_driver = v;
    }
    if let Some(v) = read("BB_CONTAINER_KEEP") {
        settings.container.keep = parse_flag("BB_CONTAINER_KEEP", v.as_str())?;
    }
    if let Some(v) = read("BB_CONTAINER_KEEP_SUFFIX") {
        settings.container.keep_suffix = v;
    }
    if let Some(v) = read("BB_BUILD_DIR") {
        settings.build_dir = PathBuf::from(v);
    }
    if let Some(v) = read("BB_TMP_DIR") {
        settings.tmp_dir = PathBuf::from(v);
    }
    if let Some(v) = read("BB_DB_PATH") {
        settings.db.path = PathBuf::from(v);
    }
    Ok(settings)
}

fn parse_flag(field: &str, value: &str) -> Result<bool, SettingsError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(SettingsError::InvalidOverride {
            field: field.to_string(),
            value: value.to_string(),
        }),
    }
}
