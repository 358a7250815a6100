use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pagination::DEFAULT_PAGE_SIZE;
use crate::sql_generator::Dialect;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PasswordSource {
    #[default]
    EnvVar,
    Keyring,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionProfile {
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub dialect: Dialect,
    #[serde(default)]
    pub password_source: PasswordSource,
    #[serde(default)]
    pub keyring_service: Option<String>,
    #[serde(default)]
    pub keyring_account: Option<String>,
    #[serde(default)]
    pub read_only: bool,
}

fn default_port() -> u16 {
    3306
}

impl ConnectionProfile {
    #[must_use]
    pub fn new(name: impl Into<String>, host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port: default_port(),
            user: user.into(),
            database: None,
            dialect: Dialect::Mysql,
            password_source: PasswordSource::EnvVar,
            keyring_service: None,
            keyring_account: None,
            read_only: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineSettings {
    pub page_size: u64,
    pub filter_debounce_ms: u64,
    pub exact_count_when_filtered: bool,
    pub query_log: Option<PathBuf>,
}

impl EngineSettings {
    #[must_use]
    pub fn filter_debounce(&self) -> Duration {
        Duration::from_millis(self.filter_debounce_ms)
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            filter_debounce_ms: 500,
            exact_count_when_filtered: true,
            query_log: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("config directory is unavailable for this platform")]
    ConfigDirUnavailable,
    #[error("failed to read settings file at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse settings file at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to create config directory at {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize settings: {source}")]
    Serialize {
        #[source]
        source: toml::ser::Error,
    },
    #[error("failed to write settings file at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SettingsDocument {
    #[serde(default)]
    engine: EngineSettings,
    #[serde(default)]
    profiles: Vec<ConnectionProfile>,
}

impl SettingsDocument {
    fn normalize(&mut self) {
        let mut by_name = std::collections::BTreeMap::new();
        for profile in self.profiles.drain(..) {
            by_name.insert(profile.name.clone(), profile);
        }
        self.profiles = by_name.into_values().collect();
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    path: PathBuf,
    engine: EngineSettings,
    profiles: Vec<ConnectionProfile>,
}

impl Settings {
    pub fn load_default() -> Result<Self, SettingsError> {
        Self::load_from_path(default_settings_path()?)
    }

    pub fn load_from_path(path: impl Into<PathBuf>) -> Result<Self, SettingsError> {
        let path = path.into();
        if !path.exists() {
            return Ok(Self::empty(path));
        }

        let raw = fs::read_to_string(&path).map_err(|source| SettingsError::Read {
            path: path.clone(),
            source,
        })?;
        if raw.trim().is_empty() {
            return Ok(Self::empty(path));
        }

        let mut doc: SettingsDocument =
            toml::from_str(&raw).map_err(|source| SettingsError::Parse {
                path: path.clone(),
                source,
            })?;
        doc.normalize();
        tracing::debug!(path = %path.display(), profiles = doc.profiles.len(), "loaded settings");

        Ok(Self {
            path,
            engine: doc.engine,
            profiles: doc.profiles,
        })
    }

    fn empty(path: PathBuf) -> Self {
        Self {
            path,
            engine: EngineSettings::default(),
            profiles: Vec::new(),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn engine(&self) -> &EngineSettings {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut EngineSettings {
        &mut self.engine
    }

    #[must_use]
    pub fn profiles(&self) -> &[ConnectionProfile] {
        &self.profiles
    }

    #[must_use]
    pub fn profile(&self, name: &str) -> Option<&ConnectionProfile> {
        self.profiles.iter().find(|profile| profile.name == name)
    }

    pub fn upsert_profile(&mut self, profile: ConnectionProfile) {
        if let Some(existing) = self
            .profiles
            .iter_mut()
            .find(|existing| existing.name == profile.name)
        {
            *existing = profile;
        } else {
            self.profiles.push(profile);
            self.profiles.sort_unstable_by(|a, b| a.name.cmp(&b.name));
        }
    }

    #[must_use]
    pub fn query_log_path(&self) -> PathBuf {
        if let Some(path) = &self.engine.query_log {
            return path.clone();
        }
        self.path
            .parent()
            .map_or_else(|| PathBuf::from("query-log.ndjson"), |dir| {
                dir.join("query-log.ndjson")
            })
    }

    pub fn persist(&self) -> Result<(), SettingsError> {
        if let Some(parent_dir) = self.path.parent() {
            fs::create_dir_all(parent_dir).map_err(|source| SettingsError::CreateDir {
                path: parent_dir.to_path_buf(),
                source,
            })?;
        }

        let doc = SettingsDocument {
            engine: self.engine.clone(),
            profiles: self.profiles.clone(),
        };
        let rendered =
            toml::to_string_pretty(&doc).map_err(|source| SettingsError::Serialize { source })?;

        fs::write(&self.path, rendered).map_err(|source| SettingsError::Write {
            path: self.path.clone(),
            source,
        })
    }
}

pub fn default_settings_path() -> Result<PathBuf, SettingsError> {
    let base_dir = if let Some(custom) = env::var_os("ROWDESK_CONFIG_DIR") {
        PathBuf::from(custom)
    } else if cfg!(target_os = "windows") {
        env::var_os("APPDATA")
            .map(PathBuf::from)
            .ok_or(SettingsError::ConfigDirUnavailable)?
    } else if let Some(xdg_config_home) = env::var_os("XDG_CONFIG_HOME") {
        PathBuf::from(xdg_config_home)
    } else {
        let home = env::var_os("HOME").ok_or(SettingsError::ConfigDirUnavailable)?;
        PathBuf::from(home).join(".config")
    };

    Ok(base_dir.join("rowdesk").join("settings.toml"))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use tempfile::TempDir;

    use super::{ConnectionProfile, PasswordSource, Settings, SettingsError};
    use crate::sql_generator::Dialect;

    fn temp_settings_path(temp_dir: &TempDir) -> PathBuf {
        temp_dir.path().join("settings.toml")
    }

    #[test]
    fn missing_settings_file_loads_defaults() {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let settings =
            Settings::load_from_path(temp_settings_path(&temp_dir)).expect("failed to load");

        assert!(settings.profiles().is_empty());
        assert_eq!(settings.engine().page_size, 200);
        assert_eq!(settings.engine().filter_debounce(), Duration::from_millis(500));
        assert!(settings.engine().exact_count_when_filtered);
        assert_eq!(
            settings.query_log_path(),
            temp_dir.path().join("query-log.ndjson")
        );
    }

    #[test]
    fn parses_engine_section_and_profiles() {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let path = temp_settings_path(&temp_dir);
        std::fs::write(
            &path,
            r#"
            [engine]
            page_size = 50
            query_log = "/var/log/rowdesk.ndjson"

            [[profiles]]
            name = "warehouse"
            host = "db.internal"
            port = 5432
            user = "analyst"
            dialect = "postgres"
            password_source = "keyring"
            read_only = true

            [[profiles]]
            name = "local"
            host = "127.0.0.1"
            user = "root"
            "#,
        )
        .expect("failed to write settings");

        let settings = Settings::load_from_path(&path).expect("failed to load");
        assert_eq!(settings.engine().page_size, 50);
        assert_eq!(settings.engine().filter_debounce_ms, 500);
        assert_eq!(
            settings.query_log_path(),
            PathBuf::from("/var/log/rowdesk.ndjson")
        );

        let names = settings
            .profiles()
            .iter()
            .map(|profile| profile.name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["local", "warehouse"]);

        let warehouse = settings.profile("warehouse").expect("warehouse profile");
        assert_eq!(warehouse.dialect, Dialect::Postgres);
        assert_eq!(warehouse.password_source, PasswordSource::Keyring);
        assert!(warehouse.read_only);

        let local = settings.profile("local").expect("local profile");
        assert_eq!(local.port, 3306);
        assert_eq!(local.dialect, Dialect::Mysql);
    }

    #[test]
    fn upsert_persist_and_reload_profile() {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let path = temp_settings_path(&temp_dir);

        let mut settings = Settings::load_from_path(&path).expect("failed to load");
        let mut profile = ConnectionProfile::new("local", "127.0.0.1", "root");
        profile.database = Some("app".to_string());
        settings.upsert_profile(profile.clone());
        settings.engine_mut().page_size = 100;
        settings.persist().expect("failed to persist");

        let mut reloaded = Settings::load_from_path(&path).expect("failed to reload");
        assert_eq!(reloaded.profile("local"), Some(&profile));
        assert_eq!(reloaded.engine().page_size, 100);

        profile.database = Some("app_dev".to_string());
        reloaded.upsert_profile(profile);
        assert_eq!(reloaded.profiles().len(), 1);
        assert_eq!(
            reloaded
                .profile("local")
                .and_then(|profile| profile.database.as_deref()),
            Some("app_dev")
        );
    }

    #[test]
    fn malformed_settings_report_parse_error() {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let path = temp_settings_path(&temp_dir);
        std::fs::write(&path, "[engine\npage_size = ").expect("failed to write settings");

        let err = Settings::load_from_path(&path).expect_err("parse should fail");
        assert!(matches!(err, SettingsError::Parse { .. }));
    }
}
