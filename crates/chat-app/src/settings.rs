use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chitchat_storage::{DEFAULT_FETCH_TIMEOUT, DEFAULT_PREVIEW_MAX_CHARS, RepositoryConfig};
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::conversations::ControllerOptions;

pub const SETTINGS_DIRECTORY_NAME: &str = "chitchat";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const SETTINGS_ENV_PREFIX: &str = "CHITCHAT_";

/// Tunables of the conversation sync core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSettings {
    /// `0` disables the fetch timeout.
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
    #[serde(default = "default_live_updates")]
    pub live_updates: bool,
    /// `0` keeps previews at full length.
    #[serde(default = "default_preview_max_chars")]
    pub preview_max_chars: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            fetch_timeout_ms: default_fetch_timeout_ms(),
            live_updates: default_live_updates(),
            preview_max_chars: default_preview_max_chars(),
        }
    }
}

impl SyncSettings {
    pub fn fetch_timeout(&self) -> Option<Duration> {
        (self.fetch_timeout_ms > 0).then(|| Duration::from_millis(self.fetch_timeout_ms))
    }

    pub fn repository_config(&self) -> RepositoryConfig {
        RepositoryConfig {
            fetch_timeout: self.fetch_timeout(),
            preview_max_chars: self.preview_max_chars,
        }
    }

    pub fn controller_options(&self) -> ControllerOptions {
        ControllerOptions {
            live_updates: self.live_updates,
        }
    }
}

/// Settings loaded once from disk and environment, replaceable at runtime.
pub struct SettingsStore {
    settings: Arc<ArcSwap<SyncSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".chitchat"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from(&config_path);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<SyncSettings> {
        self.settings.load_full()
    }

    /// Persists `settings` and makes them current. Running services keep
    /// whatever they were started with.
    pub fn update(&self, settings: SyncSettings) -> Result<(), SettingsError> {
        self.persist(&settings)?;
        self.settings.store(Arc::new(settings));
        Ok(())
    }

    /// Defaults, then the JSON file if present, then `CHITCHAT_*` variables.
    pub fn load_from(path: &Path) -> SyncSettings {
        if !path.exists() {
            tracing::info!("settings file not found at {:?}, using defaults", path);
        }

        let figment = Figment::from(Serialized::defaults(SyncSettings::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(SETTINGS_ENV_PREFIX));

        match figment.extract::<SyncSettings>() {
            Ok(settings) => settings,
            Err(error) => {
                tracing::warn!(
                    "failed to parse settings from {:?}: {}. using defaults",
                    path,
                    error
                );
                SyncSettings::default()
            }
        }
    }

    fn persist(&self, settings: &SyncSettings) -> Result<(), SettingsError> {
        write_settings_file(&self.config_path, settings)?;
        tracing::info!(
            path = %self.config_path.display(),
            fetch_timeout_ms = settings.fetch_timeout_ms,
            live_updates = settings.live_updates,
            "saved sync settings"
        );
        Ok(())
    }
}

/// Stages the file beside `path`, then renames it into place.
fn write_settings_file(path: &Path, settings: &SyncSettings) -> Result<(), SettingsError> {
    let directory = path.parent().filter(|parent| !parent.as_os_str().is_empty());
    if let Some(directory) = directory {
        std::fs::create_dir_all(directory).context(PrepareDirectorySnafu {
            stage: "prepare-settings-directory",
            directory,
        })?;
    }

    let encoded = serde_json::to_vec_pretty(settings).context(EncodeSnafu {
        stage: "encode-sync-settings",
    })?;

    let staging = path.with_extension("json.tmp");
    std::fs::write(&staging, encoded).context(WriteSnafu {
        stage: "write-staged-settings",
        path: &staging,
    })?;
    std::fs::rename(&staging, path).context(WriteSnafu {
        stage: "swap-in-staged-settings",
        path,
    })
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("cannot prepare settings directory {directory:?} on `{stage}`: {source}"))]
    PrepareDirectory {
        stage: &'static str,
        directory: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("cannot encode sync settings on `{stage}`: {source}"))]
    Encode {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("cannot write settings to {path:?} on `{stage}`: {source}"))]
    Write {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
}

fn default_fetch_timeout_ms() -> u64 {
    DEFAULT_FETCH_TIMEOUT.as_millis() as u64
}

fn default_live_updates() -> bool {
    true
}

fn default_preview_max_chars() -> usize {
    DEFAULT_PREVIEW_MAX_CHARS
}
