//! User settings persistence via TOML.
//!
//! Settings are stored at `<config_dir>/ferry/settings.toml`. A missing or
//! corrupted file yields defaults with a freshly generated user ID, which
//! are written back so the ID stays stable across runs.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default upload size cap: 10 MiB.
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 10 * 1024 * 1024;

/// User-configurable settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Display name shown to other peers.
    pub username: String,
    /// Stable identifier for this installation, generated on first run.
    pub user_id: String,
    /// Directory for upload storage.
    pub storage_dir: PathBuf,
    /// Largest upload accepted, in bytes.
    pub max_upload_bytes: u64,
    /// Permitted file extensions, lowercase without the dot. Empty means
    /// any extension is accepted.
    pub allowed_extensions: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        let storage_dir = directories::ProjectDirs::from("", "", "ferry")
            .map(|d| d.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("ferry-data"));

        Self {
            username: "user".to_string(),
            user_id: uuid::Uuid::new_v4().to_string(),
            storage_dir,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            allowed_extensions: Vec::new(),
        }
    }
}

impl Settings {
    /// Load settings from the default config path, creating them on first
    /// run.
    pub fn load_or_init() -> Self {
        Self::load_or_init_from_dir(Self::config_dir())
    }

    /// Save settings to the default config path.
    pub fn save(&self) -> Result<()> {
        self.save_to_dir(Self::config_dir())
    }

    /// Load settings from a specific config directory.
    ///
    /// Missing or corrupted files yield defaults, which are persisted so the
    /// generated user ID survives the next load.
    pub fn load_or_init_from_dir(config_dir: PathBuf) -> Self {
        let path = config_dir.join("settings.toml");
        match std::fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(settings) => {
                    tracing::info!(path = %path.display(), "settings loaded");
                    return settings;
                }
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "corrupted settings file, regenerating defaults"
                    );
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(
                    path = %path.display(),
                    "settings file not found, generating defaults"
                );
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to read settings file, regenerating defaults"
                );
            }
        }

        let settings = Self::default();
        if let Err(e) = settings.save_to_dir(config_dir) {
            tracing::warn!(error = %e, "failed to persist generated settings");
        }
        settings
    }

    /// Save settings to a specific config directory.
    pub fn save_to_dir(&self, config_dir: PathBuf) -> Result<()> {
        std::fs::create_dir_all(&config_dir).with_context(|| {
            format!(
                "failed to create config directory: {}",
                config_dir.display()
            )
        })?;

        let path = config_dir.join("settings.toml");
        let contents = toml::to_string_pretty(self).context("failed to serialize settings")?;
        std::fs::write(&path, &contents)
            .with_context(|| format!("failed to write settings file: {}", path.display()))?;

        tracing::info!(path = %path.display(), "settings saved");
        Ok(())
    }

    /// Whether an upload with this name and size passes the local policy.
    ///
    /// Returns the human-readable refusal reason otherwise.
    pub fn check_upload(&self, filename: &str, size: u64) -> std::result::Result<(), String> {
        if size == 0 {
            return Err("file is empty".to_string());
        }
        if size > self.max_upload_bytes {
            return Err(format!(
                "file is {size} bytes, the limit is {} bytes",
                self.max_upload_bytes
            ));
        }
        if !self.allowed_extensions.is_empty() {
            let ext = std::path::Path::new(filename)
                .extension()
                .map(|e| e.to_string_lossy().to_lowercase())
                .unwrap_or_default();
            if !self.allowed_extensions.iter().any(|a| a == &ext) {
                return Err(format!("file extension {ext:?} is not permitted"));
            }
        }
        Ok(())
    }

    fn config_dir() -> PathBuf {
        directories::ProjectDirs::from("", "", "ferry")
            .map(|d| d.config_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("ferry-config"))
    }
}
