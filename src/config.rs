// SPDX-FileCopyrightText: 2025 The seedgate Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use figment::providers::{Env, Format};
use figment::{providers::Toml, Figment};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_PREFIX: &str = "SEEDGATE_";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub client_id: String,

    // Verification admission
    pub admission_permits: usize,
    pub admission_retry_ms: u64,

    // Disk
    pub default_download_folder: Option<PathBuf>,

    pub torrents: Vec<TorrentSettings>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            admission_permits: 1,
            admission_retry_ms: 3000,
            default_download_folder: None,
            torrents: Vec::new(),
        }
    }
}

impl Settings {
    pub fn admission_retry(&self) -> Duration {
        Duration::from_millis(self.admission_retry_ms)
    }

    /// Where a torrent's data lives when it names no path of its own.
    pub fn download_dir_for(&self, torrent: &TorrentSettings) -> PathBuf {
        torrent
            .download_path
            .clone()
            .or_else(|| self.default_download_folder.clone())
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq)]
#[serde(default)]
pub struct TorrentSettings {
    pub torrent_file: PathBuf,
    pub download_path: Option<PathBuf>,
}

/// Config and data directories, created on first use.
pub fn get_app_paths() -> Option<(PathBuf, PathBuf)> {
    if let Some(proj_dirs) = ProjectDirs::from("org", "seedgate", "seedgate") {
        let config_dir = proj_dirs.config_dir().to_path_buf();
        let data_dir = proj_dirs.data_local_dir().to_path_buf();

        fs::create_dir_all(&config_dir).ok()?;
        fs::create_dir_all(&data_dir).ok()?;

        Some((config_dir, data_dir))
    } else {
        None
    }
}

pub fn get_data_dir() -> PathBuf {
    get_app_paths()
        .map(|(_, data_dir)| data_dir)
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
}

/// The command folder watched by a running client and the folder handled
/// files are moved to.
pub fn watch_paths(data_dir: &Path) -> (PathBuf, PathBuf) {
    (
        data_dir.join("watch_files"),
        data_dir.join("processed_files"),
    )
}

pub fn create_watch_directories(data_dir: &Path) -> io::Result<()> {
    let (watch_path, processed_path) = watch_paths(data_dir);
    fs::create_dir_all(watch_path)?;
    fs::create_dir_all(processed_path)?;
    Ok(())
}

pub fn load_settings_from(config_file_path: &Path) -> Result<Settings, figment::Error> {
    Figment::new()
        .merge(Toml::file(config_file_path))
        .merge(Env::prefixed(ENV_PREFIX))
        .extract()
}

pub fn load_settings() -> Settings {
    if let Some((config_dir, _)) = get_app_paths() {
        let config_file_path = config_dir.join("settings.toml");
        return match load_settings_from(&config_file_path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!("Failed to load settings, using defaults: {}", e);
                Settings::default()
            }
        };
    }

    // Fallback if we can't even determine the application paths.
    Settings::default()
}

pub fn save_settings_to(settings: &Settings, config_dir: &Path) -> io::Result<()> {
    let config_file_path = config_dir.join("settings.toml");
    let temp_file_path = config_dir.join("settings.toml.tmp");
    let content = toml::to_string_pretty(settings).map_err(io::Error::other)?;
    fs::write(&temp_file_path, content)?;
    fs::rename(&temp_file_path, &config_file_path)?;
    Ok(())
}

/// Saves the provided settings to the config file.
pub fn save_settings(settings: &Settings) -> io::Result<()> {
    if let Some((config_dir, _)) = get_app_paths() {
        save_settings_to(settings, &config_dir)?;
    }
    Ok(())
}
