use std::{
    fs::{create_dir_all, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::{error::Error, requester::RequesterSettings};

/// Settings of the streaming requester.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct StreamingSettings {
    /// How many pieces after the read position are downloaded first.
    pub high_priority_count: usize,
    /// The low priority window is this many times larger than the high
    /// priority one.
    pub low_priority_multiplier: usize,
}

impl Default for StreamingSettings {
    fn default() -> Self {
        Self { high_priority_count: 15, low_priority_multiplier: 2 }
    }
}

/// Knobs of the swarm simulator.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct SwarmSettings {
    pub piece_length: u32,
    /// Size of the torrent in bytes.
    pub size: u64,
    pub seeders: usize,
    pub leechers: usize,
    /// Give up after this many rounds.
    pub rounds: usize,
    /// Fraction of the requests, between 0 and 1, that peers reject.
    pub reject_rate: f64,
    /// Chance that a pending request is answered in a given round.
    pub deliver_rate: f64,
    pub seed: u64,
}

impl Default for SwarmSettings {
    fn default() -> Self {
        Self {
            piece_length: 256 * 1024,
            size: 40 * 256 * 1024,
            seeders: 2,
            leechers: 4,
            rounds: 10_000,
            reject_rate: 0.0,
            deliver_rate: 0.7,
            seed: 0,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub requester: RequesterSettings,
    pub streaming: StreamingSettings,
    pub swarm: SwarmSettings,
}

impl Config {
    /// Returns the path of the configuration file.
    ///
    /// If it doesn't exist or it is not a valid configuration, the default
    /// configuration is written to it, at the user's config folder.
    ///
    /// # Errors
    ///
    /// This fn can fail if the program does not have access to the config
    /// dir of the user, or if the user has no home.
    pub fn config_file() -> Result<PathBuf, Error> {
        // errors if the user does not have a home folder
        let dotfile =
            ProjectDirs::from("", "", "Vincenzo").ok_or(Error::HomeInvalid)?;
        let mut config_path = dotfile.config_dir().to_path_buf();

        // If the user has a home folder, but for some reason we cant open it
        if !config_path.exists() {
            create_dir_all(&config_path).map_err(|_| {
                Error::FolderOpenError(config_path.display().to_string())
            })?;
        }

        config_path.push("picker.toml");

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&config_path)?;

        // an empty or broken file is replaced by the defaults
        let mut dst = String::new();
        file.read_to_string(&mut dst)?;

        if toml::from_str::<Config>(&dst).is_err() {
            let config_str = toml::to_string(&Config::default())?;
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(config_str.as_bytes())?;
        }

        Ok(config_path)
    }

    /// Load the configuration file of the user, creating it with the
    /// default configuration if it does not exist.
    pub fn load() -> Result<Self, Error> {
        let path = Self::config_file()?;
        Self::from_path(path)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, Error> {
        let s = std::fs::read_to_string(path)?;
        Self::from_str(&s)
    }

    /// Missing keys take their default value.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self, Error> {
        Ok(toml::from_str::<Config>(s)?)
    }
}
