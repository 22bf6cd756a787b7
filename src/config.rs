// src/config.rs
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use directories_next::ProjectDirs;
use log::{debug, warn};
use serde::Deserialize;

use crate::qr::DEFAULT_QR_SIZE;
use crate::server::{Locale, LocalePolicy};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Interface the pairing server listens on.
    pub bind_addr: IpAddr,
    /// First port to try; 0 lets the OS pick.
    pub port: u16,
    pub qr_size: u32,
    /// Attempts before giving up on port conflicts.
    pub bind_attempts: u32,
    pub default_locale: Locale,
    pub prefer_client_language: bool,
    pub stop_grace_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            qr_size: DEFAULT_QR_SIZE,
            bind_attempts: 3,
            default_locale: Locale::En,
            prefer_client_language: false,
            stop_grace_ms: 2000,
        }
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).context("invalid pairing config")
    }

    /// A missing file is not an error; defaults apply.
    pub fn load_from(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(s) => Self::from_toml_str(&s).with_context(|| format!("reading {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
        }
    }

    /// Loads `config.toml` from the platform config dir, falling back to defaults.
    pub fn load() -> Self {
        let Some(path) = config_path() else {
            return Self::default();
        };
        match Self::load_from(&path) {
            Ok(config) => {
                debug!("config from {}: {config:?}", path.display());
                config
            }
            Err(e) => {
                warn!("{e:#}; using defaults");
                Self::default()
            }
        }
    }

    pub fn locale_policy(&self) -> LocalePolicy {
        LocalePolicy {
            default: self.default_locale,
            prefer_client: self.prefer_client_language,
        }
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

pub fn config_path() -> Option<PathBuf> {
    ProjectDirs::from("org", "tv-pair", "tv-pair").map(|dirs| dirs.config_dir().join("config.toml"))
}
