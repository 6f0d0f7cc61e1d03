use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::Deserialize;
use std::path::PathBuf;

use loopctl_core::models::{GlucoseUnit, TherapySettings};

/// Optional on-disk configuration, read from `config.json` in the data
/// directory. Every field has a sensible default so the file can be absent.
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    units: Option<String>,
    smb_minutes: Option<i64>,
    uam_minutes: Option<i64>,
    nightscout_url: Option<String>,
    nightscout_secret: Option<String>,
}

pub struct Config {
    pub db_path: PathBuf,
    pub settings: TherapySettings,
    pub nightscout_url: Option<String>,
    pub nightscout_secret: Option<String>,
}

impl Config {
    pub fn load() -> Result<Self> {
        let proj_dirs =
            ProjectDirs::from("", "", "loopctl").context("Could not determine home directory")?;

        let data_dir = proj_dirs.data_dir().to_path_buf();
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;

        let db_path = data_dir.join("loopctl.db");

        let file = Self::read_config_file(&data_dir)?;

        let units = match file.units.as_deref() {
            Some(s) => GlucoseUnit::parse(s)?,
            None => GlucoseUnit::MgDl,
        };
        let defaults = TherapySettings::default();
        let settings = TherapySettings {
            units,
            default_smb_minutes: file.smb_minutes.unwrap_or(defaults.default_smb_minutes),
            default_uam_minutes: file.uam_minutes.unwrap_or(defaults.default_uam_minutes),
        };

        // Environment overrides the file, so credentials can stay out of it
        let nightscout_url = std::env::var("LOOPCTL_NIGHTSCOUT_URL")
            .ok()
            .or(file.nightscout_url);
        let nightscout_secret = std::env::var("LOOPCTL_NIGHTSCOUT_SECRET")
            .ok()
            .or(file.nightscout_secret);

        Ok(Config {
            db_path,
            settings,
            nightscout_url,
            nightscout_secret,
        })
    }

    fn read_config_file(data_dir: &std::path::Path) -> Result<ConfigFile> {
        let path = data_dir.join("config.json");
        if !path.exists() {
            return Ok(ConfigFile::default());
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }
}
