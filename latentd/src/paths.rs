//! Cross-platform application paths

use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct AppPaths {
    data_dir: PathBuf,
}

impl AppPaths {
    pub fn new() -> Result<Self, String> {
        Self::at(Self::get_data_dir()?)
    }

    /// Use `data_dir` instead of the platform location.
    pub fn at(data_dir: impl Into<PathBuf>) -> Result<Self, String> {
        let data_dir = data_dir.into();
        fs::create_dir_all(data_dir.join("sessions"))
            .map_err(|e| format!("Failed to create data directory: {}", e))?;
        Ok(Self { data_dir })
    }

    fn get_data_dir() -> Result<PathBuf, String> {
        let base = dirs::data_dir().ok_or("Could not determine data directory")?;
        Ok(base.join("latent_live"))
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn config_file(&self) -> PathBuf {
        self.data_dir.join("config.json")
    }

    /// Default results root when the config names none.
    pub fn results_dir(&self) -> PathBuf {
        self.data_dir.join("results")
    }

    /// Snapshot file for a session. Ids are restricted to
    /// `[A-Za-z0-9_-]` so they can never leave the sessions directory.
    pub fn session_file(&self, session_id: &str) -> Result<PathBuf, String> {
        validate_session_id(session_id)?;
        Ok(self
            .data_dir
            .join("sessions")
            .join(format!("{session_id}.lls")))
    }
}

pub fn validate_session_id(id: &str) -> Result<(), String> {
    let ok = !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(format!("Invalid session id {id:?}"))
    }
}
