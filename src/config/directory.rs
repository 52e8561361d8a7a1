//! Site directory: resolves site identifiers to upstream credentials
//!
//! The directory is a small JSON document mapping each site to the username
//! and password used for its telemetry fetches. Resolution happens once per
//! ingestion run, before any network call; a site without a usable entry is
//! a hard failure.

use crate::error::{HistoryError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Credentials stored for one site
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteCredentials {
    pub username: String,
    pub password: String,
}

/// Credentials resolved for a run; request-scoped, never persisted
#[derive(Debug, Clone)]
pub struct Credentials {
    pub site: String,
    pub username: String,
    pub password: String,
}

/// File-backed site → credentials mapping
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SiteDirectory {
    pub sites: HashMap<String, SiteCredentials>,
}

impl SiteDirectory {
    /// Default directory file location, `~/.thermo-history/sites.json`
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".thermo-history")
            .join("sites.json")
    }

    /// Load the directory file; a missing file yields an empty directory
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(|e| {
            HistoryError::credentials(format!("Failed to read site directory: {e}"))
        })?;

        serde_json::from_str(&content).map_err(|e| {
            HistoryError::credentials(format!("Failed to parse site directory: {e}"))
        })
    }

    /// Save the directory file, creating its parent directory if needed
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                HistoryError::credentials(format!("Failed to create directory folder: {e}"))
            })?;
        }

        let content = serde_json::to_string_pretty(self).map_err(|e| {
            HistoryError::credentials(format!("Failed to serialize site directory: {e}"))
        })?;

        fs::write(path, content).map_err(|e| {
            HistoryError::credentials(format!("Failed to write site directory: {e}"))
        })?;

        Ok(())
    }

    /// Add or replace a site entry
    pub fn add_site(
        &mut self,
        site: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) {
        self.sites.insert(
            site.into(),
            SiteCredentials {
                username: username.into(),
                password: password.into(),
            },
        );
    }

    /// Resolve a site to usable credentials.
    ///
    /// Fails hard when the site is absent or either credential is empty, so
    /// ingestion never reaches the network with a broken identity.
    pub fn lookup(&self, site: &str) -> Result<Credentials> {
        let entry = self.sites.get(site).ok_or_else(|| {
            HistoryError::credentials(format!("no credentials registered for site '{site}'"))
        })?;
        if entry.username.trim().is_empty() {
            return Err(HistoryError::credentials(format!(
                "site '{site}' has an empty username"
            )));
        }
        if entry.password.is_empty() {
            return Err(HistoryError::credentials(format!(
                "site '{site}' has an empty password"
            )));
        }
        Ok(Credentials {
            site: site.to_string(),
            username: entry.username.clone(),
            password: entry.password.clone(),
        })
    }

    /// Registered site identifiers, sorted for stable output
    pub fn site_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sites.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_lookup_resolves_registered_site() {
        let mut directory = SiteDirectory::default();
        directory.add_site("bldg-7", "ops", "s3cret");

        let credentials = directory.lookup("bldg-7").unwrap();
        assert_eq!(credentials.site, "bldg-7");
        assert_eq!(credentials.username, "ops");
        assert_eq!(credentials.password, "s3cret");
    }

    #[test]
    fn test_lookup_fails_hard_for_unknown_site() {
        let directory = SiteDirectory::default();
        let err = directory.lookup("nowhere").unwrap_err();
        assert!(err.is_auth_error());
        assert!(err.to_string().contains("nowhere"));
    }

    #[test]
    fn test_lookup_rejects_empty_secrets() {
        let mut directory = SiteDirectory::default();
        directory.add_site("no-user", "  ", "pw");
        directory.add_site("no-pass", "ops", "");

        assert!(directory.lookup("no-user").unwrap_err().is_auth_error());
        assert!(directory.lookup("no-pass").unwrap_err().is_auth_error());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("sites.json");

        let mut directory = SiteDirectory::default();
        directory.add_site("bldg-7", "ops", "s3cret");
        directory.save(&path).unwrap();

        let loaded = SiteDirectory::load(&path).unwrap();
        assert_eq!(loaded.site_ids(), ["bldg-7"]);
        assert!(loaded.lookup("bldg-7").is_ok());
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let dir = tempdir().unwrap();
        let directory = SiteDirectory::load(&dir.path().join("sites.json")).unwrap();
        assert!(directory.site_ids().is_empty());
    }
}
