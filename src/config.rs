use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Storage profile: where each tier lives. Loaded from `strata.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StrataConfig {
    /// Local JSON document file
    pub local: Option<String>,
    /// Local SQLite file
    pub sqlite: Option<String>,
    /// Remote REST tier
    pub remote: Option<RemoteConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub url: String,
    pub database: String,
    pub token: Option<String>,
}

pub fn default_config_path() -> PathBuf {
    PathBuf::from("strata.toml")
}

pub fn default_database_path_in(base: &Path) -> PathBuf {
    base.join(".strata").join("records.json")
}

pub fn load_config(path: Option<&Path>) -> anyhow::Result<Option<StrataConfig>> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
    if !path.exists() {
        return Ok(None);
    }

    let contents = std::fs::read_to_string(&path)?;
    let config: StrataConfig = toml::from_str(&contents)?;
    Ok(Some(config))
}

pub fn write_config(path: &Path, config: &StrataConfig, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!("config already exists at {} (use force to overwrite)", path.display());
    }

    let contents = toml::to_string_pretty(config)?;
    std::fs::write(path, contents)?;
    Ok(())
}

pub fn ensure_db_dir(db_path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strata.toml");

        let config = StrataConfig {
            local: Some(".strata/records.json".to_string()),
            sqlite: None,
            remote: Some(RemoteConfig {
                url: "https://records.example.org/api".to_string(),
                database: "lab".to_string(),
                token: Some("secret".to_string()),
            }),
        };
        write_config(&path, &config, false).unwrap();

        let loaded = load_config(Some(&path)).unwrap().unwrap();
        assert_eq!(loaded.local.as_deref(), Some(".strata/records.json"));
        let remote = loaded.remote.unwrap();
        assert_eq!(remote.database, "lab");
    }

    #[test]
    fn test_write_config_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strata.toml");

        write_config(&path, &StrataConfig::default(), false).unwrap();
        assert!(write_config(&path, &StrataConfig::default(), false).is_err());
        write_config(&path, &StrataConfig::default(), true).unwrap();
    }

    #[test]
    fn test_missing_config_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(load_config(Some(&path)).unwrap().is_none());
    }

    #[test]
    fn test_ensure_db_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = default_database_path_in(dir.path());
        ensure_db_dir(&path).unwrap();
        assert!(path.parent().unwrap().exists());
    }
}
