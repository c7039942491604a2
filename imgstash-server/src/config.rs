use imgstash_core::{GcConfig, Result, StashError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// SQLite database holding records and both indexes.
    #[serde(default = "default_db")]
    pub db: PathBuf,
    /// Directory holding image and thumbnail blobs.
    #[serde(default = "default_data")]
    pub data: PathBuf,
    #[serde(default)]
    pub gc: GcConfig,
}

fn default_db() -> PathBuf {
    PathBuf::from("./imgstash.db")
}

fn default_data() -> PathBuf {
    PathBuf::from("./data")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db: default_db(),
            data: default_data(),
            gc: GcConfig::default(),
        }
    }
}

impl Config {
    /// Load from an optional file, then `IMGSTASH_*` environment variables
    /// (`IMGSTASH_DB`, `IMGSTASH_GC__LIMIT`, ...).
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::with_name(path));
        }

        let settings = builder
            .add_source(
                ::config::Environment::with_prefix("IMGSTASH")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| StashError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| StashError::Config(e.to_string()))?;

        Ok(config)
    }

    /// The database's directory must exist and the database path must not
    /// be a directory; the data path must be an existing directory.
    pub fn validate(&self) -> Result<()> {
        let db_dir = match self.db.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        if !db_dir.is_dir() {
            return Err(StashError::Config(format!(
                "database directory {} does not exist",
                db_dir.display()
            )));
        }
        if self.db.is_dir() {
            return Err(StashError::Config(format!(
                "database path {} is a directory",
                self.db.display()
            )));
        }
        if !self.data.is_dir() {
            return Err(StashError::Config(format!(
                "data path {} is not a directory",
                self.data.display()
            )));
        }
        if self.gc.recent_limit == 0 {
            return Err(StashError::Config(
                "gc.recent_limit must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_from_file_with_defaults() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("imgstash.yaml");
        std::fs::write(&path, "db: /tmp/custom.db\ngc:\n  limit: 25\n").unwrap();

        let config = Config::load(Some(path.to_str().unwrap())).unwrap();
        assert_eq!(config.db, PathBuf::from("/tmp/custom.db"));
        assert_eq!(config.data, PathBuf::from("./data"));
        assert_eq!(config.gc.limit, 25);
        assert_eq!(config.gc.interval_secs, 300);
        assert_eq!(config.gc.recent_limit, 5);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("absent.yaml");
        let result = Config::load(Some(path.to_str().unwrap()));
        assert!(matches!(result, Err(StashError::Config(_))));
    }

    #[test]
    fn test_validate_paths() {
        let temp_dir = tempfile::tempdir().unwrap();
        let data = temp_dir.path().join("data");
        std::fs::create_dir(&data).unwrap();

        let config = Config {
            db: temp_dir.path().join("imgstash.db"),
            data: data.clone(),
            gc: GcConfig::default(),
        };
        assert!(config.validate().is_ok());

        let db_is_dir = Config {
            db: data.clone(),
            ..config.clone()
        };
        assert!(db_is_dir.validate().is_err());

        let missing_parent = Config {
            db: temp_dir.path().join("nope").join("imgstash.db"),
            ..config.clone()
        };
        assert!(missing_parent.validate().is_err());

        let missing_data = Config {
            data: temp_dir.path().join("missing"),
            ..config
        };
        assert!(missing_data.validate().is_err());
    }
}
