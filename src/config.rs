use crate::core::catalog::{Catalog, DEFAULT_CATALOG_FILE};
use crate::core::shared::ProximityBands;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Settings read from `dupecat.json`. Every key is optional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Directory holding the images, relative to the config file.
    pub media_dir: PathBuf,
    /// Snapshot file name inside `media_dir`.
    pub catalog_file: String,
    /// The similarity sweep reports pairs closer than this.
    pub similarity_threshold: u32,
    /// Maximum number of records the sweep compares.
    pub sweep_limit: usize,
    pub near_threshold: u32,
    pub similar_threshold: u32,
}

impl Default for Config {
    fn default() -> Self {
        let bands = ProximityBands::default();
        Self {
            media_dir: PathBuf::from("downloads"),
            catalog_file: DEFAULT_CATALOG_FILE.to_string(),
            similarity_threshold: 5,
            sweep_limit: 10_000,
            near_threshold: bands.near,
            similar_threshold: bands.similar,
        }
    }
}

impl Config {
    /// Read `path`, falling back to defaults when it is absent or malformed.
    /// A relative `mediaDir` is resolved against the file's directory.
    pub fn load(path: &Path) -> Self {
        let mut config = match fs::read_to_string(path) {
            Ok(text) => match serde_json::from_str::<Config>(&text) {
                Ok(config) => config,
                Err(e) => {
                    warn!("{} is not valid ({}), using defaults", path.display(), e);
                    Config::default()
                }
            },
            Err(_) => {
                info!("{} not present, using defaults", path.display());
                Config::default()
            }
        };

        if config.media_dir.is_relative() {
            if let Some(base) = path.parent() {
                config.media_dir = base.join(&config.media_dir);
            }
        }
        config
    }

    pub fn proximity_bands(&self) -> ProximityBands {
        ProximityBands {
            near: self.near_threshold,
            similar: self.similar_threshold,
        }
    }

    /// Open the catalog of `media_dir`, loading its snapshot if present.
    pub fn open_catalog(&self) -> Catalog {
        let mut catalog = Catalog::with_catalog_file(&self.media_dir, &self.catalog_file);
        catalog.load();
        catalog
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::load(&temp_dir.path().join("dupecat.json"));
        assert_eq!(config.media_dir, temp_dir.path().join("downloads"));
        assert_eq!(config.catalog_file, "info.json");
        assert_eq!(config.proximity_bands(), ProximityBands::default());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("dupecat.json");
        fs::write(
            &path,
            r#"{ "mediaDir": "pictures", "similarityThreshold": 8, "bookmarks": [] }"#,
        )
        .unwrap();

        let config = Config::load(&path);
        assert_eq!(config.media_dir, temp_dir.path().join("pictures"));
        assert_eq!(config.similarity_threshold, 8);
        assert_eq!(config.sweep_limit, 10_000);
    }

    #[test]
    fn test_malformed_file_gives_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("dupecat.json");
        fs::write(&path, "mediaDir = 'x'").unwrap();

        let config = Config::load(&path);
        assert_eq!(config.similarity_threshold, 5);
    }

    #[test]
    fn test_absolute_media_dir_is_kept() {
        let temp_dir = TempDir::new().unwrap();
        let media = temp_dir.path().join("abs");
        let path = temp_dir.path().join("dupecat.json");
        fs::write(
            &path,
            serde_json::json!({ "mediaDir": media, "catalogFile": "catalog.json" }).to_string(),
        )
        .unwrap();

        let config = Config::load(&path);
        assert_eq!(config.media_dir, media);

        fs::create_dir(&media).unwrap();
        let catalog = config.open_catalog();
        assert_eq!(catalog.snapshot_path(), media.join("catalog.json"));
    }
}
