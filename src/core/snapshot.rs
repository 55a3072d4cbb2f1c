use crate::core::catalog::CatalogError;
use crate::core::hash::{Fingerprint, FINGERPRINT_BITS};
use serde::{Deserialize, Deserializer, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, warn};

/// One known image file.
///
/// The JSON keys (`hash`, `phash`) match catalogs written by earlier versions
/// of the tool so existing `info.json` files load unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    /// File name with extension, without path.
    pub name: String,

    /// MD5 of the file bytes, lowercase hex.
    #[serde(rename = "hash")]
    pub content_hash: String,

    /// 64-bit perceptual hash, persisted as hex. Missing on legacy entries.
    #[serde(
        rename = "phash",
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_fingerprint"
    )]
    pub fingerprint: Option<Fingerprint>,

    /// File size in bytes.
    #[serde(default)]
    pub size: u64,
}

/// A malformed or wrong-width `phash` only drops that fingerprint; the next
/// scan backfills it.
fn lenient_fingerprint<'de, D>(deserializer: D) -> Result<Option<Fingerprint>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.and_then(|hex| match Fingerprint::from_hex(&hex) {
        Ok(fp) if fp.width() == FINGERPRINT_BITS => Some(fp),
        Ok(fp) => {
            warn!("Ignoring {}-bit fingerprint {}", fp.width(), hex);
            None
        }
        Err(e) => {
            warn!("Ignoring unreadable fingerprint: {}", e);
            None
        }
    }))
}

#[derive(Debug, Error)]
pub enum SnapshotLoadError {
    #[error("catalog file not found")]
    Missing,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed catalog: {0}")]
    Parse(#[from] serde_json::Error),
}

/// On-disk form of a catalog. Nothing but the record list is stored.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub image_info: Vec<ImageRecord>,
}

impl Snapshot {
    pub fn read(path: &Path) -> Result<Self, SnapshotLoadError> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(SnapshotLoadError::Missing),
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&text)?)
    }

    /// Serialize and atomically replace `path`.
    pub fn write(&self, path: &Path) -> Result<(), CatalogError> {
        let json = serde_json::to_vec_pretty(self)?;
        write_atomically(path, &json).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Write `contents` to a temporary file next to `path`, then rename it over
/// `path`. Readers see either the old file or the complete new one.
pub(crate) fn write_atomically(path: &Path, contents: &[u8]) -> io::Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.flush()?;
    if let Err(e) = tmp.as_file().sync_all() {
        debug!("sync of {:?} failed: {}", tmp.path(), e);
    }
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
