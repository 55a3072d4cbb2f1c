use crate::core::hash::{self, Fingerprint, Fingerprinter, HashError, FINGERPRINT_BITS};
use crate::core::index::DuplicateIndex;
use crate::core::snapshot::{self, ImageRecord, Snapshot, SnapshotLoadError};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Snapshot file kept inside every managed directory.
pub const DEFAULT_CATALOG_FILE: &str = "info.json";

/// Extensions (lowercase, without dot) the catalog treats as images.
pub const IMAGE_EXTENSIONS: [&str; 5] = ["jpeg", "jpg", "png", "webp", "gif"];

/// Returned by [`Catalog::min_distance`] when no record carries a fingerprint.
/// Larger than any threshold a caller would compare against.
pub const NO_MATCH: u32 = u32::MAX;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("IO error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Catalog serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Hash error: {0}")]
    Hash(#[from] HashError),

    #[error("Invalid image name: {name}")]
    InvalidName { name: String },
}

/// True when `name` ends in a recognized image extension (case-insensitive).
pub fn is_image_name(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Images sharing one content hash.
#[derive(Debug, Clone)]
pub struct DuplicateGroup<'a> {
    pub content_hash: &'a str,
    pub records: Vec<&'a ImageRecord>,
}

/// Two records whose fingerprints are close.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimilarPair {
    pub left: String,
    pub right: String,
    pub distance: u32,
}

/// The catalog of one image directory.
///
/// Records are keyed by file name. `changes` counts modifications that have
/// not been written to the snapshot file yet.
pub struct Catalog {
    pub(crate) dir: PathBuf,
    pub(crate) snapshot_path: PathBuf,
    pub(crate) records: BTreeMap<String, ImageRecord>,
    pub(crate) index: DuplicateIndex,
    pub(crate) changes: usize,
    pub(crate) equal_hash: usize,
    pub(crate) fingerprinter: Arc<Fingerprinter>,
}

impl Catalog {
    /// An empty catalog for `dir`, persisted to `dir/info.json`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_catalog_file(dir, DEFAULT_CATALOG_FILE)
    }

    pub fn with_catalog_file(dir: impl Into<PathBuf>, file_name: &str) -> Self {
        let dir = dir.into();
        let snapshot_path = dir.join(file_name);
        Self {
            dir,
            snapshot_path,
            records: BTreeMap::new(),
            index: DuplicateIndex::new(),
            changes: 0,
            equal_hash: 0,
            fingerprinter: Arc::new(Fingerprinter::new()),
        }
    }

    /// Create and load from the snapshot, starting empty if there is none.
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        let mut catalog = Self::new(dir);
        catalog.load();
        catalog
    }

    /// Replace the records with the persisted snapshot.
    ///
    /// A missing or malformed snapshot is not an error: the current records
    /// are kept (empty for a fresh catalog) and `false` is returned.
    pub fn load(&mut self) -> bool {
        match Snapshot::read(&self.snapshot_path) {
            Ok(snapshot) => {
                self.records.clear();
                self.index.clear();
                for record in snapshot.image_info {
                    self.register(record);
                }
                debug!(
                    "Loaded {} records from {}",
                    self.records.len(),
                    self.snapshot_path.display()
                );
                true
            }
            Err(SnapshotLoadError::Missing) => {
                info!(
                    "No catalog at {}, starting a new one",
                    self.snapshot_path.display()
                );
                false
            }
            Err(e) => {
                warn!(
                    "Catalog {} not usable ({}), starting a new one",
                    self.snapshot_path.display(),
                    e
                );
                false
            }
        }
    }

    /// Insert `record`, replacing any record with the same name, and index
    /// its content hash.
    pub fn register(&mut self, record: ImageRecord) {
        if let Some(previous) = self.records.get(&record.name) {
            self.index.remove(&previous.content_hash, &previous.name);
        }
        self.index.insert(&record.content_hash, &record.name);
        self.records.insert(record.name.clone(), record);
    }

    /// Remove the record called `name` from the map and the index.
    pub fn unregister(&mut self, name: &str) -> Option<ImageRecord> {
        let record = self.records.remove(name)?;
        self.index.remove(&record.content_hash, &record.name);
        Some(record)
    }

    /// Write every record to the snapshot file, then clear `changes`.
    ///
    /// The counter is only cleared after the file has been replaced, so a
    /// failed write leaves the changes pending.
    pub fn save(&mut self) -> Result<(), CatalogError> {
        let snapshot = Snapshot {
            image_info: self.records.values().cloned().collect(),
        };
        snapshot.write(&self.snapshot_path)?;
        info!(
            "Saved {} records to {}",
            snapshot.image_info.len(),
            self.snapshot_path.display()
        );
        self.changes = 0;
        Ok(())
    }

    /// Save only if there are unsaved changes. Returns whether it saved.
    pub fn flush(&mut self) -> Result<bool, CatalogError> {
        if self.changes == 0 {
            return Ok(false);
        }
        info!("{} changes: saving catalog", self.changes);
        self.save()?;
        Ok(true)
    }

    /// Smallest Hamming distance from `fingerprint` to any record,
    /// or [`NO_MATCH`] when no record has a fingerprint.
    pub fn min_distance(&self, fingerprint: &Fingerprint) -> Result<u32, CatalogError> {
        let mut best = NO_MATCH;
        for record in self.records.values() {
            if let Some(fp) = &record.fingerprint {
                best = best.min(fingerprint.distance(fp)?);
                if best == 0 {
                    break;
                }
            }
        }
        Ok(best)
    }

    /// Store a new image in the directory and record it.
    ///
    /// `known_fingerprint` skips decoding when the caller already has one;
    /// it must be a full 64-bit fingerprint.
    /// The record is registered only after the file is written, and the
    /// catalog is saved before returning.
    pub fn add_image(
        &mut self,
        name: &str,
        bytes: &[u8],
        known_fingerprint: Option<Fingerprint>,
    ) -> Result<ImageRecord, CatalogError> {
        let is_plain_name = Path::new(name).file_name().and_then(|n| n.to_str()) == Some(name);
        if !is_plain_name || !is_image_name(name) {
            return Err(CatalogError::InvalidName {
                name: name.to_string(),
            });
        }
        if let Some(fp) = &known_fingerprint {
            if fp.width() != FINGERPRINT_BITS {
                return Err(HashError::WidthMismatch {
                    left: FINGERPRINT_BITS,
                    right: fp.width(),
                }
                .into());
            }
        }

        let path = self.dir.join(name);
        snapshot::write_atomically(&path, bytes).map_err(|source| CatalogError::Io {
            path: path.clone(),
            source,
        })?;

        let fingerprint = match known_fingerprint {
            Some(fp) => Some(fp),
            None => match self.fingerprinter.fingerprint(bytes) {
                Ok(fp) => Some(fp),
                Err(e) => {
                    warn!("No fingerprint for {}: {}", name, e);
                    None
                }
            },
        };

        let record = ImageRecord {
            name: name.to_string(),
            content_hash: hash::content_hash(bytes),
            fingerprint,
            size: bytes.len() as u64,
        };
        info!("Added {} ({} bytes)", record.name, record.size);
        self.register(record.clone());
        self.changes += 1;
        self.save()?;
        Ok(record)
    }

    /// Every content hash shared by two or more records, ordered by hash.
    pub fn duplicate_groups(&self) -> Vec<DuplicateGroup<'_>> {
        let mut groups: Vec<DuplicateGroup<'_>> = self
            .index
            .groups()
            .map(|(content_hash, names)| DuplicateGroup {
                content_hash,
                records: names.iter().filter_map(|n| self.records.get(n)).collect(),
            })
            .collect();
        groups.sort_by(|a, b| a.content_hash.cmp(b.content_hash));
        groups
    }

    /// All pairs among the first `limit` records (by name) whose fingerprint
    /// distance is below `threshold`. Quadratic in `limit`.
    pub fn similar_pairs(
        &self,
        threshold: u32,
        limit: usize,
    ) -> Result<Vec<SimilarPair>, CatalogError> {
        let sample: Vec<(&str, &Fingerprint)> = self
            .records
            .values()
            .take(limit)
            .filter_map(|r| r.fingerprint.as_ref().map(|fp| (r.name.as_str(), fp)))
            .collect();

        let per_row: Vec<Vec<SimilarPair>> = (0..sample.len())
            .into_par_iter()
            .map(|i| {
                let (left, left_fp) = sample[i];
                let mut row = Vec::new();
                for &(right, right_fp) in &sample[i + 1..] {
                    let distance = left_fp.distance(right_fp)?;
                    if distance < threshold {
                        row.push(SimilarPair {
                            left: left.to_string(),
                            right: right.to_string(),
                            distance,
                        });
                    }
                }
                Ok::<_, HashError>(row)
            })
            .collect::<Result<_, HashError>>()?;

        Ok(per_row.into_iter().flatten().collect())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }

    pub fn get(&self, name: &str) -> Option<&ImageRecord> {
        self.records.get(name)
    }

    /// Records in name order.
    pub fn records(&self) -> impl Iterator<Item = &ImageRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of modifications not yet saved.
    pub fn changes(&self) -> usize {
        self.changes
    }

    /// Records seen by the last scan whose content hash equals their base name.
    pub fn equal_hash_count(&self) -> usize {
        self.equal_hash
    }

    pub fn index(&self) -> &DuplicateIndex {
        &self.index
    }

    pub fn fingerprinter(&self) -> &Arc<Fingerprinter> {
        &self.fingerprinter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hash::tests::png_bytes;
    use std::fs;
    use tempfile::TempDir;

    fn record(name: &str, hash: &str, phash: Option<&str>) -> ImageRecord {
        ImageRecord {
            name: name.to_string(),
            content_hash: hash.to_string(),
            fingerprint: phash.map(|h| Fingerprint::from_hex(h).unwrap()),
            size: 1,
        }
    }

    #[test]
    fn test_is_image_name() {
        assert!(is_image_name("a.jpg"));
        assert!(is_image_name("b.JPEG"));
        assert!(is_image_name("c.Png"));
        assert!(is_image_name("d.webp"));
        assert!(is_image_name("e.gif"));
        assert!(!is_image_name("f.bmp"));
        assert!(!is_image_name("info.json"));
        assert!(!is_image_name("jpg"));
    }

    #[test]
    fn test_register_groups_duplicates() {
        let temp_dir = TempDir::new().unwrap();
        let mut catalog = Catalog::new(temp_dir.path());
        catalog.register(record("one.jpg", "A", None));
        catalog.register(record("two.jpg", "A", None));
        catalog.register(record("three.jpg", "B", None));

        let groups = catalog.duplicate_groups();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].content_hash, "A");
        assert_eq!(groups[0].records.len(), 2);
        assert!(catalog.index().group("B").is_none());
    }

    #[test]
    fn test_register_same_name_replaces() {
        let temp_dir = TempDir::new().unwrap();
        let mut catalog = Catalog::new(temp_dir.path());
        catalog.register(record("one.jpg", "A", None));
        catalog.register(record("two.jpg", "A", None));
        catalog.register(record("two.jpg", "C", None));

        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.get("two.jpg").unwrap().content_hash, "C");
        assert!(catalog.duplicate_groups().is_empty());
    }

    #[test]
    fn test_missing_or_corrupt_snapshot_starts_empty() {
        let temp_dir = TempDir::new().unwrap();
        let catalog = Catalog::open(temp_dir.path());
        assert!(catalog.is_empty());

        fs::write(temp_dir.path().join(DEFAULT_CATALOG_FILE), "][").unwrap();
        let mut catalog = Catalog::open(temp_dir.path());
        assert!(catalog.is_empty());
        assert!(!catalog.load());
    }

    #[test]
    fn test_save_then_load() {
        let temp_dir = TempDir::new().unwrap();
        let mut catalog = Catalog::new(temp_dir.path());
        catalog.register(record("a.jpg", "A", Some("ffffffff00000000")));
        catalog.register(record("b.jpg", "A", None));
        catalog.changes = 2;

        catalog.save().unwrap();
        assert_eq!(catalog.changes(), 0);

        let reopened = Catalog::open(temp_dir.path());
        assert_eq!(reopened.len(), 2);
        assert_eq!(
            reopened.get("a.jpg").unwrap().fingerprint,
            Some(Fingerprint::from_hex("ffffffff00000000").unwrap())
        );
        assert_eq!(reopened.duplicate_groups().len(), 1);
    }

    #[test]
    fn test_failed_save_keeps_changes() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("gone");
        let mut catalog = Catalog::new(&missing);
        catalog.register(record("a.jpg", "A", None));
        catalog.changes = 1;

        assert!(matches!(catalog.save(), Err(CatalogError::Io { .. })));
        assert_eq!(catalog.changes(), 1);
    }

    #[test]
    fn test_flush_only_when_dirty() {
        let temp_dir = TempDir::new().unwrap();
        let mut catalog = Catalog::new(temp_dir.path());
        assert!(!catalog.flush().unwrap());
        assert!(!catalog.snapshot_path().exists());

        catalog.register(record("a.jpg", "A", None));
        catalog.changes = 1;
        assert!(catalog.flush().unwrap());
        assert!(catalog.snapshot_path().exists());
        assert_eq!(catalog.changes(), 0);
    }

    #[test]
    fn test_min_distance_empty_is_no_match() {
        let temp_dir = TempDir::new().unwrap();
        let mut catalog = Catalog::new(temp_dir.path());
        let query = Fingerprint::from_hex("0000000000000000").unwrap();
        assert_eq!(catalog.min_distance(&query).unwrap(), NO_MATCH);

        // Records without fingerprints do not count
        catalog.register(record("a.jpg", "A", None));
        assert_eq!(catalog.min_distance(&query).unwrap(), NO_MATCH);
    }

    #[test]
    fn test_min_distance_picks_closest() {
        let temp_dir = TempDir::new().unwrap();
        let mut catalog = Catalog::new(temp_dir.path());
        catalog.register(record("far.jpg", "A", Some("ffffffffffffffff")));
        catalog.register(record("near.jpg", "B", Some("0000000000000007")));
        catalog.register(record("legacy.jpg", "C", None));

        let query = Fingerprint::from_hex("0000000000000000").unwrap();
        assert_eq!(catalog.min_distance(&query).unwrap(), 3);
    }

    #[test]
    fn test_min_distance_width_mismatch_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let mut catalog = Catalog::new(temp_dir.path());
        catalog.register(record("a.jpg", "A", Some("ffffffffffffffff")));

        let query = Fingerprint::from_hex("ffff").unwrap();
        assert!(matches!(
            catalog.min_distance(&query),
            Err(CatalogError::Hash(HashError::WidthMismatch { .. }))
        ));
    }

    #[test]
    fn test_add_image_with_known_fingerprint() {
        let temp_dir = TempDir::new().unwrap();
        let mut catalog = Catalog::new(temp_dir.path());
        let fp = Fingerprint::from_hex("0123456789abcdef").unwrap();
        let bytes = b"not decoded because the fingerprint is supplied";

        let added = catalog.add_image("new.jpg", bytes, Some(fp.clone())).unwrap();

        assert_eq!(catalog.len(), 1);
        assert_eq!(added.fingerprint, Some(fp));
        assert_eq!(added.content_hash, hash::content_hash(bytes));
        assert_eq!(added.size, bytes.len() as u64);
        assert_eq!(fs::read(temp_dir.path().join("new.jpg")).unwrap(), bytes);
        assert_eq!(catalog.changes(), 0);

        let reopened = Catalog::open(temp_dir.path());
        assert_eq!(reopened.get("new.jpg"), Some(&added));
    }

    #[test]
    fn test_add_image_computes_fingerprint() {
        let temp_dir = TempDir::new().unwrap();
        let mut catalog = Catalog::new(temp_dir.path());

        let added = catalog.add_image("pic.png", &png_bytes(2), None).unwrap();
        assert_eq!(added.fingerprint.unwrap().width(), 64);
    }

    #[test]
    fn test_add_image_rejects_bad_names() {
        let temp_dir = TempDir::new().unwrap();
        let mut catalog = Catalog::new(temp_dir.path());

        for name in ["../escape.jpg", "sub/dir.jpg", "notes.txt", ""] {
            assert!(matches!(
                catalog.add_image(name, b"x", None),
                Err(CatalogError::InvalidName { .. })
            ));
        }
        assert!(catalog.is_empty());
    }

    #[test]
    fn test_add_image_rejects_short_fingerprint() {
        let temp_dir = TempDir::new().unwrap();
        let mut catalog = Catalog::new(temp_dir.path());
        let short = Fingerprint::from_hex("00ff").unwrap();

        assert!(matches!(
            catalog.add_image("a.png", &png_bytes(1), Some(short)),
            Err(CatalogError::Hash(HashError::WidthMismatch { left: 64, right: 16 }))
        ));
        assert!(catalog.is_empty());
        assert!(!temp_dir.path().join("a.png").exists());
    }

    #[test]
    fn test_add_image_write_failure_registers_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let mut catalog = Catalog::new(temp_dir.path().join("missing"));

        let result = catalog.add_image("a.jpg", b"bytes", None);
        assert!(matches!(result, Err(CatalogError::Io { .. })));
        assert!(catalog.is_empty());
        assert_eq!(catalog.changes(), 0);
    }

    #[test]
    fn test_similar_pairs_below_threshold() {
        let temp_dir = TempDir::new().unwrap();
        let mut catalog = Catalog::new(temp_dir.path());
        catalog.register(record("a.jpg", "A", Some("0000000000000000")));
        catalog.register(record("b.jpg", "B", Some("0000000000000003")));
        catalog.register(record("c.jpg", "C", Some("00000000000000ff")));
        catalog.register(record("d.jpg", "D", None));

        let pairs = catalog.similar_pairs(5, 10_000).unwrap();
        assert_eq!(
            pairs,
            vec![SimilarPair {
                left: "a.jpg".into(),
                right: "b.jpg".into(),
                distance: 2,
            }]
        );

        // b and c differ in 6 bits
        let pairs = catalog.similar_pairs(7, 10_000).unwrap();
        assert_eq!(pairs.len(), 2);

        // Only the first record is sampled
        assert!(catalog.similar_pairs(5, 1).unwrap().is_empty());
    }
}
