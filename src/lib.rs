//! Image directory catalog with exact and near-duplicate detection.
//!
//! Each managed directory keeps an `info.json` snapshot of the images it
//! holds: file name, MD5 content hash, 64-bit perceptual hash and size.
//! A scan reconciles that snapshot with the files on disk; queries answer
//! which images are byte-identical and how close a new image is to any
//! image already kept.

pub mod config;
pub mod core;

pub use config::Config;
pub use crate::core::catalog::{Catalog, CatalogError, DuplicateGroup, SimilarPair, NO_MATCH};
pub use crate::core::hash::{Fingerprint, Fingerprinter, HashError};
pub use crate::core::scanner::{ScanPhase, ScanProgress, ScanReport};
pub use crate::core::shared::{Observation, Proximity, ProximityBands, SharedCatalog};
pub use crate::core::snapshot::ImageRecord;
