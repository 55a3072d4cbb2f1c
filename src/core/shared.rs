//! Thread-safe handle over a [`Catalog`], and the operations a browser front
//! end calls: classify an image it just saw, keep one the user chose to
//! save, and flush on shutdown.
//!
//! Reads (`observe`) share a read lock. Mutations take the write lock. Scans
//! and saves are additionally serialized by their own mutex: a scan hashes
//! with no catalog lock held, and a record added in that window would be
//! missing from its plan.

use crate::core::catalog::{Catalog, CatalogError, NO_MATCH};
use crate::core::hash::{Fingerprint, Fingerprinter};
use crate::core::scanner::{compute_scan, ScanProgress, ScanReport};
use crate::core::snapshot::ImageRecord;
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

/// Distance bands used to classify an observed image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProximityBands {
    /// Below this distance the image is treated as already saved.
    pub near: u32,
    /// Below this distance the image resembles a saved one.
    pub similar: u32,
}

impl Default for ProximityBands {
    fn default() -> Self {
        Self {
            near: 5,
            similar: 11,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Proximity {
    Duplicate,
    Similar,
    New,
}

impl Proximity {
    pub fn classify(distance: u32, bands: ProximityBands) -> Self {
        if distance < bands.near {
            Proximity::Duplicate
        } else if distance < bands.similar {
            Proximity::Similar
        } else {
            Proximity::New
        }
    }
}

/// Result of looking at an image without keeping it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub fingerprint: Fingerprint,
    /// Distance to the closest catalog image, or [`NO_MATCH`].
    pub distance: u32,
    pub proximity: Proximity,
}

impl Observation {
    pub fn has_match(&self) -> bool {
        self.distance != NO_MATCH
    }
}

#[derive(Clone)]
pub struct SharedCatalog {
    inner: Arc<RwLock<Catalog>>,
    scan_lock: Arc<Mutex<()>>,
    fingerprinter: Arc<Fingerprinter>,
    bands: ProximityBands,
}

impl SharedCatalog {
    pub fn new(catalog: Catalog) -> Self {
        Self::with_bands(catalog, ProximityBands::default())
    }

    pub fn with_bands(catalog: Catalog, bands: ProximityBands) -> Self {
        let fingerprinter = catalog.fingerprinter().clone();
        Self {
            inner: Arc::new(RwLock::new(catalog)),
            scan_lock: Arc::new(Mutex::new(())),
            fingerprinter,
            bands,
        }
    }

    /// Reconcile with the directory. Only one scan runs at a time; file
    /// hashing happens outside the catalog lock.
    pub fn scan_with_progress<F>(&self, progress: F) -> Result<ScanReport, CatalogError>
    where
        F: Fn(&ScanProgress) + Sync,
    {
        let _scanning = self.scan_lock.lock();

        self.inner.write().begin_scan();
        let plan = self.inner.read().plan_scan(&progress)?;
        let outcomes = compute_scan(plan.jobs, &self.fingerprinter, &progress);
        self.inner.write().finish_scan(plan.listing, outcomes, &progress)
    }

    pub fn scan(&self) -> Result<ScanReport, CatalogError> {
        self.scan_with_progress(|_| {})
    }

    /// Fingerprint `bytes` and measure them against the catalog.
    /// Nothing is stored.
    pub fn observe(&self, bytes: &[u8]) -> Result<Observation, CatalogError> {
        let fingerprint = self.fingerprinter.fingerprint(bytes)?;
        let distance = self.inner.read().min_distance(&fingerprint)?;
        let proximity = Proximity::classify(distance, self.bands);
        debug!("Observed image at distance {} ({:?})", distance, proximity);
        Ok(Observation {
            fingerprint,
            distance,
            proximity,
        })
    }

    /// Keep an image the user asked to save. Waits for a running scan.
    pub fn save(
        &self,
        name: &str,
        bytes: &[u8],
        fingerprint: Option<Fingerprint>,
    ) -> Result<ImageRecord, CatalogError> {
        let _scanning = self.scan_lock.lock();
        self.inner.write().add_image(name, bytes, fingerprint)
    }

    /// Flush pending changes before the process goes away.
    pub fn shutdown(&self) -> Result<bool, CatalogError> {
        let saved = self.inner.write().flush()?;
        if saved {
            info!("Flushed catalog on shutdown");
        }
        Ok(saved)
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Catalog> {
        self.inner.read()
    }

    pub fn bands(&self) -> ProximityBands {
        self.bands
    }
}
