// Directory reconciliation.
//
// A scan runs in three phases so the expensive part holds no borrow of the
// catalog:
//   1. plan:    enumerate the directory and decide per image what to compute
//   2. compute: read files and hash them in parallel (pure, no catalog access)
//   3. apply:   register, backfill, and finally prune, strictly in order
// Pruning only happens after every entry has been applied, only when the
// listing was complete, and only for names confirmed absent on disk.

use crate::core::catalog::{is_image_name, Catalog, CatalogError};
use crate::core::hash::{self, Fingerprint, Fingerprinter, HashError, FINGERPRINT_BITS};
use crate::core::snapshot::ImageRecord;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// How often (in directory entries) the scan logs a progress summary.
const PROGRESS_INTERVAL: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ScanPhase {
    Discovery,
    Hashing,
    Reconciling,
    Complete,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanProgress {
    pub phase: ScanPhase,
    pub processed: usize,
    pub total: usize,
}

/// Outcome of one scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    /// Directory entries looked at, images or not.
    pub entries: usize,
    /// Entries recognized as image files.
    pub images: usize,
    pub added: usize,
    pub backfilled: usize,
    pub removed: usize,
    /// Images that could not be read this time.
    pub skipped: usize,
    /// Images whose bytes could not be decoded for a fingerprint.
    pub undecodable: usize,
    /// Images whose content hash equals their base name.
    pub equal_hash: usize,
    pub duplicate_groups: usize,
    /// Modifications made by this scan.
    pub changes: usize,
    /// Whether the scan wrote the snapshot file.
    pub saved: bool,
}

#[derive(Debug)]
pub(crate) enum Work {
    /// Known name with a fingerprint; nothing to read.
    Known,
    /// Known name without a fingerprint.
    Backfill,
    /// Name not in the catalog yet.
    Register,
}

#[derive(Debug)]
pub(crate) struct ScanJob {
    /// 1-based position of the entry in the directory listing.
    entry: usize,
    name: String,
    path: PathBuf,
    work: Work,
}

/// What the directory listing covered.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Listing {
    pub(crate) entries: usize,
    /// False when some entry could not be read; nothing is pruned then.
    pub(crate) complete: bool,
}

#[derive(Debug)]
pub(crate) struct ScanPlan {
    pub(crate) listing: Listing,
    pub(crate) jobs: Vec<ScanJob>,
}

#[derive(Debug)]
enum Computed {
    Unchanged,
    Fingerprint(Result<Fingerprint, HashError>),
    Record {
        content_hash: String,
        size: u64,
        fingerprint: Result<Fingerprint, HashError>,
    },
    Unreadable(io::Error),
}

#[derive(Debug)]
pub(crate) struct ScanOutcome {
    entry: usize,
    name: String,
    computed: Computed,
}

impl Catalog {
    /// Reconcile the catalog with the directory and save if anything changed.
    pub fn scan(&mut self) -> Result<ScanReport, CatalogError> {
        self.scan_with_progress(|_| {})
    }

    pub fn scan_with_progress<F>(&mut self, progress: F) -> Result<ScanReport, CatalogError>
    where
        F: Fn(&ScanProgress) + Sync,
    {
        self.begin_scan();
        let plan = self.plan_scan(&progress)?;
        let outcomes = compute_scan(plan.jobs, &self.fingerprinter, &progress);
        self.finish_scan(plan.listing, outcomes, &progress)
    }

    /// Reset the counters and reload the snapshot. When there is no usable
    /// snapshot the in-memory records are the starting point.
    pub(crate) fn begin_scan(&mut self) {
        info!("Scanning {}", self.dir.display());
        self.changes = 0;
        self.equal_hash = 0;

        if !self.load() {
            let records: Vec<ImageRecord> = std::mem::take(&mut self.records).into_values().collect();
            self.index.clear();
            for record in records {
                self.register(record);
            }
        }
    }

    /// List the directory and decide what each image needs.
    pub(crate) fn plan_scan<F>(&self, progress: &F) -> Result<ScanPlan, CatalogError>
    where
        F: Fn(&ScanProgress) + Sync,
    {
        progress(&ScanProgress {
            phase: ScanPhase::Discovery,
            processed: 0,
            total: 0,
        });

        if let Err(source) = fs::read_dir(&self.dir) {
            return Err(CatalogError::Io {
                path: self.dir.clone(),
                source,
            });
        }

        let mut plan = ScanPlan {
            listing: Listing {
                entries: 0,
                complete: true,
            },
            jobs: Vec::new(),
        };

        for entry in WalkDir::new(&self.dir)
            .min_depth(1)
            .max_depth(1)
            .follow_links(false)
            .sort_by_file_name()
        {
            plan.listing.entries += 1;
            let ordinal = plan.listing.entries;
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping unreadable entry: {}", e);
                    plan.listing.complete = false;
                    continue;
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                warn!("Skipping non UTF-8 file name {:?}", entry.file_name());
                continue;
            };
            if !is_image_name(&name) {
                continue;
            }

            let work = match self.records.get(&name) {
                Some(record) => {
                    if let Ok(meta) = entry.metadata() {
                        if record.size != 0 && meta.len() != record.size {
                            warn!(
                                "{} changed size ({} -> {} bytes), keeping recorded hash",
                                name,
                                record.size,
                                meta.len()
                            );
                        }
                    }
                    if has_full_fingerprint(record) {
                        Work::Known
                    } else {
                        Work::Backfill
                    }
                }
                None => Work::Register,
            };

            plan.jobs.push(ScanJob {
                entry: ordinal,
                name,
                path: entry.into_path(),
                work,
            });
        }

        debug!(
            "Planned {} images out of {} entries",
            plan.jobs.len(),
            plan.listing.entries
        );
        Ok(plan)
    }

    /// Apply computed results, prune missing files, and save if needed.
    pub(crate) fn finish_scan<F>(
        &mut self,
        listing: Listing,
        outcomes: Vec<ScanOutcome>,
        progress: &F,
    ) -> Result<ScanReport, CatalogError>
    where
        F: Fn(&ScanProgress) + Sync,
    {
        let entries = listing.entries;
        let total = outcomes.len();
        let mut last_entry = 0;
        let mut report = ScanReport {
            entries,
            images: total,
            ..ScanReport::default()
        };
        let mut present: HashSet<String> = HashSet::with_capacity(total);

        for (i, outcome) in outcomes.into_iter().enumerate() {
            let ScanOutcome {
                entry,
                name,
                computed,
            } = outcome;

            match computed {
                Computed::Unchanged => {}
                Computed::Fingerprint(Ok(fp)) => self.backfill(&name, fp, &mut report),
                Computed::Fingerprint(Err(e)) => {
                    warn!("Cannot fingerprint {}: {}", name, e);
                    report.undecodable += 1;
                }
                Computed::Record {
                    content_hash,
                    size,
                    fingerprint,
                } => {
                    if self.records.contains_key(&name) {
                        // Registered by someone else since the plan was made
                        if let Ok(fp) = fingerprint {
                            self.backfill(&name, fp, &mut report);
                        }
                    } else {
                        let fingerprint = match fingerprint {
                            Ok(fp) => Some(fp),
                            Err(e) => {
                                warn!("Cannot fingerprint {}: {}", name, e);
                                report.undecodable += 1;
                                None
                            }
                        };
                        debug!("Registering {}", name);
                        self.register(ImageRecord {
                            name: name.clone(),
                            content_hash,
                            fingerprint,
                            size,
                        });
                        self.changes += 1;
                        report.added += 1;
                    }
                }
                Computed::Unreadable(e) => {
                    warn!("Cannot read {}: {}", name, e);
                    report.skipped += 1;
                }
            }

            // A known file that could not be read still exists on disk
            if let Some(record) = self.records.get(&name) {
                if name.split('.').next() == Some(record.content_hash.as_str()) {
                    self.equal_hash += 1;
                }
                present.insert(name);
            }

            if summary_due(last_entry, entry) {
                self.log_summary();
            }
            last_entry = entry;

            let processed = i + 1;
            progress(&ScanProgress {
                phase: ScanPhase::Reconciling,
                processed,
                total,
            });
        }

        self.log_summary();

        let missing = self.missing_records(&present, listing);
        for name in &missing {
            debug!("Removing {}: file is gone", name);
            self.unregister(name);
            self.changes += 1;
        }
        report.removed = missing.len();
        if report.removed > 0 {
            info!("Removed {} missing files", report.removed);
        }

        info!(
            "Total number of files: {}, images: {}/{} equal to hash",
            entries,
            self.equal_hash,
            self.records.len()
        );
        info!("Added {} images", report.added);

        report.equal_hash = self.equal_hash;
        report.duplicate_groups = self.index.group_count();
        report.changes = self.changes;
        report.saved = self.flush()?;

        progress(&ScanProgress {
            phase: ScanPhase::Complete,
            processed: total,
            total,
        });
        Ok(report)
    }

    /// Records not seen by this scan whose files are confirmed gone.
    fn missing_records(&self, present: &HashSet<String>, listing: Listing) -> Vec<String> {
        let unseen = self.records.keys().filter(|name| !present.contains(*name));
        if !listing.complete {
            let kept = unseen.count();
            if kept > 0 {
                warn!("Directory listing was incomplete, not pruning {} unseen records", kept);
            }
            return Vec::new();
        }

        unseen
            .filter(|name| match self.dir.join(name).try_exists() {
                Ok(false) => true,
                Ok(true) => {
                    debug!("Keeping {}: file appeared during the scan", name);
                    false
                }
                Err(e) => {
                    warn!("Keeping {}: cannot check the file: {}", name, e);
                    false
                }
            })
            .cloned()
            .collect()
    }

    fn backfill(&mut self, name: &str, fp: Fingerprint, report: &mut ScanReport) {
        if let Some(record) = self.records.get_mut(name) {
            if !has_full_fingerprint(record) {
                debug!("Adding fingerprint to {}", name);
                record.fingerprint = Some(fp);
                self.changes += 1;
                report.backfilled += 1;
            }
        }
    }

    fn log_summary(&self) {
        info!(
            "{} files, {} duplicate entries, {} changes",
            self.records.len(),
            self.index.group_count(),
            self.changes
        );
    }
}

fn has_full_fingerprint(record: &ImageRecord) -> bool {
    record
        .fingerprint
        .as_ref()
        .is_some_and(|fp| fp.width() == FINGERPRINT_BITS)
}

/// True when moving from entry `previous` to entry `current` passes a
/// multiple of [`PROGRESS_INTERVAL`].
fn summary_due(previous: usize, current: usize) -> bool {
    current / PROGRESS_INTERVAL > previous / PROGRESS_INTERVAL
}

/// Read and hash every job in parallel. Output order matches `jobs`.
pub(crate) fn compute_scan<F>(
    jobs: Vec<ScanJob>,
    fingerprinter: &Fingerprinter,
    progress: &F,
) -> Vec<ScanOutcome>
where
    F: Fn(&ScanProgress) + Sync,
{
    let total = jobs.len();
    let done = AtomicUsize::new(0);

    jobs.into_par_iter()
        .map(|job| {
            let computed = match job.work {
                Work::Known => Computed::Unchanged,
                Work::Backfill => match fs::read(&job.path) {
                    Ok(bytes) => Computed::Fingerprint(fingerprinter.fingerprint(&bytes)),
                    Err(e) => Computed::Unreadable(e),
                },
                Work::Register => match fs::read(&job.path) {
                    Ok(bytes) => Computed::Record {
                        content_hash: hash::content_hash(&bytes),
                        size: bytes.len() as u64,
                        fingerprint: fingerprinter.fingerprint(&bytes),
                    },
                    Err(e) => Computed::Unreadable(e),
                },
            };

            let processed = done.fetch_add(1, Ordering::Relaxed) + 1;
            progress(&ScanProgress {
                phase: ScanPhase::Hashing,
                processed,
                total,
            });

            ScanOutcome {
                entry: job.entry,
                name: job.name,
                computed,
            }
        })
        .collect()
}
