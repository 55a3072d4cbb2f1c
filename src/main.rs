use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use dupecat::{Config, Proximity, ScanPhase, ScanProgress, ScanReport, SharedCatalog, NO_MATCH};
use indicatif::{ProgressBar, ProgressStyle};
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::Level;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "dupecat", version, about = "Catalog an image directory and find duplicates")]
struct Cli {
    /// Configuration file
    #[arg(short, long, value_name = "FILE", default_value = "dupecat.json", global = true)]
    config: PathBuf,

    /// Image directory (overrides `mediaDir` from the configuration)
    #[arg(short, long, value_name = "DIR", global = true)]
    dir: Option<PathBuf>,

    /// More log output (repeatable)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Less log output (repeatable)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    quiet: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Reconcile the catalog with the directory
    Scan,

    /// List groups of byte-identical images
    Duplicates,

    /// List pairs of visually similar images
    Similar {
        /// Report pairs closer than this many bits
        #[arg(short, long)]
        threshold: Option<u32>,
        /// Compare at most this many images
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Show how close an image is to the catalog, without adding it
    Distance {
        /// Image file to measure
        file: PathBuf,
    },

    /// Copy an image into the directory and record it
    Add {
        /// Image file to add
        file: PathBuf,
        /// Name to store it under (default: the file's own name)
        #[arg(short, long)]
        name: Option<String>,
    },
}

fn init_tracing(verbose: u8, quiet: u8) {
    let level = match (1 + verbose).saturating_sub(quiet) {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let env_filter = EnvFilter::from_default_env().add_directive(level.into());

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let mut config = Config::load(&cli.config);
    if let Some(dir) = cli.dir {
        config.media_dir = dir;
    }
    fs::create_dir_all(&config.media_dir)
        .with_context(|| format!("Failed to create directory {:?}", config.media_dir))?;

    println!("▶ Catalog directory: {}", config.media_dir.display());
    let shared = SharedCatalog::with_bands(config.open_catalog(), config.proximity_bands());

    let report = benchmark("scan", || scan_with_bar(&shared))?;

    let result = run(&cli.command, &config, &shared, &report);

    // Flush even when the command failed
    shared
        .shutdown()
        .context("Failed to save catalog on shutdown")?;
    result
}

fn run(command: &Commands, config: &Config, shared: &SharedCatalog, report: &ScanReport) -> Result<()> {
    match command {
        Commands::Scan => print_report(report),

        Commands::Duplicates => {
            let catalog = shared.read();
            let groups = catalog.duplicate_groups();
            if groups.is_empty() {
                println!("No duplicates found.");
            } else {
                println!("Found {} duplicate group(s):", groups.len());
                for (i, group) in groups.iter().enumerate() {
                    println!(" Group {} ({}):", i + 1, group.content_hash);
                    for record in &group.records {
                        println!("   ▶ {} ({} bytes)", record.name, record.size);
                    }
                }
            }
        }

        Commands::Similar { threshold, limit } => {
            let threshold = threshold.unwrap_or(config.similarity_threshold);
            let limit = limit.unwrap_or(config.sweep_limit);
            let pairs = benchmark("similarity sweep", || {
                shared.read().similar_pairs(threshold, limit)
            })?;
            if pairs.is_empty() {
                println!("No similar images below distance {}.", threshold);
            } else {
                println!("Found {} similar pair(s):", pairs.len());
                for pair in &pairs {
                    println!("   ≈ {} ↔ {} (distance {})", pair.left, pair.right, pair.distance);
                }
            }
        }

        Commands::Distance { file } => {
            let bytes = fs::read(file).with_context(|| format!("Failed to read {:?}", file))?;
            let seen = shared
                .observe(&bytes)
                .with_context(|| format!("Failed to fingerprint {:?}", file))?;
            let label = match seen.proximity {
                Proximity::Duplicate => "🟢 already in catalog",
                Proximity::Similar => "🔵 similar to a catalog image",
                Proximity::New => "🔴 new",
            };
            if seen.distance == NO_MATCH {
                println!("{}: no fingerprinted images to compare ({})", file.display(), label);
            } else {
                println!("{}: distance {} ({})", file.display(), seen.distance, label);
            }
            println!("   fingerprint {}", seen.fingerprint);
        }

        Commands::Add { file, name } => {
            let name = match name {
                Some(name) => name.clone(),
                None => file
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(str::to_string)
                    .with_context(|| format!("Cannot take a name from {:?}", file))?,
            };
            let bytes = fs::read(file).with_context(|| format!("Failed to read {:?}", file))?;
            let record = shared
                .save(&name, &bytes, None)
                .with_context(|| format!("Failed to add {}", name))?;
            println!("✅ Added {} ({} bytes, hash {})", record.name, record.size, record.content_hash);
            let catalog = shared.read();
            if let Some(group) = catalog.index().group(&record.content_hash) {
                let others: Vec<&str> = group
                    .iter()
                    .map(String::as_str)
                    .filter(|n| *n != record.name)
                    .collect();
                println!("   ⚠️  Identical to: {}", others.join(", "));
            }
        }
    }

    Ok(())
}

fn scan_with_bar(shared: &SharedCatalog) -> Result<ScanReport> {
    let bar = ProgressBar::new_spinner();
    bar.set_style(ProgressStyle::with_template(
        "{spinner:.green} {msg} [{bar:40.cyan/blue}] {pos}/{len}",
    )?);
    bar.enable_steady_tick(Duration::from_millis(100));

    let report = shared.scan_with_progress(|progress: &ScanProgress| match progress.phase {
        ScanPhase::Discovery => bar.set_message("Scanning for images…"),
        ScanPhase::Hashing => {
            bar.set_message("Hashing");
            bar.set_length(progress.total as u64);
            bar.set_position(progress.processed as u64);
        }
        ScanPhase::Reconciling => {
            bar.set_message("Reconciling");
            bar.set_position(progress.processed as u64);
        }
        ScanPhase::Complete => bar.finish_with_message("Scan complete"),
    });

    if report.is_err() {
        bar.abandon();
    }
    report.context("Scan failed")
}

fn print_report(report: &ScanReport) {
    println!("📁 {} entries, {} images", report.entries, report.images);
    println!("   ➕ added       {}", report.added);
    println!("   🔎 backfilled  {}", report.backfilled);
    println!("   🗑️  removed     {}", report.removed);
    if report.skipped > 0 || report.undecodable > 0 {
        println!(
            "   ⚠️  {} unreadable, {} without fingerprint",
            report.skipped, report.undecodable
        );
    }
    println!("   #️⃣  {} named by their hash", report.equal_hash);
    println!("   👯 {} duplicate group(s)", report.duplicate_groups);
    if report.saved {
        println!("✅ Saved {} change(s)", report.changes);
    } else {
        println!("✅ Catalog up to date");
    }
}

/// Run `f()`, print how long it took (with `label`), and return its result.
fn benchmark<T, F: FnOnce() -> T>(label: &str, f: F) -> T {
    let start = Instant::now();
    let result = f();
    println!("⏱ {} took {:.2?}", label, start.elapsed());
    result
}
