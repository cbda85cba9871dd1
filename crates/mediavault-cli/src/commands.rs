use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "mediavault")]
#[command(about = "Track, place and deduplicate media across storage locations", long_about = None)]
pub struct Cli {
    /// Configuration file to load instead of ./MediaVault.toml
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Print results as JSON instead of text
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Register a storage location in the registry
    RegisterLocation {
        name: String,
        /// Directory path, or bucket[/prefix] for object stores
        root: String,
        /// local, network or object-store
        #[arg(long, default_value = "local")]
        kind: String,
        #[arg(long, default_value_t = 0)]
        priority: i64,
        /// Fallback location for assets no rule places
        #[arg(long)]
        default: bool,
        /// Placement rule as JSON, e.g. '{"max_age_days": 30}'. Repeatable.
        #[arg(long = "rule")]
        rules: Vec<String>,
    },
    /// Scan one location, or every registered location
    Scan {
        /// Location name; omit or pass "all" for every location
        location: Option<String>,
    },
    /// Move or copy assets to the locations their rules select
    Migrate {
        #[arg(long)]
        dry_run: bool,
    },
    /// Run migrations on the configured interval until Enter is pressed
    Schedule,
    /// Detect conflicts between copies and show registry counts
    SyncStatus,
    /// Settle the open conflicts of one asset
    ResolveConflict {
        hash: String,
        /// newest-wins, largest-wins, primary-wins or manual
        #[arg(long)]
        strategy: Option<String>,
    },
    /// Re-check copies against their bytes: one asset, or every flagged copy
    Verify { hash: Option<String> },
    /// Group exact and near-duplicate assets
    DedupReport {
        /// Largest Hamming distance still counted as similar
        #[arg(long)]
        threshold: Option<u32>,
    },
    /// Keep one copy per exact duplicate group and remove the others
    DedupRemove {
        /// keep-in-primary-location, keep-largest or keep-newest
        #[arg(long, default_value = "keep-in-primary-location")]
        strategy: String,
        #[arg(long)]
        dry_run: bool,
    },
    /// Forget copies missing for longer than the grace period
    PurgeMissing,
    /// Print configuration values
    PrintConfig,
}
