pub mod analysis;
pub mod analyzer;
pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod hasher;
pub mod migration;
pub mod progress;
pub mod registry;
pub mod report;
pub mod rules;
pub mod scanner;
pub mod storage;
pub mod sync;

pub use analysis::{DeduplicationService, KeepStrategy, SimilarityIndex};
pub use analyzer::{Analysis, ContentAnalyzer, NoAnalyzer};
pub use config::AppConfig;
pub use engine::{SyncStatus, Vault};
pub use error::{Error, Result};
pub use hasher::ContentHash;
pub use migration::{MigrationService, TransferMode};
pub use progress::{ProgressReporter, SilentReporter};
pub use registry::LocationRegistry;
pub use report::RunSummary;
pub use rules::{Rule, RuleEngine};
pub use scanner::Scanner;
pub use sync::{ResolutionStrategy, SyncTracker};
