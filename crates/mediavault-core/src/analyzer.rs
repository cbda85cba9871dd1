//! Seam for the external content-analysis collaborator.

use crate::hasher::ContentHash;
use crate::storage::models::Location;
use std::collections::BTreeSet;

/// Enrichment produced by an analysis model for one asset.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Analysis {
    pub tags: BTreeSet<String>,
    /// 64-bit perceptual fingerprint for images and video keyframes.
    pub perceptual_hash: Option<u64>,
    pub quality_score: Option<f64>,
}

/// Black-box analysis of a stored file.
///
/// Called once per newly discovered asset, after its content hash has been
/// computed. Returning `None` means analysis is unavailable; rules over
/// tags, quality or similarity then simply do not match that asset.
pub trait ContentAnalyzer: Send + Sync {
    fn analyze(
        &self,
        location: &Location,
        relative_path: &str,
        content_hash: &ContentHash,
    ) -> Option<Analysis>;
}

/// Analyzer used when no model is configured.
pub struct NoAnalyzer;

impl ContentAnalyzer for NoAnalyzer {
    fn analyze(&self, _: &Location, _: &str, _: &ContentHash) -> Option<Analysis> {
        None
    }
}

impl<F> ContentAnalyzer for F
where
    F: Fn(&Location, &str, &ContentHash) -> Option<Analysis> + Send + Sync,
{
    fn analyze(
        &self,
        location: &Location,
        relative_path: &str,
        content_hash: &ContentHash,
    ) -> Option<Analysis> {
        self(location, relative_path, content_hash)
    }
}
