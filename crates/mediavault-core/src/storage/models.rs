use crate::hasher::ContentHash;
use crate::rules::Rule;
use crate::sync::ResolutionStrategy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

pub(crate) fn from_epoch(secs: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(secs, 0).unwrap_or_default()
}

pub(crate) fn to_epoch(at: DateTime<Utc>) -> i64 {
    at.timestamp()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LocationKind {
    Local,
    ObjectStore,
    Network,
}

impl LocationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LocationKind::Local => "local",
            LocationKind::ObjectStore => "object-store",
            LocationKind::Network => "network",
        }
    }
}

impl FromStr for LocationKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(LocationKind::Local),
            "object-store" | "object_store" | "s3" | "gcs" => Ok(LocationKind::ObjectStore),
            "network" => Ok(LocationKind::Network),
            other => Err(crate::Error::InvalidConfig(format!(
                "unknown location kind '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for LocationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declarative description of a storage location, as found in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationSpec {
    pub name: String,
    pub kind: LocationKind,
    /// Directory path for local/network locations, `bucket[/prefix]` for object stores.
    pub root: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub default: bool,
}

/// A registered location. `id` doubles as registration order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Location {
    pub id: i64,
    pub name: String,
    pub kind: LocationKind,
    pub root: String,
    pub priority: i64,
    pub rules: Vec<Rule>,
    pub is_default: bool,
    pub last_scanned_at: Option<DateTime<Utc>>,
    pub scan_generation: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Image,
    Video,
    Audio,
    Document,
    Other,
}

impl MediaType {
    pub fn from_path(path: &str) -> Self {
        let ext = path
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "jpg" | "jpeg" | "png" | "gif" | "bmp" | "webp" | "tif" | "tiff" | "heic" | "avif"
            | "raw" | "cr2" | "nef" | "dng" => MediaType::Image,
            "mp4" | "mov" | "mkv" | "avi" | "webm" | "m4v" | "wmv" | "mts" => MediaType::Video,
            "mp3" | "wav" | "flac" | "ogg" | "m4a" | "aac" | "opus" | "aiff" => MediaType::Audio,
            "pdf" | "txt" | "md" | "doc" | "docx" | "odt" | "rtf" | "json" | "csv" => {
                MediaType::Document
            }
            _ => MediaType::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Image => "image",
            MediaType::Video => "video",
            MediaType::Audio => "audio",
            MediaType::Document => "document",
            MediaType::Other => "other",
        }
    }
}

impl FromStr for MediaType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "image" => Ok(MediaType::Image),
            "video" => Ok(MediaType::Video),
            "audio" => Ok(MediaType::Audio),
            "document" => Ok(MediaType::Document),
            "other" => Ok(MediaType::Other),
            other => Err(crate::Error::InvalidConfig(format!(
                "unknown media type '{}'",
                other
            ))),
        }
    }
}

/// A unique piece of content, independent of where it is stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Asset {
    pub content_hash: ContentHash,
    pub media_type: MediaType,
    pub size: u64,
    pub created_at: Option<DateTime<Utc>>,
    pub first_seen_at: DateTime<Utc>,
    pub quality_score: Option<f64>,
    pub tags: BTreeSet<String>,
    pub perceptual_hash: Option<u64>,
}

impl Asset {
    /// Whole days since creation (falling back to first sighting).
    pub fn age_days(&self, now: DateTime<Utc>) -> i64 {
        let born = self.created_at.unwrap_or(self.first_seen_at);
        (now - born).num_days()
    }
}

/// A sighting of an asset at a path inside a location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub id: i64,
    pub content_hash: ContentHash,
    pub location: String,
    pub path: String,
    pub size: u64,
    pub mtime: i64,
    pub partial_hash: Option<u64>,
    pub verified_at: DateTime<Utc>,
    pub missing_since: Option<DateTime<Utc>>,
    /// Hash reused from an earlier scan because path, size and mtime matched.
    pub quick_identity: bool,
    pub needs_verify: bool,
    pub canonical: bool,
}

impl Observation {
    pub fn is_live(&self) -> bool {
        self.missing_since.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObservationInput {
    pub content_hash: ContentHash,
    pub location: String,
    pub path: String,
    pub size: u64,
    pub mtime: i64,
    pub partial_hash: Option<u64>,
    pub quick_identity: bool,
    /// The identity may not match what is stored now; a later `verify`
    /// rehashes the copy.
    pub needs_verify: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Refreshed,
    /// Same content and size, new mtime.
    Touched,
    /// Same content hash at a different size, as when embedded metadata of a
    /// canonically hashed format was rewritten.
    SizeMismatch,
    /// The path previously held different content.
    Replaced { previous: ContentHash },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictReason {
    SizeDivergence,
    MtimeDivergence,
    IdentityDrift,
}

impl ConflictReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictReason::SizeDivergence => "size_divergence",
            ConflictReason::MtimeDivergence => "mtime_divergence",
            ConflictReason::IdentityDrift => "identity_drift",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "mtime_divergence" => ConflictReason::MtimeDivergence,
            "identity_drift" => ConflictReason::IdentityDrift,
            _ => ConflictReason::SizeDivergence,
        }
    }
}

/// Where a resolved conflict settled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservationRef {
    pub location: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConflictRecord {
    pub id: i64,
    pub content_hash: ContentHash,
    pub reason: ConflictReason,
    pub observations: Vec<Observation>,
    pub detected_at: DateTime<Utc>,
    pub strategy: Option<ResolutionStrategy>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub winner: Option<ObservationRef>,
}

impl ConflictRecord {
    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchKind {
    /// Identical content hashes.
    Exact,
    /// Perceptual hashes within the similarity threshold.
    Similar,
}

impl MatchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchKind::Exact => "exact",
            MatchKind::Similar => "similar",
        }
    }
}

/// One copy taking part in a duplicate group.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupMember {
    pub content_hash: ContentHash,
    pub location: String,
    pub path: String,
    pub size: u64,
    pub mtime: i64,
    pub location_priority: i64,
    pub location_order: i64,
    /// Hamming distance to the group's anchor asset; 0 for exact copies.
    pub distance: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateGroup {
    pub id: i64,
    pub run_id: i64,
    pub kind: MatchKind,
    pub members: Vec<GroupMember>,
    pub representative: usize,
}

impl DuplicateGroup {
    pub fn wasted_bytes(&self) -> u64 {
        let total: u64 = self.members.iter().map(|m| m.size).sum();
        total.saturating_sub(self.members[self.representative].size)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DedupRun {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub threshold: u32,
    pub group_count: i64,
}

/// A persisted removal decision, mirroring one entry of a removal plan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemovalEntry {
    pub id: i64,
    pub group_id: i64,
    pub content_hash: ContentHash,
    pub location: String,
    pub path: String,
    pub size: u64,
    pub strategy: String,
    pub planned_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
    pub execution_result: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub locations: i64,
    pub assets: i64,
    pub live_observations: i64,
    pub missing_observations: i64,
    pub open_conflicts: i64,
    pub resolved_conflicts: i64,
}

/// Filter for `LocationRegistry::query`. Every populated group must hold.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssetQuery {
    /// Assets must carry all of these tags.
    pub tags: Vec<String>,
    /// Inclusive bounds on creation time (first sighting when unknown).
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub min_quality: Option<f64>,
    pub max_quality: Option<f64>,
    /// Any of these media types.
    pub media_types: Vec<MediaType>,
    /// Only assets with a live copy in this location.
    pub location: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_media_type_from_path() {
        assert_eq!(MediaType::from_path("a/b/IMG_001.JPG"), MediaType::Image);
        assert_eq!(MediaType::from_path("clip.mov"), MediaType::Video);
        assert_eq!(MediaType::from_path("song.flac"), MediaType::Audio);
        assert_eq!(MediaType::from_path("notes.md"), MediaType::Document);
        assert_eq!(MediaType::from_path("Makefile"), MediaType::Other);
    }

    #[test]
    fn test_location_kind_round_trip() {
        for kind in [LocationKind::Local, LocationKind::ObjectStore, LocationKind::Network] {
            assert_eq!(kind.as_str().parse::<LocationKind>().unwrap(), kind);
        }
        assert!("tape".parse::<LocationKind>().is_err());
    }

    #[test]
    fn test_age_prefers_created_at() {
        let now = from_epoch(1_700_000_000);
        let asset = Asset {
            content_hash: ContentHash::from_stored("ab".repeat(32)),
            media_type: MediaType::Image,
            size: 1,
            created_at: Some(now - Duration::days(45)),
            first_seen_at: now - Duration::days(2),
            quality_score: None,
            tags: BTreeSet::new(),
            perceptual_hash: None,
        };
        assert_eq!(asset.age_days(now), 45);
    }
}
