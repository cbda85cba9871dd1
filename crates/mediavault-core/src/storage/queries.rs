use super::models::*;
use super::sqlite::Database;
use crate::analyzer::Analysis;
use crate::error::{Error, Result};
use crate::hasher::ContentHash;
use crate::rules::Rule;
use chrono::{DateTime, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::collections::BTreeSet;
use tracing::debug;

const LOCATION_COLUMNS: &str =
    "id, name, kind, root, priority, rules, is_default, last_scanned_at, scan_generation";

pub(crate) const OBSERVATION_COLUMNS: &str =
    "o.id, o.content_hash, l.name, o.path, o.size, o.mtime, o.partial_hash, \
     o.verified_at, o.missing_since, o.quick_identity, o.needs_verify, o.canonical";

const ASSET_COLUMNS: &str =
    "a.content_hash, a.media_type, a.size, a.created_at, a.first_seen_at, \
     a.quality_score, a.perceptual_hash";

fn conversion_error(
    idx: usize,
    e: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn location_from_row(row: &Row) -> rusqlite::Result<Location> {
    let kind: String = row.get(2)?;
    let rules: String = row.get(5)?;
    Ok(Location {
        id: row.get(0)?,
        name: row.get(1)?,
        kind: kind.parse().map_err(|e| conversion_error(2, e))?,
        root: row.get(3)?,
        priority: row.get(4)?,
        rules: serde_json::from_str::<Vec<Rule>>(&rules).map_err(|e| conversion_error(5, e))?,
        is_default: row.get(6)?,
        last_scanned_at: row.get::<_, Option<i64>>(7)?.map(from_epoch),
        scan_generation: row.get(8)?,
    })
}

pub(crate) fn observation_from_row(row: &Row) -> rusqlite::Result<Observation> {
    Ok(Observation {
        id: row.get(0)?,
        content_hash: ContentHash::from_stored(row.get(1)?),
        location: row.get(2)?,
        path: row.get(3)?,
        size: row.get::<_, i64>(4)? as u64,
        mtime: row.get(5)?,
        partial_hash: row.get::<_, Option<i64>>(6)?.map(|h| h as u64),
        verified_at: from_epoch(row.get(7)?),
        missing_since: row.get::<_, Option<i64>>(8)?.map(from_epoch),
        quick_identity: row.get(9)?,
        needs_verify: row.get(10)?,
        canonical: row.get(11)?,
    })
}

fn asset_from_row(row: &Row) -> rusqlite::Result<Asset> {
    let media_type: String = row.get(1)?;
    Ok(Asset {
        content_hash: ContentHash::from_stored(row.get(0)?),
        media_type: media_type.parse().unwrap_or(MediaType::Other),
        size: row.get::<_, i64>(2)? as u64,
        created_at: row.get::<_, Option<i64>>(3)?.map(from_epoch),
        first_seen_at: from_epoch(row.get(4)?),
        quality_score: row.get(5)?,
        tags: BTreeSet::new(),
        perceptual_hash: row.get::<_, Option<i64>>(6)?.map(|h| h as u64),
    })
}

fn location_id(conn: &Connection, name: &str) -> Result<i64> {
    conn.query_row(
        "SELECT id FROM location WHERE name = ?1",
        params![name],
        |row| row.get(0),
    )
    .optional()?
    .ok_or_else(|| Error::UnknownLocation(name.to_string()))
}

/// Insert or refresh one observation inside an open transaction.
fn upsert_in(
    conn: &Connection,
    input: &ObservationInput,
    now: DateTime<Utc>,
) -> Result<UpsertOutcome> {
    let loc_id = location_id(conn, &input.location)?;
    let hash = input.content_hash.as_str();
    let now = to_epoch(now);
    let size = input.size as i64;
    let partial = input.partial_hash.map(|h| h as i64);

    conn.execute(
        "INSERT INTO asset (content_hash, media_type, size, created_at, first_seen_at) \
         VALUES (?1, ?2, ?3, ?4, ?5) \
         ON CONFLICT(content_hash) DO NOTHING",
        params![
            hash,
            MediaType::from_path(&input.path).as_str(),
            size,
            input.mtime,
            now
        ],
    )?;

    let previous: Option<String> = conn
        .query_row(
            "SELECT content_hash FROM observation \
             WHERE location_id = ?1 AND path = ?2 AND content_hash != ?3 \
               AND missing_since IS NULL LIMIT 1",
            params![loc_id, input.path, hash],
            |row| row.get(0),
        )
        .optional()?;
    if previous.is_some() {
        // The old content is no longer at this path; keep the row as history.
        conn.execute(
            "UPDATE observation SET missing_since = ?1, canonical = 0 \
             WHERE location_id = ?2 AND path = ?3 AND content_hash != ?4 \
               AND missing_since IS NULL",
            params![now, loc_id, input.path, hash],
        )?;
    }

    let existing: Option<(i64, i64, i64)> = conn
        .query_row(
            "SELECT id, size, mtime FROM observation \
             WHERE content_hash = ?1 AND location_id = ?2 AND path = ?3",
            params![hash, loc_id, input.path],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;

    let outcome = match existing {
        None => {
            conn.execute(
                "INSERT INTO observation \
                 (content_hash, location_id, path, size, mtime, partial_hash, verified_at, \
                  seen_generation, quick_identity, needs_verify) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, \
                  (SELECT scan_generation FROM location WHERE id = ?2), ?8, ?9)",
                params![
                    hash,
                    loc_id,
                    input.path,
                    size,
                    input.mtime,
                    partial,
                    now,
                    input.quick_identity,
                    input.needs_verify
                ],
            )?;
            match previous {
                Some(previous) => UpsertOutcome::Replaced {
                    previous: ContentHash::from_stored(previous),
                },
                None => UpsertOutcome::Inserted,
            }
        }
        Some((id, old_size, old_mtime)) => {
            let size_changed = old_size != size;
            conn.execute(
                "UPDATE observation SET size = ?1, mtime = ?2, \
                    partial_hash = COALESCE(?3, partial_hash), verified_at = ?4, \
                    seen_generation = (SELECT scan_generation FROM location WHERE id = ?5), \
                    missing_since = NULL, quick_identity = ?6, needs_verify = ?7 \
                 WHERE id = ?8",
                params![
                    size,
                    input.mtime,
                    partial,
                    now,
                    loc_id,
                    input.quick_identity,
                    input.needs_verify,
                    id
                ],
            )?;
            match previous {
                Some(previous) => UpsertOutcome::Replaced {
                    previous: ContentHash::from_stored(previous),
                },
                None if size_changed => UpsertOutcome::SizeMismatch,
                None if old_mtime != input.mtime => UpsertOutcome::Touched,
                None => UpsertOutcome::Refreshed,
            }
        }
    };
    Ok(outcome)
}

impl Database {
    // ── Locations ────────────────────────────────────────────────

    pub fn insert_location(&self, spec: &LocationSpec) -> Result<Location> {
        let exists: bool = self.connection().query_row(
            "SELECT EXISTS(SELECT 1 FROM location WHERE name = ?1)",
            params![spec.name],
            |row| row.get(0),
        )?;
        if exists {
            return Err(Error::DuplicateLocation(spec.name.clone()));
        }
        self.connection().execute(
            "INSERT INTO location (name, kind, root, priority, rules, is_default) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                spec.name,
                spec.kind.as_str(),
                spec.root,
                spec.priority,
                serde_json::to_string(&spec.rules)?,
                spec.default
            ],
        )?;
        debug!("Registered location '{}' ({})", spec.name, spec.kind);
        self.location(&spec.name)?
            .ok_or_else(|| Error::UnknownLocation(spec.name.clone()))
    }

    /// Update the mutable parts of a location: priority, rules and default flag.
    pub fn update_location(&self, spec: &LocationSpec) -> Result<Location> {
        let changed = self.connection().execute(
            "UPDATE location SET priority = ?1, rules = ?2, is_default = ?3 WHERE name = ?4",
            params![
                spec.priority,
                serde_json::to_string(&spec.rules)?,
                spec.default,
                spec.name
            ],
        )?;
        if changed == 0 {
            return Err(Error::UnknownLocation(spec.name.clone()));
        }
        self.location(&spec.name)?
            .ok_or_else(|| Error::UnknownLocation(spec.name.clone()))
    }

    pub fn location(&self, name: &str) -> Result<Option<Location>> {
        let sql = format!("SELECT {} FROM location WHERE name = ?1", LOCATION_COLUMNS);
        Ok(self
            .connection()
            .query_row(&sql, params![name], location_from_row)
            .optional()?)
    }

    /// All locations in registration order.
    pub fn locations(&self) -> Result<Vec<Location>> {
        let sql = format!("SELECT {} FROM location ORDER BY id", LOCATION_COLUMNS);
        let mut stmt = self.connection().prepare(&sql)?;
        let locations = stmt
            .query_map([], location_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(locations)
    }

    /// Start a new scan generation for a location and return it.
    pub fn begin_scan(&self, location: &str) -> Result<i64> {
        let loc_id = location_id(self.connection(), location)?;
        self.connection().execute(
            "UPDATE location SET scan_generation = scan_generation + 1 WHERE id = ?1",
            params![loc_id],
        )?;
        Ok(self.connection().query_row(
            "SELECT scan_generation FROM location WHERE id = ?1",
            params![loc_id],
            |row| row.get(0),
        )?)
    }

    /// Close a completed scan: observations not seen in this generation become missing.
    pub fn complete_scan(
        &self,
        location: &str,
        generation: i64,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let loc_id = location_id(self.connection(), location)?;
        let tx = self.connection().unchecked_transaction()?;
        let missing = tx.execute(
            "UPDATE observation SET missing_since = ?1, canonical = 0 \
             WHERE location_id = ?2 AND seen_generation < ?3 AND missing_since IS NULL",
            params![to_epoch(now), loc_id, generation],
        )?;
        tx.execute(
            "UPDATE location SET last_scanned_at = ?1 WHERE id = ?2",
            params![to_epoch(now), loc_id],
        )?;
        tx.commit()?;
        debug!(
            "Scan generation {} of '{}' closed, {} observations now missing",
            generation, location, missing
        );
        Ok(missing)
    }

    // ── Observations ─────────────────────────────────────────────

    pub fn upsert_observation(
        &self,
        input: &ObservationInput,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome> {
        let tx = self.connection().unchecked_transaction()?;
        let outcome = upsert_in(&tx, input, now)?;
        tx.commit()?;
        Ok(outcome)
    }

    /// Register a transferred copy and, for moves, drop the source sighting,
    /// atomically.
    pub fn record_transfer(
        &self,
        destination: &ObservationInput,
        removed_source: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome> {
        let tx = self.connection().unchecked_transaction()?;
        let outcome = upsert_in(&tx, destination, now)?;
        if let Some(id) = removed_source {
            tx.execute("DELETE FROM observation WHERE id = ?1", params![id])?;
        }
        tx.commit()?;
        Ok(outcome)
    }

    /// Hash previously computed for this exact (path, size, mtime), if any.
    pub fn cached_identity(
        &self,
        location: &str,
        path: &str,
        size: u64,
        mtime: i64,
    ) -> Result<Option<(ContentHash, Option<u64>)>> {
        let loc_id = location_id(self.connection(), location)?;
        let cached = self
            .connection()
            .prepare_cached(
                "SELECT content_hash, partial_hash FROM observation \
                 WHERE location_id = ?1 AND path = ?2 AND size = ?3 AND mtime = ?4 \
                   AND missing_since IS NULL AND needs_verify = 0 \
                 ORDER BY verified_at DESC LIMIT 1",
            )?
            .query_row(params![loc_id, path, size as i64, mtime], |row| {
                Ok((
                    ContentHash::from_stored(row.get(0)?),
                    row.get::<_, Option<i64>>(1)?.map(|h| h as u64),
                ))
            })
            .optional()?;
        Ok(cached)
    }

    pub fn observations_for(
        &self,
        hash: &ContentHash,
        include_missing: bool,
    ) -> Result<Vec<Observation>> {
        let sql = format!(
            "SELECT {} FROM observation o JOIN location l ON l.id = o.location_id \
             WHERE o.content_hash = ?1 AND (?2 OR o.missing_since IS NULL) \
             ORDER BY l.id, o.path",
            OBSERVATION_COLUMNS
        );
        let mut stmt = self.connection().prepare_cached(&sql)?;
        let observations = stmt
            .query_map(params![hash.as_str(), include_missing], observation_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(observations)
    }

    pub fn observations_at(
        &self,
        location: &str,
        include_missing: bool,
    ) -> Result<Vec<Observation>> {
        let sql = format!(
            "SELECT {} FROM observation o JOIN location l ON l.id = o.location_id \
             WHERE l.name = ?1 AND (?2 OR o.missing_since IS NULL) ORDER BY o.path",
            OBSERVATION_COLUMNS
        );
        let mut stmt = self.connection().prepare(&sql)?;
        let observations = stmt
            .query_map(params![location, include_missing], observation_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(observations)
    }

    /// The live observation currently occupying a path, if any.
    pub fn observation_at_path(&self, location: &str, path: &str) -> Result<Option<Observation>> {
        let sql = format!(
            "SELECT {} FROM observation o JOIN location l ON l.id = o.location_id \
             WHERE l.name = ?1 AND o.path = ?2 AND o.missing_since IS NULL LIMIT 1",
            OBSERVATION_COLUMNS
        );
        Ok(self
            .connection()
            .query_row(&sql, params![location, path], observation_from_row)
            .optional()?)
    }

    pub fn missing_at(&self, location: &str) -> Result<Vec<Observation>> {
        let sql = format!(
            "SELECT {} FROM observation o JOIN location l ON l.id = o.location_id \
             WHERE l.name = ?1 AND o.missing_since IS NOT NULL \
             ORDER BY o.missing_since, o.path",
            OBSERVATION_COLUMNS
        );
        let mut stmt = self.connection().prepare(&sql)?;
        let observations = stmt
            .query_map(params![location], observation_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(observations)
    }

    pub fn mark_observation_missing(&self, id: i64, now: DateTime<Utc>) -> Result<()> {
        self.connection().execute(
            "UPDATE observation SET missing_since = ?1, canonical = 0 \
             WHERE id = ?2 AND missing_since IS NULL",
            params![to_epoch(now), id],
        )?;
        Ok(())
    }

    pub fn mark_observation_verified(
        &self,
        id: i64,
        partial_hash: Option<u64>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.connection().execute(
            "UPDATE observation SET needs_verify = 0, quick_identity = 0, verified_at = ?1, \
                partial_hash = COALESCE(?2, partial_hash) WHERE id = ?3",
            params![to_epoch(now), partial_hash.map(|h| h as i64), id],
        )?;
        Ok(())
    }

    pub fn delete_observation(&self, id: i64) -> Result<()> {
        self.connection()
            .execute("DELETE FROM observation WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Drop observations that have been missing since before `cutoff`.
    pub fn purge_missing_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let purged = self.connection().execute(
            "DELETE FROM observation WHERE missing_since IS NOT NULL AND missing_since < ?1",
            params![to_epoch(cutoff)],
        )?;
        debug!("Purged {} long-missing observations", purged);
        Ok(purged)
    }

    /// Content hashes with at least one live observation flagged for re-verification.
    pub fn verification_candidates(&self) -> Result<Vec<ContentHash>> {
        let mut stmt = self.connection().prepare(
            "SELECT DISTINCT content_hash FROM observation \
             WHERE needs_verify = 1 AND missing_since IS NULL ORDER BY content_hash",
        )?;
        let hashes = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .map(|r| r.map(ContentHash::from_stored))
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(hashes)
    }

    /// Content hashes observed live more than once, anywhere.
    pub fn multi_copy_hashes(&self) -> Result<Vec<ContentHash>> {
        let mut stmt = self.connection().prepare(
            "SELECT content_hash FROM observation WHERE missing_since IS NULL \
             GROUP BY content_hash HAVING COUNT(*) > 1 ORDER BY content_hash",
        )?;
        let hashes = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .map(|r| r.map(ContentHash::from_stored))
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(hashes)
    }

    /// Mark one observation as the canonical state of its asset.
    pub fn set_canonical(&self, hash: &ContentHash, location: &str, path: &str) -> Result<()> {
        let loc_id = location_id(self.connection(), location)?;
        let tx = self.connection().unchecked_transaction()?;
        tx.execute(
            "UPDATE observation SET canonical = (location_id = ?1 AND path = ?2) \
             WHERE content_hash = ?3",
            params![loc_id, path, hash.as_str()],
        )?;
        tx.execute(
            "UPDATE asset SET size = (SELECT size FROM observation \
                WHERE content_hash = ?1 AND location_id = ?2 AND path = ?3) \
             WHERE content_hash = ?1 AND EXISTS (SELECT 1 FROM observation \
                WHERE content_hash = ?1 AND location_id = ?2 AND path = ?3)",
            params![hash.as_str(), loc_id, path],
        )?;
        tx.commit()?;
        Ok(())
    }

    // ── Assets ───────────────────────────────────────────────────

    pub fn asset(&self, hash: &ContentHash) -> Result<Option<Asset>> {
        let sql = format!("SELECT {} FROM asset a WHERE a.content_hash = ?1", ASSET_COLUMNS);
        let asset = self
            .connection()
            .query_row(&sql, params![hash.as_str()], asset_from_row)
            .optional()?;
        match asset {
            Some(mut asset) => {
                asset.tags = self.asset_tags(&asset.content_hash)?;
                Ok(Some(asset))
            }
            None => Ok(None),
        }
    }

    fn asset_tags(&self, hash: &ContentHash) -> Result<BTreeSet<String>> {
        let mut stmt = self
            .connection()
            .prepare_cached("SELECT tag FROM asset_tag WHERE content_hash = ?1")?;
        let tags = stmt
            .query_map(params![hash.as_str()], |row| row.get(0))?
            .collect::<rusqlite::Result<BTreeSet<String>>>()?;
        Ok(tags)
    }

    pub fn query_assets(&self, query: &AssetQuery) -> Result<Vec<Asset>> {
        let mut sql = format!("SELECT {} FROM asset a WHERE 1 = 1", ASSET_COLUMNS);
        let mut values: Vec<Value> = Vec::new();

        for tag in &query.tags {
            values.push(Value::Text(tag.clone()));
            sql.push_str(&format!(
                " AND EXISTS (SELECT 1 FROM asset_tag t \
                   WHERE t.content_hash = a.content_hash AND t.tag = ?{})",
                values.len()
            ));
        }
        if let Some(after) = query.created_after {
            values.push(Value::Integer(to_epoch(after)));
            sql.push_str(&format!(
                " AND COALESCE(a.created_at, a.first_seen_at) >= ?{}",
                values.len()
            ));
        }
        if let Some(before) = query.created_before {
            values.push(Value::Integer(to_epoch(before)));
            sql.push_str(&format!(
                " AND COALESCE(a.created_at, a.first_seen_at) <= ?{}",
                values.len()
            ));
        }
        if let Some(min) = query.min_quality {
            values.push(Value::Real(min));
            sql.push_str(&format!(" AND a.quality_score >= ?{}", values.len()));
        }
        if let Some(max) = query.max_quality {
            values.push(Value::Real(max));
            sql.push_str(&format!(" AND a.quality_score <= ?{}", values.len()));
        }
        if !query.media_types.is_empty() {
            let mut placeholders = Vec::new();
            for media_type in &query.media_types {
                values.push(Value::Text(media_type.as_str().to_string()));
                placeholders.push(format!("?{}", values.len()));
            }
            sql.push_str(&format!(" AND a.media_type IN ({})", placeholders.join(", ")));
        }
        if let Some(location) = &query.location {
            values.push(Value::Text(location.clone()));
            sql.push_str(&format!(
                " AND EXISTS (SELECT 1 FROM observation o JOIN location l ON l.id = o.location_id \
                   WHERE o.content_hash = a.content_hash AND o.missing_since IS NULL \
                     AND l.name = ?{})",
                values.len()
            ));
        }
        sql.push_str(" ORDER BY a.first_seen_at, a.content_hash");

        let mut stmt = self.connection().prepare(&sql)?;
        let mut assets = stmt
            .query_map(params_from_iter(values.iter()), asset_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for asset in &mut assets {
            asset.tags = self.asset_tags(&asset.content_hash)?;
        }
        Ok(assets)
    }

    pub fn needs_analysis(&self, hash: &ContentHash) -> Result<bool> {
        let pending: Option<bool> = self
            .connection()
            .query_row(
                "SELECT analyzed_at IS NULL FROM asset WHERE content_hash = ?1",
                params![hash.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(pending.unwrap_or(false))
    }

    pub fn set_analysis(
        &self,
        hash: &ContentHash,
        analysis: &Analysis,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let tx = self.connection().unchecked_transaction()?;
        tx.execute(
            "UPDATE asset SET quality_score = ?1, perceptual_hash = ?2, analyzed_at = ?3 \
             WHERE content_hash = ?4",
            params![
                analysis.quality_score,
                analysis.perceptual_hash.map(|h| h as i64),
                to_epoch(now),
                hash.as_str()
            ],
        )?;
        tx.execute(
            "DELETE FROM asset_tag WHERE content_hash = ?1",
            params![hash.as_str()],
        )?;
        {
            let mut stmt =
                tx.prepare_cached("INSERT INTO asset_tag (content_hash, tag) VALUES (?1, ?2)")?;
            for tag in &analysis.tags {
                stmt.execute(params![hash.as_str(), tag])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Stored perceptual hashes, for rebuilding the similarity index.
    pub fn perceptual_hashes(&self) -> Result<Vec<(ContentHash, u64)>> {
        let mut stmt = self.connection().prepare(
            "SELECT content_hash, perceptual_hash FROM asset \
             WHERE perceptual_hash IS NOT NULL ORDER BY content_hash",
        )?;
        let hashes = stmt
            .query_map([], |row| {
                Ok((
                    ContentHash::from_stored(row.get(0)?),
                    row.get::<_, i64>(1)? as u64,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(hashes)
    }

    pub fn stats(&self) -> Result<RegistryStats> {
        Ok(self.connection().query_row(
            "SELECT \
                (SELECT COUNT(*) FROM location), \
                (SELECT COUNT(*) FROM asset), \
                (SELECT COUNT(*) FROM observation WHERE missing_since IS NULL), \
                (SELECT COUNT(*) FROM observation WHERE missing_since IS NOT NULL), \
                (SELECT COUNT(*) FROM conflict WHERE resolved_at IS NULL), \
                (SELECT COUNT(*) FROM conflict WHERE resolved_at IS NOT NULL)",
            [],
            |row| {
                Ok(RegistryStats {
                    locations: row.get(0)?,
                    assets: row.get(1)?,
                    live_observations: row.get(2)?,
                    missing_observations: row.get(3)?,
                    open_conflicts: row.get(4)?,
                    resolved_conflicts: row.get(5)?,
                })
            },
        )?)
    }
}
