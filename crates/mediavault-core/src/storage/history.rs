//! Append-mostly records: conflicts, dedup runs and their groups, removals
//! and the run log.

use super::models::*;
use super::sqlite::Database;
use crate::error::Result;
use crate::hasher::ContentHash;
use crate::sync::ResolutionStrategy;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row};
use tracing::debug;

const CONFLICT_COLUMNS: &str = "id, content_hash, reason, observations, detected_at, strategy, \
                                resolved_at, winner_location, winner_path";

const REMOVAL_COLUMNS: &str = "id, group_id, content_hash, location, path, size, strategy, \
                               planned_at, executed_at, execution_result";

fn conflict_from_row(row: &Row) -> rusqlite::Result<ConflictRecord> {
    let observations: String = row.get(3)?;
    let strategy: Option<String> = row.get(5)?;
    let winner_location: Option<String> = row.get(7)?;
    let winner_path: Option<String> = row.get(8)?;
    Ok(ConflictRecord {
        id: row.get(0)?,
        content_hash: ContentHash::from_stored(row.get(1)?),
        reason: ConflictReason::parse(&row.get::<_, String>(2)?),
        observations: serde_json::from_str(&observations).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e))
        })?,
        detected_at: from_epoch(row.get(4)?),
        strategy: strategy.and_then(|s| s.parse::<ResolutionStrategy>().ok()),
        resolved_at: row.get::<_, Option<i64>>(6)?.map(from_epoch),
        winner: match (winner_location, winner_path) {
            (Some(location), Some(path)) => Some(ObservationRef { location, path }),
            _ => None,
        },
    })
}

fn removal_from_row(row: &Row) -> rusqlite::Result<RemovalEntry> {
    Ok(RemovalEntry {
        id: row.get(0)?,
        group_id: row.get(1)?,
        content_hash: ContentHash::from_stored(row.get(2)?),
        location: row.get(3)?,
        path: row.get(4)?,
        size: row.get::<_, i64>(5)? as u64,
        strategy: row.get(6)?,
        planned_at: from_epoch(row.get(7)?),
        executed_at: row.get::<_, Option<i64>>(8)?.map(from_epoch),
        execution_result: row.get(9)?,
    })
}

fn member_from_row(row: &Row) -> rusqlite::Result<GroupMember> {
    Ok(GroupMember {
        content_hash: ContentHash::from_stored(row.get(0)?),
        location: row.get(1)?,
        path: row.get(2)?,
        size: row.get::<_, i64>(3)? as u64,
        mtime: row.get(4)?,
        location_priority: row.get(5)?,
        location_order: row.get(6)?,
        distance: row.get(7)?,
    })
}

impl Database {
    // ── Conflicts ────────────────────────────────────────────────

    /// Record a conflict unless an open one with the same reason already
    /// exists for the hash. Returns the conflict id either way.
    pub fn record_conflict(
        &self,
        hash: &ContentHash,
        reason: ConflictReason,
        observations: &[Observation],
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let snapshot = serde_json::to_string(observations)?;
        let existing: Option<i64> = self
            .connection()
            .query_row(
                "SELECT id FROM conflict \
                 WHERE content_hash = ?1 AND reason = ?2 AND resolved_at IS NULL",
                params![hash.as_str(), reason.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = existing {
            self.connection().execute(
                "UPDATE conflict SET observations = ?1 WHERE id = ?2",
                params![snapshot, id],
            )?;
            return Ok(id);
        }
        self.connection().execute(
            "INSERT INTO conflict (content_hash, reason, observations, detected_at) \
             VALUES (?1, ?2, ?3, ?4)",
            params![hash.as_str(), reason.as_str(), snapshot, to_epoch(now)],
        )?;
        let id = self.connection().last_insert_rowid();
        debug!("Conflict {} recorded for {} ({})", id, hash.short(), reason.as_str());
        Ok(id)
    }

    pub fn conflict(&self, id: i64) -> Result<Option<ConflictRecord>> {
        let sql = format!("SELECT {} FROM conflict WHERE id = ?1", CONFLICT_COLUMNS);
        Ok(self
            .connection()
            .query_row(&sql, params![id], conflict_from_row)
            .optional()?)
    }

    pub fn conflicts(&self, open_only: bool) -> Result<Vec<ConflictRecord>> {
        let sql = format!(
            "SELECT {} FROM conflict WHERE (?1 = 0 OR resolved_at IS NULL) ORDER BY id",
            CONFLICT_COLUMNS
        );
        let mut stmt = self.connection().prepare(&sql)?;
        let conflicts = stmt
            .query_map(params![open_only], conflict_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(conflicts)
    }

    pub fn conflicts_for(&self, hash: &ContentHash) -> Result<Vec<ConflictRecord>> {
        let sql = format!(
            "SELECT {} FROM conflict WHERE content_hash = ?1 ORDER BY id",
            CONFLICT_COLUMNS
        );
        let mut stmt = self.connection().prepare(&sql)?;
        let conflicts = stmt
            .query_map(params![hash.as_str()], conflict_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(conflicts)
    }

    pub fn resolve_conflict_record(
        &self,
        id: i64,
        strategy: ResolutionStrategy,
        winner: &ObservationRef,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.connection().execute(
            "UPDATE conflict SET strategy = ?1, resolved_at = ?2, winner_location = ?3, \
                winner_path = ?4 WHERE id = ?5",
            params![
                strategy.as_str(),
                to_epoch(now),
                winner.location,
                winner.path,
                id
            ],
        )?;
        Ok(())
    }

    // ── Dedup runs ───────────────────────────────────────────────

    /// Persist a full dedup run. Group ids and run ids on the input are ignored
    /// and the stored copies are returned.
    pub fn insert_dedup_run(
        &self,
        threshold: u32,
        groups: &[DuplicateGroup],
        now: DateTime<Utc>,
    ) -> Result<(DedupRun, Vec<DuplicateGroup>)> {
        let tx = self.connection().unchecked_transaction()?;
        tx.execute(
            "INSERT INTO dedup_run (created_at, threshold, group_count) VALUES (?1, ?2, ?3)",
            params![to_epoch(now), threshold, groups.len() as i64],
        )?;
        let run_id = tx.last_insert_rowid();

        let mut stored = Vec::with_capacity(groups.len());
        {
            let mut group_stmt = tx.prepare_cached(
                "INSERT INTO duplicate_group (run_id, kind, representative) VALUES (?1, ?2, ?3)",
            )?;
            let mut member_stmt = tx.prepare_cached(
                "INSERT INTO duplicate_group_member \
                 (group_id, position, content_hash, location, path, size, mtime, \
                  location_priority, location_order, distance) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            for group in groups {
                group_stmt.execute(params![
                    run_id,
                    group.kind.as_str(),
                    group.representative as i64
                ])?;
                let group_id = tx.last_insert_rowid();
                for (position, m) in group.members.iter().enumerate() {
                    member_stmt.execute(params![
                        group_id,
                        position as i64,
                        m.content_hash.as_str(),
                        m.location,
                        m.path,
                        m.size as i64,
                        m.mtime,
                        m.location_priority,
                        m.location_order,
                        m.distance
                    ])?;
                }
                stored.push(DuplicateGroup {
                    id: group_id,
                    run_id,
                    ..group.clone()
                });
            }
        }
        tx.commit()?;

        debug!("Dedup run {} stored with {} groups", run_id, stored.len());
        let run = DedupRun {
            id: run_id,
            created_at: now,
            threshold,
            group_count: stored.len() as i64,
        };
        Ok((run, stored))
    }

    pub fn latest_dedup_run(&self) -> Result<Option<DedupRun>> {
        Ok(self
            .connection()
            .query_row(
                "SELECT id, created_at, threshold, group_count FROM dedup_run \
                 ORDER BY id DESC LIMIT 1",
                [],
                |row| {
                    Ok(DedupRun {
                        id: row.get(0)?,
                        created_at: from_epoch(row.get(1)?),
                        threshold: row.get(2)?,
                        group_count: row.get(3)?,
                    })
                },
            )
            .optional()?)
    }

    pub fn duplicate_group(&self, id: i64) -> Result<Option<DuplicateGroup>> {
        let header: Option<(i64, String, i64)> = self
            .connection()
            .query_row(
                "SELECT run_id, kind, representative FROM duplicate_group WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let Some((run_id, kind, representative)) = header else {
            return Ok(None);
        };

        let mut stmt = self.connection().prepare_cached(
            "SELECT content_hash, location, path, size, mtime, location_priority, \
                    location_order, distance \
             FROM duplicate_group_member WHERE group_id = ?1 ORDER BY position",
        )?;
        let members = stmt
            .query_map(params![id], member_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(Some(DuplicateGroup {
            id,
            run_id,
            kind: if kind == "similar" {
                MatchKind::Similar
            } else {
                MatchKind::Exact
            },
            members,
            representative: representative as usize,
        }))
    }

    pub fn duplicate_groups(&self, run_id: i64) -> Result<Vec<DuplicateGroup>> {
        let mut stmt = self
            .connection()
            .prepare("SELECT id FROM duplicate_group WHERE run_id = ?1 ORDER BY id")?;
        let ids = stmt
            .query_map(params![run_id], |row| row.get::<_, i64>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let mut groups = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(group) = self.duplicate_group(id)? {
                groups.push(group);
            }
        }
        Ok(groups)
    }

    // ── Removals ─────────────────────────────────────────────────

    pub fn insert_removal(
        &self,
        group_id: i64,
        member: &GroupMember,
        strategy: &str,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        self.connection().execute(
            "INSERT INTO removal (group_id, content_hash, location, path, size, strategy, planned_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                group_id,
                member.content_hash.as_str(),
                member.location,
                member.path,
                member.size as i64,
                strategy,
                to_epoch(now)
            ],
        )?;
        Ok(self.connection().last_insert_rowid())
    }

    pub fn mark_removal_executed(&self, id: i64, result: &str, now: DateTime<Utc>) -> Result<()> {
        self.connection().execute(
            "UPDATE removal SET executed_at = ?1, execution_result = ?2 WHERE id = ?3",
            params![to_epoch(now), result, id],
        )?;
        Ok(())
    }

    pub fn removals_for_group(&self, group_id: i64) -> Result<Vec<RemovalEntry>> {
        let sql = format!(
            "SELECT {} FROM removal WHERE group_id = ?1 ORDER BY id",
            REMOVAL_COLUMNS
        );
        let mut stmt = self.connection().prepare(&sql)?;
        let entries = stmt
            .query_map(params![group_id], removal_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    // ── Run log ──────────────────────────────────────────────────

    pub fn log_run(
        &self,
        operation: &str,
        succeeded: usize,
        skipped: usize,
        failed: usize,
        summary_json: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.connection().execute(
            "INSERT INTO run_log (operation, finished_at, succeeded, skipped, failed, summary) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                operation,
                to_epoch(now),
                succeeded as i64,
                skipped as i64,
                failed as i64,
                summary_json
            ],
        )?;
        Ok(())
    }

    /// Most recent run of an operation: (finished_at, summary JSON).
    pub fn last_run(&self, operation: &str) -> Result<Option<(DateTime<Utc>, String)>> {
        Ok(self
            .connection()
            .query_row(
                "SELECT finished_at, summary FROM run_log WHERE operation = ?1 \
                 ORDER BY id DESC LIMIT 1",
                params![operation],
                |row| Ok((from_epoch(row.get(0)?), row.get(1)?)),
            )
            .optional()?)
    }
}
