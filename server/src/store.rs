//! Durable per-player records over SQLite.
//!
//! One row per (player, mode) plus a singleton lifetime-input counter. The
//! ranking cache is fully re-derivable from this table, which makes it the
//! fallback of record for every rank query.

use rusqlite::{params, Connection, OptionalExtension};
use shared::{GameMode, FLAGGED_PROFILE};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("profile encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Durable record of a player's best run in one mode.
///
/// Invariant: `ranking` equals the formula applied to the best run's own
/// stats with the cumulative profile count — the profile bonus is
/// cumulative even though score/speed/entropy belong to one round.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerRow {
    pub name: String,
    pub mode: GameMode,
    pub best_score: u32,
    pub speed: f64,
    pub entropy: u8,
    pub ranking: i64,
    /// Union across all rounds ever submitted; never shrinks.
    pub profiles: BTreeSet<String>,
    pub updated_at: u64,
}

impl PlayerRow {
    pub fn is_flagged(&self) -> bool {
        self.profiles.contains(FLAGGED_PROFILE)
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS players (
    name       TEXT NOT NULL,
    mode       TEXT NOT NULL,
    best_score INTEGER NOT NULL,
    speed      REAL NOT NULL,
    entropy    INTEGER NOT NULL,
    ranking    INTEGER NOT NULL,
    flagged    INTEGER NOT NULL DEFAULT 0,
    profiles   TEXT NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (name, mode)
);
CREATE INDEX IF NOT EXISTS idx_players_rank
    ON players (mode, flagged, ranking DESC, updated_at DESC);
CREATE TABLE IF NOT EXISTS lifetime (
    id    INTEGER PRIMARY KEY CHECK (id = 1),
    total INTEGER NOT NULL
);
INSERT OR IGNORE INTO lifetime (id, total) VALUES (1, 0);
";

/// SQLite-backed player store. The connection sits behind a mutex held only
/// for the duration of a single statement or small statement group.
pub struct PlayerStore {
    conn: Mutex<Connection>,
}

impl PlayerStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, mode: GameMode, name: &str) -> Result<Option<PlayerRow>, StoreError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT name, mode, best_score, speed, entropy, ranking, profiles, updated_at
                 FROM players WHERE mode = ?1 AND name = ?2",
                params![mode.as_str(), name],
                map_player_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn upsert(&self, row: &PlayerRow) -> Result<(), StoreError> {
        let profiles: Vec<&String> = row.profiles.iter().collect();
        let encoded = serde_json::to_string(&profiles)?;
        self.conn().execute(
            "INSERT INTO players
                 (name, mode, best_score, speed, entropy, ranking, flagged, profiles, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT (name, mode) DO UPDATE SET
                 best_score = excluded.best_score,
                 speed      = excluded.speed,
                 entropy    = excluded.entropy,
                 ranking    = excluded.ranking,
                 flagged    = excluded.flagged,
                 profiles   = excluded.profiles,
                 updated_at = excluded.updated_at",
            params![
                row.name,
                row.mode.as_str(),
                row.best_score,
                row.speed,
                row.entropy,
                row.ranking,
                row.is_flagged() as i64,
                encoded,
                row.updated_at,
            ],
        )?;
        Ok(())
    }

    /// 1-based rank a raw candidate ranking score would land at: the count
    /// of non-flagged rows strictly above it, plus one.
    pub fn rank_of_score(&self, mode: GameMode, score: i64) -> Result<u64, StoreError> {
        let above: u64 = self.conn().query_row(
            "SELECT COUNT(*) FROM players WHERE mode = ?1 AND flagged = 0 AND ranking > ?2",
            params![mode.as_str(), score],
            |r| r.get(0),
        )?;
        Ok(above + 1)
    }

    /// Exact 1-based rank of a named player. Ties break by most-recent
    /// update first; flagged players always rank below every legit row.
    pub fn rank_of_player(&self, mode: GameMode, name: &str) -> Result<Option<u64>, StoreError> {
        let Some(row) = self.get(mode, name)? else {
            return Ok(None);
        };
        let conn = self.conn();
        let higher = |flagged: i64| -> Result<u64, rusqlite::Error> {
            conn.query_row(
                "SELECT COUNT(*) FROM players
                 WHERE mode = ?1 AND flagged = ?2
                   AND (ranking > ?3 OR (ranking = ?3 AND updated_at > ?4))",
                params![mode.as_str(), flagged, row.ranking, row.updated_at],
                |r| r.get(0),
            )
        };
        if row.is_flagged() {
            let legit: u64 = conn.query_row(
                "SELECT COUNT(*) FROM players WHERE mode = ?1 AND flagged = 0",
                params![mode.as_str()],
                |r| r.get(0),
            )?;
            Ok(Some(legit + higher(1)? + 1))
        } else {
            Ok(Some(higher(0)? + 1))
        }
    }

    /// One leaderboard window in canonical order: legit before flagged,
    /// then ranking descending, then most recently updated first. `search`
    /// restricts to names starting with the given prefix.
    pub fn window(
        &self,
        mode: GameMode,
        offset: u64,
        limit: u64,
        search: Option<&str>,
    ) -> Result<Vec<PlayerRow>, StoreError> {
        let conn = self.conn();
        let mut rows = Vec::new();
        match search {
            Some(prefix) => {
                let mut stmt = conn.prepare(
                    "SELECT name, mode, best_score, speed, entropy, ranking, profiles, updated_at
                     FROM players WHERE mode = ?1 AND name LIKE ?2 || '%'
                     ORDER BY flagged ASC, ranking DESC, updated_at DESC
                     LIMIT ?3 OFFSET ?4",
                )?;
                let mapped =
                    stmt.query_map(params![mode.as_str(), prefix, limit, offset], map_player_row)?;
                for row in mapped {
                    rows.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT name, mode, best_score, speed, entropy, ranking, profiles, updated_at
                     FROM players WHERE mode = ?1
                     ORDER BY flagged ASC, ranking DESC, updated_at DESC
                     LIMIT ?2 OFFSET ?3",
                )?;
                let mapped = stmt.query_map(params![mode.as_str(), limit, offset], map_player_row)?;
                for row in mapped {
                    rows.push(row?);
                }
            }
        }
        Ok(rows)
    }

    pub fn count(&self, mode: GameMode, search: Option<&str>) -> Result<u64, StoreError> {
        let conn = self.conn();
        let count = match search {
            Some(prefix) => conn.query_row(
                "SELECT COUNT(*) FROM players WHERE mode = ?1 AND name LIKE ?2 || '%'",
                params![mode.as_str(), prefix],
                |r| r.get(0),
            )?,
            None => conn.query_row(
                "SELECT COUNT(*) FROM players WHERE mode = ?1",
                params![mode.as_str()],
                |r| r.get(0),
            )?,
        };
        Ok(count)
    }

    /// Batch-fetches named rows. Order is not guaranteed; callers re-order
    /// to match cache rank.
    pub fn fetch_many(
        &self,
        mode: GameMode,
        names: &[String],
    ) -> Result<HashMap<String, PlayerRow>, StoreError> {
        if names.is_empty() {
            return Ok(HashMap::new());
        }
        let placeholders = vec!["?"; names.len()].join(", ");
        let sql = format!(
            "SELECT name, mode, best_score, speed, entropy, ranking, profiles, updated_at
             FROM players WHERE mode = ? AND name IN ({})",
            placeholders
        );
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let params_iter = std::iter::once(mode.as_str().to_string()).chain(names.iter().cloned());
        let mapped = stmt.query_map(rusqlite::params_from_iter(params_iter), map_player_row)?;
        let mut out = HashMap::new();
        for row in mapped {
            let row = row?;
            out.insert(row.name.clone(), row);
        }
        Ok(out)
    }

    /// Every row's cache-relevant fields, for full resync.
    pub fn scan_rankings(&self) -> Result<Vec<(GameMode, String, i64, bool)>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT mode, name, ranking, flagged FROM players")?;
        let mapped = stmt.query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, i64>(2)?,
                r.get::<_, i64>(3)? != 0,
            ))
        })?;
        let mut out = Vec::new();
        for row in mapped {
            let (mode, name, ranking, flagged) = row?;
            // Rows with an unknown mode label are unreachable via queries
            // anyway; skip them rather than failing the resync.
            if let Some(mode) = GameMode::parse(&mode) {
                out.push((mode, name, ranking, flagged));
            }
        }
        Ok(out)
    }

    /// Adds this round's raw score to the global lifetime-input counter.
    /// Monotonic and ungated by personal-best status.
    pub fn add_lifetime(&self, keys: u64) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE lifetime SET total = total + ?1 WHERE id = 1",
            params![keys],
        )?;
        Ok(())
    }

    /// Simulates a lost durable store for degrade-path tests.
    #[cfg(test)]
    pub fn break_for_tests(&self) {
        let _ = self.conn().execute_batch("DROP TABLE players;");
    }

    pub fn lifetime_total(&self) -> Result<u64, StoreError> {
        let total: u64 =
            self.conn()
                .query_row("SELECT total FROM lifetime WHERE id = 1", [], |r| r.get(0))?;
        Ok(total)
    }
}

fn map_player_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PlayerRow> {
    let mode: String = row.get(1)?;
    let encoded: String = row.get(6)?;
    let profiles: Vec<String> = serde_json::from_str(&encoded).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(PlayerRow {
        name: row.get(0)?,
        mode: GameMode::parse(&mode).unwrap_or(GameMode::Classic),
        best_score: row.get(2)?,
        speed: row.get(3)?,
        entropy: row.get(4)?,
        ranking: row.get(5)?,
        profiles: profiles.into_iter().collect(),
        updated_at: row.get(7)?,
    })
}
