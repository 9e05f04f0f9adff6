//! Ranked leaderboard kept consistent across a low-latency ranked set and
//! the durable store.
//!
//! The cache is write-through on every successful merge and fully
//! re-derivable from the players table, so the durable store is always the
//! fallback of record: any cache miss or error degrades to the equivalent
//! SQL query instead of surfacing an error. Consistency is eventual, not
//! instantaneous.

use crate::store::{PlayerRow, PlayerStore, StoreError};
use log::{debug, info, warn};
use shared::{GameMode, BROADCAST_THROTTLE_MS};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("ranking cache unavailable")]
    Unavailable,
}

/// One ranked set per mode: member = player name, score = signed ranking
/// value (negative for flagged cheaters). Descending score order, ties
/// broken by member name.
pub trait RankedSet: Send + Sync {
    fn write(&self, member: &str, score: i64) -> Result<(), CacheError>;
    /// Writes only when `score` beats the member's current value. Returns
    /// whether the write happened.
    fn write_if_greater(&self, member: &str, score: i64) -> Result<bool, CacheError>;
    /// 0-based reverse rank (best member is 0).
    fn rank_of(&self, member: &str) -> Result<Option<u64>, CacheError>;
    /// Members with a strictly higher score.
    fn count_above(&self, score: i64) -> Result<u64, CacheError>;
    /// Rank-ordered window of members starting at `offset`.
    fn range(&self, offset: u64, limit: u64) -> Result<Vec<(String, i64)>, CacheError>;
    fn len(&self) -> Result<u64, CacheError>;
    fn clear(&self) -> Result<(), CacheError>;
}

#[derive(Default)]
struct RankedInner {
    by_score: BTreeSet<(i64, String)>,
    scores: HashMap<String, i64>,
}

/// In-process ordered set standing in for the external low-latency cache.
#[derive(Default)]
pub struct MemoryRankedSet {
    inner: Mutex<RankedInner>,
}

impl MemoryRankedSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, RankedInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RankedSet for MemoryRankedSet {
    fn write(&self, member: &str, score: i64) -> Result<(), CacheError> {
        let mut inner = self.inner();
        if let Some(old) = inner.scores.insert(member.to_string(), score) {
            inner.by_score.remove(&(old, member.to_string()));
        }
        inner.by_score.insert((score, member.to_string()));
        Ok(())
    }

    fn write_if_greater(&self, member: &str, score: i64) -> Result<bool, CacheError> {
        let current = self.inner().scores.get(member).copied();
        match current {
            Some(existing) if existing >= score => Ok(false),
            _ => {
                self.write(member, score)?;
                Ok(true)
            }
        }
    }

    fn rank_of(&self, member: &str) -> Result<Option<u64>, CacheError> {
        let inner = self.inner();
        let Some(score) = inner.scores.get(member).copied() else {
            return Ok(None);
        };
        let key = (score, member.to_string());
        let above = inner.by_score.iter().rev().take_while(|e| **e > key).count();
        Ok(Some(above as u64))
    }

    fn count_above(&self, score: i64) -> Result<u64, CacheError> {
        let inner = self.inner();
        let above = inner
            .by_score
            .iter()
            .rev()
            .take_while(|(s, _)| *s > score)
            .count();
        Ok(above as u64)
    }

    fn range(&self, offset: u64, limit: u64) -> Result<Vec<(String, i64)>, CacheError> {
        let inner = self.inner();
        Ok(inner
            .by_score
            .iter()
            .rev()
            .skip(offset as usize)
            .take(limit as usize)
            .map(|(score, name)| (name.clone(), *score))
            .collect())
    }

    fn len(&self) -> Result<u64, CacheError> {
        Ok(self.inner().scores.len() as u64)
    }

    fn clear(&self) -> Result<(), CacheError> {
        let mut inner = self.inner();
        inner.by_score.clear();
        inner.scores.clear();
        Ok(())
    }
}

/// One leaderboard row with its absolute rank attached.
#[derive(Debug, Clone)]
pub struct LeaderboardEntry {
    pub rank: u64,
    pub row: PlayerRow,
}

#[derive(Debug, Clone)]
pub struct LeaderboardPage {
    pub entries: Vec<LeaderboardEntry>,
    pub page: u64,
    pub page_count: u64,
    pub total: u64,
}

/// The signed value written to the cache: negative iff flagged, so cheaters
/// sink below every legit entry while their row stays visible.
pub fn signed_score(ranking: i64, flagged: bool) -> i64 {
    if flagged {
        -ranking.abs()
    } else {
        ranking
    }
}

/// Fallback wrapper over the per-mode ranked sets and the durable store.
pub struct RankingService {
    caches: HashMap<GameMode, Box<dyn RankedSet>>,
    store: Arc<PlayerStore>,
    /// Shared last-broadcast timestamp for the global change notification.
    last_broadcast: AtomicU64,
}

impl RankingService {
    pub fn new(store: Arc<PlayerStore>, make_cache: impl Fn() -> Box<dyn RankedSet>) -> Self {
        let mut caches: HashMap<GameMode, Box<dyn RankedSet>> = HashMap::new();
        for mode in [GameMode::Classic, GameMode::Blitz] {
            caches.insert(mode, make_cache());
        }
        Self {
            caches,
            store,
            last_broadcast: AtomicU64::new(0),
        }
    }

    pub fn in_memory(store: Arc<PlayerStore>) -> Self {
        Self::new(store, || Box::new(MemoryRankedSet::new()))
    }

    fn cache(&self, mode: GameMode) -> &dyn RankedSet {
        self.caches[&mode].as_ref()
    }

    /// Write-through after a successful merge. Flagged players are always
    /// overwritten (demotion is monotone); legit scores use the
    /// only-if-greater form so a stale writer can never lower a rank.
    pub fn write_through(&self, mode: GameMode, name: &str, ranking: i64, flagged: bool) {
        let signed = signed_score(ranking, flagged);
        let result = if flagged {
            self.cache(mode).write(name, signed)
        } else {
            self.cache(mode).write_if_greater(name, signed).map(|_| ())
        };
        if let Err(e) = result {
            // The durable row is already written; the cache catches up on
            // the next rebuild.
            warn!("Cache write for {} skipped: {}", name, e);
        }
    }

    /// Exact 1-based rank of a named player; cache first, durable fallback.
    pub fn rank_of_player(&self, mode: GameMode, name: &str) -> Option<u64> {
        match self.cache(mode).rank_of(name) {
            Ok(Some(rank)) => return Some(rank + 1),
            Ok(None) => debug!("Cache miss ranking {}, using durable store", name),
            Err(e) => warn!("Cache rank lookup failed ({}), using durable store", e),
        }
        match self.store.rank_of_player(mode, name) {
            Ok(rank) => rank,
            Err(e) => {
                warn!("Durable rank lookup for {} failed: {}", name, e);
                None
            }
        }
    }

    /// 1-based rank a candidate ranking score would land at.
    pub fn rank_of_score(&self, mode: GameMode, ranking: i64) -> u64 {
        match self.cache(mode).count_above(ranking) {
            Ok(above) => return above + 1,
            Err(e) => warn!("Cache range count failed ({}), using durable store", e),
        }
        match self.store.rank_of_score(mode, ranking) {
            Ok(rank) => rank,
            Err(e) => {
                warn!("Durable rank count failed: {}", e);
                1
            }
        }
    }

    /// Paginated leaderboard. Searches always hit the durable store; plain
    /// pages are served from the cache with a durable fallback, and a page
    /// that comes back short of what the cache implied (drift) is re-served
    /// from the durable store with a corrected page count.
    pub fn leaderboard_page(
        &self,
        mode: GameMode,
        page: u64,
        page_size: u64,
        search: Option<&str>,
    ) -> LeaderboardPage {
        let page_size = page_size.max(1);
        if search.is_some() {
            return self.durable_page(mode, page, page_size, search);
        }

        let total = match self.cache(mode).len() {
            Ok(0) | Err(_) => return self.durable_page(mode, page, page_size, None),
            Ok(n) => n,
        };
        let page_count = total.div_ceil(page_size);
        let page = page.clamp(1, page_count);
        let offset = (page - 1) * page_size;

        let members = match self.cache(mode).range(offset, page_size) {
            Ok(members) => members,
            Err(e) => {
                warn!("Cache range failed ({}), using durable store", e);
                return self.durable_page(mode, page, page_size, None);
            }
        };
        let names: Vec<String> = members.iter().map(|(name, _)| name.clone()).collect();
        let rows = match self.store.fetch_many(mode, &names) {
            Ok(rows) => rows,
            Err(e) => {
                warn!("Row fetch for leaderboard page failed: {}", e);
                return self.durable_page(mode, page, page_size, None);
            }
        };
        if rows.len() < names.len() {
            // Cache/durable drift: some cached members have no row yet (or
            // no longer). Serve the corrected durable view instead.
            warn!(
                "Leaderboard drift detected ({} cached, {} stored), re-serving from store",
                names.len(),
                rows.len()
            );
            return self.durable_page(mode, page, page_size, None);
        }

        // Batch fetch loses order; restore cache rank order.
        let mut rows = rows;
        let entries = names
            .iter()
            .enumerate()
            .filter_map(|(i, name)| {
                rows.remove(name).map(|row| LeaderboardEntry {
                    rank: offset + i as u64 + 1,
                    row,
                })
            })
            .collect();
        LeaderboardPage {
            entries,
            page,
            page_count,
            total,
        }
    }

    fn durable_page(
        &self,
        mode: GameMode,
        page: u64,
        page_size: u64,
        search: Option<&str>,
    ) -> LeaderboardPage {
        let total = match self.store.count(mode, search) {
            Ok(total) => total,
            Err(e) => {
                warn!("Durable leaderboard count failed: {}", e);
                return LeaderboardPage {
                    entries: Vec::new(),
                    page: 1,
                    page_count: 1,
                    total: 0,
                };
            }
        };
        let page_count = total.div_ceil(page_size).max(1);
        let page = page.clamp(1, page_count);
        let offset = (page - 1) * page_size;
        let rows = match self.store.window(mode, offset, page_size, search) {
            Ok(rows) => rows,
            Err(e) => {
                warn!("Durable leaderboard window failed: {}", e);
                Vec::new()
            }
        };
        let entries = rows
            .into_iter()
            .enumerate()
            .map(|(i, row)| LeaderboardEntry {
                rank: offset + i as u64 + 1,
                row,
            })
            .collect();
        LeaderboardPage {
            entries,
            page,
            page_count,
            total,
        }
    }

    /// Full resync: rebuilds every mode's ranked set from the players
    /// table. Idempotent and safe against a live cache; this is the sole
    /// recovery path after cache loss.
    pub fn rebuild(&self) -> Result<usize, StoreError> {
        for cache in self.caches.values() {
            if let Err(e) = cache.clear() {
                warn!("Cache clear during rebuild failed: {}", e);
            }
        }
        let rankings = self.store.scan_rankings()?;
        let mut written = 0;
        for (mode, name, ranking, flagged) in &rankings {
            if self
                .cache(*mode)
                .write(name, signed_score(*ranking, *flagged))
                .is_ok()
            {
                written += 1;
            }
        }
        info!("Ranking cache rebuilt: {} entries", written);
        Ok(written)
    }

    /// Decides whether a global "leaderboard changed" push may go out now.
    /// At most one per [`BROADCAST_THROTTLE_MS`] across all connections.
    pub fn should_broadcast(&self, now_ms: u64) -> bool {
        let last = self.last_broadcast.load(Ordering::Acquire);
        if now_ms.saturating_sub(last) < BROADCAST_THROTTLE_MS && last != 0 {
            return false;
        }
        self.last_broadcast
            .compare_exchange(last, now_ms, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}
