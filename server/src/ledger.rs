//! Score ledger: merges one finished, non-cheating round into the player's
//! permanent record.
//!
//! The session's tracked score is the only score that ever reaches this
//! module; client-reported values are discarded upstream. A durable-store
//! failure degrades to a ranking computed from the round's own stats so the
//! player's game-over response is never blocked, and the cache write is
//! skipped for that round.

use crate::ranking::RankingService;
use crate::score::ranking_score;
use crate::store::{PlayerRow, PlayerStore, StoreError};
use log::{info, warn};
use shared::GameMode;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Stats of one finished round, as derived by the classifier and session.
#[derive(Debug, Clone)]
pub struct RoundStats {
    pub name: String,
    pub mode: GameMode,
    /// Server-tracked accepted key count.
    pub raw_score: u32,
    /// Sustained keys per second.
    pub speed: f64,
    /// Classifier entropy, 0-100.
    pub entropy: u8,
    /// Profile titles unlocked by this round.
    pub profiles: Vec<String>,
}

/// What the merge decided, returned to the originating connection.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    /// This round's own composite ranking score.
    pub round_ranking: i64,
    /// Cumulative profile set after the union.
    pub merged_profiles: BTreeSet<String>,
    pub is_personal_best: bool,
    /// The player's stored all-time-best ranking after this merge.
    pub all_time_best: i64,
    /// Profile titles that existed before this round.
    pub prior_profiles: BTreeSet<String>,
    /// False when the durable write failed and the cache was skipped.
    pub persisted: bool,
}

pub struct ScoreLedger {
    store: Arc<PlayerStore>,
    ranking: Arc<RankingService>,
}

impl ScoreLedger {
    pub fn new(store: Arc<PlayerStore>, ranking: Arc<RankingService>) -> Self {
        Self { store, ranking }
    }

    /// Merges a finished round. `updated_at` is the wall-clock timestamp
    /// recorded on any row this merge writes.
    pub fn merge_round(&self, stats: &RoundStats, updated_at: u64) -> MergeOutcome {
        // Lifetime counter is independent of personal-best status and of
        // whether the merge itself succeeds.
        if let Err(e) = self.store.add_lifetime(stats.raw_score as u64) {
            warn!("Lifetime counter update failed: {}", e);
        }

        match self.try_merge(stats, updated_at) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(
                    "Durable merge for {} failed ({}), degrading to round-local ranking",
                    stats.name, e
                );
                self.degraded_outcome(stats)
            }
        }
    }

    fn try_merge(
        &self,
        stats: &RoundStats,
        updated_at: u64,
    ) -> Result<MergeOutcome, StoreError> {
        let round_set: BTreeSet<String> = stats.profiles.iter().cloned().collect();

        let Some(existing) = self.store.get(stats.mode, &stats.name)? else {
            // No record yet: unconditional personal best.
            let ranking = self.round_ranking(stats, round_set.len());
            let row = PlayerRow {
                name: stats.name.clone(),
                mode: stats.mode,
                best_score: stats.raw_score,
                speed: stats.speed,
                entropy: stats.entropy,
                ranking,
                profiles: round_set.clone(),
                updated_at,
            };
            self.store.upsert(&row)?;
            self.ranking
                .write_through(stats.mode, &stats.name, ranking, row.is_flagged());
            info!("New record for {}: ranking {}", stats.name, ranking);
            return Ok(MergeOutcome {
                round_ranking: ranking,
                merged_profiles: round_set,
                is_personal_best: true,
                all_time_best: ranking,
                prior_profiles: BTreeSet::new(),
                persisted: true,
            });
        };

        let prior = existing.profiles.clone();
        let merged: BTreeSet<String> = prior.union(&round_set).cloned().collect();
        let candidate = self.round_ranking(stats, merged.len());

        let (row, is_personal_best) = if candidate > existing.ranking {
            // This round beats the stored best outright: overwrite every
            // stat along with the merged set.
            (
                PlayerRow {
                    name: stats.name.clone(),
                    mode: stats.mode,
                    best_score: stats.raw_score,
                    speed: stats.speed,
                    entropy: stats.entropy,
                    ranking: candidate,
                    profiles: merged.clone(),
                    updated_at,
                },
                true,
            )
        } else if merged.len() > prior.len() {
            // Lower-scoring round that still unlocked profiles: recompute
            // the best run's own stats with the new cumulative count.
            let boosted = ranking_score(
                existing.best_score,
                existing.entropy,
                existing.speed,
                merged.len(),
            );
            (
                PlayerRow {
                    ranking: boosted.max(existing.ranking),
                    profiles: merged.clone(),
                    updated_at,
                    ..existing.clone()
                },
                false,
            )
        } else {
            // Nothing changed; re-persisting the identical row keeps its
            // original timestamp so tie-breaks are unaffected.
            (existing.clone(), false)
        };

        self.store.upsert(&row)?;
        self.ranking
            .write_through(stats.mode, &stats.name, row.ranking, row.is_flagged());
        Ok(MergeOutcome {
            round_ranking: candidate,
            merged_profiles: merged,
            is_personal_best,
            all_time_best: row.ranking,
            prior_profiles: prior,
            persisted: true,
        })
    }

    /// Fallback when the durable store is unreachable: score the round from
    /// its own stats alone and skip the cache update.
    fn degraded_outcome(&self, stats: &RoundStats) -> MergeOutcome {
        let round_set: BTreeSet<String> = stats.profiles.iter().cloned().collect();
        let ranking = self.round_ranking(stats, round_set.len());
        MergeOutcome {
            round_ranking: ranking,
            merged_profiles: round_set.clone(),
            is_personal_best: false,
            all_time_best: ranking,
            prior_profiles: BTreeSet::new(),
            persisted: false,
        }
    }

    fn round_ranking(&self, stats: &RoundStats, profile_count: usize) -> i64 {
        ranking_score(stats.raw_score, stats.entropy, stats.speed, profile_count)
    }
}
