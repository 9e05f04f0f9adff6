//! The game service: one explicit object owning the session store, ledger,
//! ranking subsystem and classifier.
//!
//! Each session is mutated only by messages from its own connection, so the
//! per-connection serialization the network edge provides is all the
//! synchronization a single session needs. Score acknowledgements flow
//! through an unbounded push channel so the input path never waits on the
//! durable store.

use crate::anticheat::{process_batch, BatchOutcome, KeyBatch};
use crate::classifier::Classifier;
use crate::ledger::{RoundStats, ScoreLedger};
use crate::ranking::{LeaderboardPage, RankingService};
use crate::score::ranking_score;
use crate::session::{ConnId, SessionStore};
use crate::store::PlayerStore;
use crate::utils::get_timestamp;
use log::{debug, info, warn};
use shared::{
    sanitize_name, GameMode, BACKSTOP_GRACE_MS, MAX_KEYS_PER_SECOND, ROUND_COOLDOWN_MS,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};

/// Server-initiated pushes, drained by the network edge. Best-effort:
/// clients can always pull current state instead.
#[derive(Debug)]
pub enum PushEvent {
    Score { conn: ConnId, score: u32 },
    RoundResult { conn: ConnId, result: RoundSummary },
    LeaderboardChanged,
}

/// End-of-round response for the originating connection.
#[derive(Debug, Clone)]
pub struct RoundSummary {
    pub score: u32,
    pub ranking_score: i64,
    pub is_personal_best: bool,
    pub all_time_best: i64,
    pub unlocked_profiles: Vec<String>,
}

pub struct GameService {
    sessions: SessionStore,
    ledger: ScoreLedger,
    ranking: Arc<RankingService>,
    store: Arc<PlayerStore>,
    classifier: Box<dyn Classifier>,
    /// Service-relative clock; all session timing is measured against it.
    epoch: Instant,
    pushes: mpsc::UnboundedSender<PushEvent>,
}

impl GameService {
    pub fn new(
        store: Arc<PlayerStore>,
        classifier: Box<dyn Classifier>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<PushEvent>) {
        let ranking = Arc::new(RankingService::in_memory(Arc::clone(&store)));
        if let Err(e) = ranking.rebuild() {
            warn!("Initial ranking cache build failed: {}", e);
        }
        let (pushes, rx) = mpsc::unbounded_channel();
        let service = Arc::new(Self {
            sessions: SessionStore::new(ROUND_COOLDOWN_MS),
            ledger: ScoreLedger::new(Arc::clone(&store), Arc::clone(&ranking)),
            ranking,
            store,
            classifier,
            epoch: Instant::now(),
            pushes,
        });
        (service, rx)
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Starts a round for a connection. Returns the session token, or
    /// `None` when the cooldown (or an in-progress round) silently refuses
    /// the request. Arms the forced-termination backstop timer, which fires
    /// independently of any future client message.
    pub async fn create_session(
        self: &Arc<Self>,
        conn: ConnId,
        raw_name: &str,
        mode: GameMode,
    ) -> Option<String> {
        let name = sanitize_name(raw_name);
        let now = self.now_ms();
        let token = self.sessions.begin(conn, name, mode, now).await?;

        let handle = {
            let service = Arc::clone(self);
            let expected = token.clone();
            tokio::spawn(async move {
                let deadline = mode.round_duration_ms() + BACKSTOP_GRACE_MS;
                tokio::time::sleep(Duration::from_millis(deadline)).await;
                service.backstop_fire(conn, &expected).await;
            })
        };
        self.sessions.arm_backstop(conn, handle.abort_handle()).await;
        Some(token)
    }

    /// Backstop path: terminate the round if the same session is somehow
    /// still around. The token check keeps a stale timer from touching a
    /// reused connection id.
    async fn backstop_fire(&self, conn: ConnId, expected_token: &str) {
        let matches = self
            .sessions
            .with_mut(conn, |s| s.token == expected_token)
            .await
            .unwrap_or(false);
        if matches {
            info!("Backstop timer ending round for conn {}", conn);
            self.finalize_round(conn).await;
        }
    }

    /// Fire-and-forget batch submission. Accepted batches push the new
    /// score back; everything else is silent by design.
    pub async fn submit_batch(&self, conn: ConnId, batch: KeyBatch) {
        let now = self.now_ms();
        let outcome = self
            .sessions
            .with_mut(conn, |session| process_batch(session, &batch, now))
            .await;
        match outcome {
            Some(BatchOutcome::Accepted { score, .. }) => {
                let _ = self.pushes.send(PushEvent::Score { conn, score });
            }
            Some(BatchOutcome::Terminated) => {
                self.finalize_round(conn).await;
            }
            Some(BatchOutcome::Dropped(reason)) => {
                debug!("Conn {}: batch dropped ({:?})", conn, reason);
            }
            None => {}
        }
    }

    /// Explicit round-over signal. The reported score is read and ignored;
    /// only the session's own tracked score goes downstream.
    pub async fn end_session(&self, conn: ConnId, reported_score: u32) {
        debug!(
            "Conn {} reported score {} at round end (ignored)",
            conn, reported_score
        );
        self.finalize_round(conn).await;
    }

    /// Disconnect at any state: the session and cooldown vanish and an
    /// abandoned in-progress round persists nothing.
    pub async fn on_disconnect(&self, conn: ConnId) {
        self.sessions.drop_connection(conn).await;
    }

    /// Shared tail of every termination path. Removing the session from
    /// the store makes this idempotent: a second caller finds nothing.
    async fn finalize_round(&self, conn: ConnId) {
        let now = self.now_ms();
        let Some(mut session) = self.sessions.finish(conn, now).await else {
            return;
        };
        session.end_normal();

        let elapsed_s = session
            .elapsed_ms(now)
            .min(session.mode.round_duration_ms())
            .max(1) as f64
            / 1_000.0;
        // Derived speed is capped at the plausible human maximum; a
        // near-instant round end must not inflate the speed term through a
        // tiny divisor.
        let speed = (session.score as f64 / elapsed_s).min(MAX_KEYS_PER_SECOND as f64);
        let verdict = self
            .classifier
            .classify(&session.key_history, session.mode);

        let result = if verdict.is_flagged {
            // Flagged round: no durable write, no cache update, but the
            // connection still gets a response.
            info!(
                "Conn {} ({}) flagged by classifier, round not persisted",
                conn, session.name
            );
            let ranking =
                ranking_score(session.score, verdict.entropy, speed, verdict.profiles.len());
            RoundSummary {
                score: session.score,
                ranking_score: ranking,
                is_personal_best: false,
                all_time_best: ranking,
                unlocked_profiles: verdict.profiles,
            }
        } else {
            let stats = RoundStats {
                name: session.name.clone(),
                mode: session.mode,
                raw_score: session.score,
                speed,
                entropy: verdict.entropy,
                profiles: verdict.profiles,
            };
            let outcome = self.ledger.merge_round(&stats, get_timestamp());
            if outcome.persisted && self.ranking.should_broadcast(now) {
                let _ = self.pushes.send(PushEvent::LeaderboardChanged);
            }
            let unlocked = outcome
                .merged_profiles
                .difference(&outcome.prior_profiles)
                .cloned()
                .collect();
            RoundSummary {
                score: session.score,
                ranking_score: outcome.round_ranking,
                is_personal_best: outcome.is_personal_best,
                all_time_best: outcome.all_time_best,
                unlocked_profiles: unlocked,
            }
        };
        let _ = self.pushes.send(PushEvent::RoundResult { conn, result });
    }

    /// Exact rank when a name is given and known; otherwise the rank the
    /// raw candidate score would land at.
    pub fn get_rank(&self, ranking: i64, mode: GameMode, name: Option<&str>) -> u64 {
        if let Some(name) = name {
            if let Some(rank) = self.ranking.rank_of_player(mode, name) {
                return rank;
            }
        }
        self.ranking.rank_of_score(mode, ranking)
    }

    pub fn get_leaderboard_page(
        &self,
        mode: GameMode,
        page: u64,
        page_size: u64,
        search: Option<&str>,
    ) -> LeaderboardPage {
        self.ranking.leaderboard_page(mode, page, page_size, search)
    }

    pub fn get_lifetime_total(&self) -> u64 {
        match self.store.lifetime_total() {
            Ok(total) => total,
            Err(e) => {
                warn!("Lifetime total unavailable: {}", e);
                0
            }
        }
    }

    pub async fn active_sessions(&self) -> usize {
        self.sessions.session_count().await
    }
}
