//! Per-connection game sessions and the process-wide session/cooldown stores.
//!
//! A session is owned exclusively by the [`SessionStore`] while active and is
//! only ever mutated through it, so per-connection serialization is enough to
//! keep its fields consistent. Sessions are destroyed exactly once, at
//! disconnect or round termination, and never revived.

use log::{debug, info};
use rand::distributions::Alphanumeric;
use rand::Rng;
use shared::{GameMode, ABUSE_SENTINEL};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tokio::task::AbortHandle;

/// Connection identity assigned by the network edge.
pub type ConnId = u64;

/// Tagged session lifecycle state. All termination paths funnel through the
/// two `end_*` transitions, which are idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Active,
    EndedNormal,
    EndedForced,
}

/// One timed play attempt by one connection.
#[derive(Debug)]
pub struct GameSession {
    pub conn: ConnId,
    /// Sanitized display name (see `shared::sanitize_name`).
    pub name: String,
    pub mode: GameMode,
    /// Random per-round token; every batch must echo it back.
    pub token: String,
    /// Monotonically non-decreasing sum of accepted batch lengths.
    pub score: u32,
    pub state: SessionState,
    /// Milliseconds on the service clock at activation.
    pub started_at: u64,
    /// Rate-limiter bookkeeping: when the previous batch arrived.
    pub last_batch_at: Option<u64>,
    /// Accumulated anti-cheat strikes; never decays within a round.
    pub violations: u32,
    /// Ordered labels of admitted inputs, consumed by the classifier.
    pub key_history: Vec<String>,
    /// Forced-termination backstop task, aborted on any end transition.
    pub backstop: Option<AbortHandle>,
}

fn mint_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect()
}

impl GameSession {
    pub fn new(conn: ConnId, name: String, mode: GameMode) -> Self {
        Self {
            conn,
            name,
            mode,
            token: String::new(),
            score: 0,
            state: SessionState::Created,
            started_at: 0,
            last_batch_at: None,
            violations: 0,
            key_history: Vec::new(),
            backstop: None,
        }
    }

    /// CREATED -> ACTIVE: mints a fresh session token and records the round
    /// start time. Returns the token the client must echo on every batch.
    pub fn activate(&mut self, now_ms: u64) -> String {
        debug_assert_eq!(self.state, SessionState::Created);
        self.token = mint_token();
        self.started_at = now_ms;
        self.state = SessionState::Active;
        self.token.clone()
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    pub fn elapsed_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.started_at)
    }

    /// ACTIVE -> ENDED_NORMAL. Returns false if the session had already
    /// ended, making double termination a no-op.
    pub fn end_normal(&mut self) -> bool {
        if !self.is_active() {
            return false;
        }
        self.state = SessionState::EndedNormal;
        self.cancel_backstop();
        true
    }

    /// ACTIVE -> ENDED_FORCED: appends the abuse sentinel so the classifier
    /// can tell this round was terminated for cause. Idempotent.
    pub fn end_forced(&mut self) -> bool {
        if !self.is_active() {
            return false;
        }
        self.state = SessionState::EndedForced;
        self.key_history.push(ABUSE_SENTINEL.to_string());
        self.cancel_backstop();
        true
    }

    /// Cancellation is unconditional on every termination path so a stale
    /// timer can never fire against a reused connection id.
    fn cancel_backstop(&mut self) {
        if let Some(handle) = self.backstop.take() {
            handle.abort();
        }
    }
}

impl Drop for GameSession {
    fn drop(&mut self) {
        self.cancel_backstop();
    }
}

/// Process-wide session and cooldown maps, constructed once and shared by
/// reference so tests get fresh instances instead of true globals.
pub struct SessionStore {
    sessions: RwLock<HashMap<ConnId, GameSession>>,
    cooldowns: RwLock<HashMap<ConnId, u64>>,
    cooldown_ms: u64,
}

impl SessionStore {
    pub fn new(cooldown_ms: u64) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            cooldowns: RwLock::new(HashMap::new()),
            cooldown_ms,
        }
    }

    /// Starts a round for a connection. Silently refuses (returns `None`,
    /// no token minted) while the connection's cooldown is unexpired or a
    /// session already exists, which doubles as duplicate-click protection.
    pub async fn begin(
        &self,
        conn: ConnId,
        name: String,
        mode: GameMode,
        now_ms: u64,
    ) -> Option<String> {
        if let Some(ended_at) = self.cooldowns.read().await.get(&conn) {
            if now_ms.saturating_sub(*ended_at) < self.cooldown_ms {
                debug!("Round creation for conn {} ignored: cooldown active", conn);
                return None;
            }
        }

        let mut sessions = self.sessions.write().await;
        if sessions.get(&conn).is_some_and(|s| s.is_active()) {
            debug!("Round creation for conn {} ignored: session in progress", conn);
            return None;
        }

        let mut session = GameSession::new(conn, name, mode);
        let token = session.activate(now_ms);
        info!("Round started for conn {} ({:?})", conn, mode);
        sessions.insert(conn, session);
        Some(token)
    }

    /// Attaches the forced-termination backstop task to a live session.
    pub async fn arm_backstop(&self, conn: ConnId, handle: AbortHandle) {
        match self.sessions.write().await.get_mut(&conn) {
            Some(session) if session.is_active() => session.backstop = Some(handle),
            // Session ended between spawn and arm; kill the timer now.
            _ => handle.abort(),
        }
    }

    /// Runs `f` against the connection's session under the write lock.
    pub async fn with_mut<R>(
        &self,
        conn: ConnId,
        f: impl FnOnce(&mut GameSession) -> R,
    ) -> Option<R> {
        self.sessions.write().await.get_mut(&conn).map(f)
    }

    /// Removes the session at round end and starts the connection's
    /// cooldown. The caller takes ownership for final scoring.
    pub async fn finish(&self, conn: ConnId, now_ms: u64) -> Option<GameSession> {
        let session = self.sessions.write().await.remove(&conn)?;
        self.cooldowns.write().await.insert(conn, now_ms);
        Some(session)
    }

    /// Disconnect at any state: removes both session and cooldown. An
    /// abandoned in-progress round persists nothing.
    pub async fn drop_connection(&self, conn: ConnId) -> bool {
        let existed = self.sessions.write().await.remove(&conn).is_some();
        self.cooldowns.write().await.remove(&conn);
        if existed {
            info!("Conn {} disconnected mid-round, session discarded", conn);
        }
        existed
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    #[cfg(test)]
    pub async fn token_of(&self, conn: ConnId) -> Option<String> {
        self.sessions
            .read()
            .await
            .get(&conn)
            .map(|s| s.token.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> GameSession {
        let mut s = GameSession::new(1, "TESTER".to_string(), GameMode::Classic);
        s.activate(1_000);
        s
    }

    #[test]
    fn test_activation_mints_token() {
        let mut s = GameSession::new(1, "A".to_string(), GameMode::Classic);
        assert_eq!(s.state, SessionState::Created);
        let token = s.activate(500);
        assert_eq!(token.len(), 16);
        assert_eq!(s.started_at, 500);
        assert!(s.is_active());
    }

    #[test]
    fn test_tokens_are_unique_per_round() {
        let a = session().token.clone();
        let b = session().token.clone();
        assert_ne!(a, b);
    }

    #[test]
    fn test_end_normal_is_idempotent() {
        let mut s = session();
        assert!(s.end_normal());
        assert!(!s.end_normal());
        assert!(!s.end_forced());
        assert_eq!(s.state, SessionState::EndedNormal);
    }

    #[test]
    fn test_end_forced_appends_sentinel_once() {
        let mut s = session();
        assert!(s.end_forced());
        assert!(!s.end_forced());
        assert_eq!(s.state, SessionState::EndedForced);
        assert_eq!(
            s.key_history
                .iter()
                .filter(|k| k.as_str() == ABUSE_SENTINEL)
                .count(),
            1
        );
    }

    #[test]
    fn test_elapsed_saturates() {
        let s = session();
        assert_eq!(s.elapsed_ms(500), 0);
        assert_eq!(s.elapsed_ms(3_500), 2_500);
    }

    #[tokio::test]
    async fn test_begin_and_finish_round() {
        let store = SessionStore::new(3_000);
        let token = store
            .begin(7, "A".to_string(), GameMode::Classic, 0)
            .await
            .unwrap();
        assert_eq!(token.len(), 16);
        assert_eq!(store.session_count().await, 1);

        let session = store.finish(7, 5_000).await.unwrap();
        assert_eq!(session.conn, 7);
        assert_eq!(store.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_begin_during_active_session_is_ignored() {
        let store = SessionStore::new(3_000);
        assert!(store
            .begin(7, "A".to_string(), GameMode::Classic, 0)
            .await
            .is_some());
        assert!(store
            .begin(7, "A".to_string(), GameMode::Classic, 100)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_cooldown_blocks_then_expires() {
        let store = SessionStore::new(3_000);
        let first = store
            .begin(7, "A".to_string(), GameMode::Classic, 0)
            .await
            .unwrap();
        store.finish(7, 10_000).await.unwrap();

        // 1s into the cooldown: ignored, no token.
        assert!(store
            .begin(7, "A".to_string(), GameMode::Classic, 11_000)
            .await
            .is_none());

        // Past the cooldown: a fresh round with a fresh token.
        let second = store
            .begin(7, "A".to_string(), GameMode::Classic, 13_000)
            .await
            .unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_disconnect_clears_session_and_cooldown() {
        let store = SessionStore::new(3_000);
        store
            .begin(7, "A".to_string(), GameMode::Classic, 0)
            .await
            .unwrap();
        store.finish(7, 1_000).await.unwrap();
        store.drop_connection(7).await;

        // Cooldown was wiped with the connection, so a new round starts
        // immediately.
        assert!(store
            .begin(7, "A".to_string(), GameMode::Classic, 1_001)
            .await
            .is_some());
    }

    #[tokio::test]
    async fn test_cooldowns_are_per_connection() {
        let store = SessionStore::new(3_000);
        store
            .begin(1, "A".to_string(), GameMode::Classic, 0)
            .await
            .unwrap();
        store.finish(1, 100).await.unwrap();

        assert!(store
            .begin(2, "B".to_string(), GameMode::Classic, 200)
            .await
            .is_some());
    }
}
