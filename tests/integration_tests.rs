//! Integration tests for the reflex-game backend
//!
//! These tests validate cross-component behavior: session lifecycle through
//! the anti-cheat pipeline, ledger merges, and ranking consistency.

use server::anticheat::KeyBatch;
use server::classifier::SentinelClassifier;
use server::ledger::{RoundStats, ScoreLedger};
use server::ranking::RankingService;
use server::service::{GameService, PushEvent};
use assert_approx_eq::assert_approx_eq;
use server::store::PlayerStore;
use shared::{GameMode, Packet, BURST_ALLOWANCE, MIN_BATCH_INTERVAL_MS};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Duration;

fn new_service() -> (Arc<GameService>, mpsc::UnboundedReceiver<PushEvent>) {
    let store = Arc::new(PlayerStore::open_in_memory().unwrap());
    GameService::new(store, Box::new(SentinelClassifier))
}

fn valid_batch(token: &str, n: usize) -> KeyBatch {
    KeyBatch {
        keys: (0..n).map(|i| format!("k{}", i % 26)).collect(),
        token: Some(token.to_string()),
    }
}

async fn drain(rx: &mut mpsc::UnboundedReceiver<PushEvent>) -> Vec<PushEvent> {
    tokio::task::yield_now().await;
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// END-TO-END ROUND SCENARIOS
mod round_scenarios {
    use super::*;

    /// A fresh player's first clean round lands on the leaderboard as an
    /// unconditional personal best.
    #[tokio::test(start_paused = true)]
    async fn fresh_player_clean_round() {
        let (service, mut rx) = new_service();
        let token = service
            .create_session(1, "fresh", GameMode::Classic)
            .await
            .expect("no cooldown on a fresh connection");

        tokio::time::sleep(Duration::from_secs(2)).await;
        service.submit_batch(1, valid_batch(&token, 10)).await;
        service.end_session(1, 0).await;

        let events = drain(&mut rx).await;
        let result = events
            .iter()
            .find_map(|e| match e {
                PushEvent::RoundResult { result, .. } => Some(result.clone()),
                _ => None,
            })
            .expect("round result pushed");
        assert_eq!(result.score, 10);
        assert!(result.is_personal_best);

        let page = service.get_leaderboard_page(GameMode::Classic, 1, 10, None);
        assert_eq!(page.total, 1);
        assert_eq!(page.entries[0].row.name, "FRESH");
        assert_eq!(page.entries[0].row.best_score, 10);
    }

    /// A flood of batches gets only the budget's worth, then strikes
    /// escalate to forced termination and nothing is persisted.
    #[tokio::test(start_paused = true)]
    async fn flood_is_clamped_and_terminated() {
        let (service, mut rx) = new_service();
        let token = service
            .create_session(1, "flood", GameMode::Classic)
            .await
            .unwrap();

        for _ in 0..10 {
            service.submit_batch(1, valid_batch(&token, 50)).await;
            tokio::time::sleep(Duration::from_millis(MIN_BATCH_INTERVAL_MS)).await;
        }

        let events = drain(&mut rx).await;
        let result = events
            .iter()
            .find_map(|e| match e {
                PushEvent::RoundResult { result, .. } => Some(result.clone()),
                _ => None,
            })
            .expect("forced termination still answers the client");

        // Only the elapsed-budget's worth of the 500 reported keys counted.
        assert_eq!(result.score, BURST_ALLOWANCE);
        assert!(!result.is_personal_best);
        assert_eq!(service.active_sessions().await, 0);
        // Ranking and cache skipped for the flagged run.
        let page = service.get_leaderboard_page(GameMode::Classic, 1, 10, None);
        assert_eq!(page.total, 0);
    }

    /// A retry inside the cooldown is ignored; after it expires a new
    /// round starts with a fresh token.
    #[tokio::test(start_paused = true)]
    async fn cooldown_blocks_immediate_retry() {
        let (service, _rx) = new_service();
        let first = service
            .create_session(1, "again", GameMode::Blitz)
            .await
            .unwrap();
        service.end_session(1, 0).await;

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(
            service.create_session(1, "again", GameMode::Blitz).await.is_none(),
            "1s after round end the cooldown must still refuse"
        );

        tokio::time::sleep(Duration::from_secs(3)).await;
        let second = service
            .create_session(1, "again", GameMode::Blitz)
            .await
            .expect("cooldown expired");
        assert_ne!(first, second, "tokens are minted per round");
    }

    /// A batch with the wrong token is a no-op regardless of content.
    #[tokio::test(start_paused = true)]
    async fn forged_token_changes_nothing() {
        let (service, mut rx) = new_service();
        let token = service
            .create_session(1, "honest", GameMode::Classic)
            .await
            .unwrap();

        let forged = KeyBatch {
            keys: vec!["x".to_string(); 100],
            token: Some("AAAAAAAAAAAAAAAA".to_string()),
        };
        service.submit_batch(1, forged).await;
        let bare = KeyBatch {
            keys: vec!["x".to_string(); 100],
            token: None,
        };
        service.submit_batch(1, bare).await;

        assert!(
            drain(&mut rx).await.is_empty(),
            "no score push for rejected batches"
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        service.submit_batch(1, valid_batch(&token, 5)).await;
        service.end_session(1, 0).await;
        let events = drain(&mut rx).await;
        let result = events
            .iter()
            .find_map(|e| match e {
                PushEvent::RoundResult { result, .. } => Some(result.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(result.score, 5, "forged batches contributed nothing");
    }

    /// The client-reported end-of-round score is never persisted.
    #[tokio::test(start_paused = true)]
    async fn reported_score_is_ignored() {
        let (service, _rx) = new_service();
        let token = service
            .create_session(1, "liar", GameMode::Classic)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        service.submit_batch(1, valid_batch(&token, 7)).await;
        service.end_session(1, 1_000_000).await;

        let page = service.get_leaderboard_page(GameMode::Classic, 1, 10, None);
        assert_eq!(page.entries[0].row.best_score, 7);
    }

    /// Disconnecting mid-round persists nothing and clears the cooldown.
    #[tokio::test(start_paused = true)]
    async fn disconnect_abandons_round() {
        let (service, _rx) = new_service();
        let token = service
            .create_session(1, "ghost", GameMode::Classic)
            .await
            .unwrap();
        service.submit_batch(1, valid_batch(&token, 50)).await;
        service.on_disconnect(1).await;

        assert_eq!(service.active_sessions().await, 0);
        assert_eq!(service.get_leaderboard_page(GameMode::Classic, 1, 10, None).total, 0);
        assert!(service.create_session(1, "ghost", GameMode::Classic).await.is_some());
    }
}

/// LEDGER MERGE SCENARIOS
mod ledger_scenarios {
    use super::*;

    fn ledger_fixture() -> (ScoreLedger, Arc<PlayerStore>, Arc<RankingService>) {
        let store = Arc::new(PlayerStore::open_in_memory().unwrap());
        let ranking = Arc::new(RankingService::in_memory(Arc::clone(&store)));
        (
            ScoreLedger::new(Arc::clone(&store), Arc::clone(&ranking)),
            store,
            ranking,
        )
    }

    fn round(name: &str, raw_score: u32, profiles: &[&str]) -> RoundStats {
        RoundStats {
            name: name.to_string(),
            mode: GameMode::Classic,
            raw_score,
            speed: 10.0,
            entropy: 50,
            profiles: profiles.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// A lower-scoring run that unlocks new profiles boosts the stored
    /// ranking on the old run's stats, exactly 100 per new profile.
    #[test]
    fn profile_unlock_boosts_old_best() {
        let (ledger, store, _) = ledger_fixture();
        ledger.merge_round(&round("VET", 400, &["A", "B", "C"]), 1);
        let before = store.get(GameMode::Classic, "VET").unwrap().unwrap();

        let outcome = ledger.merge_round(&round("VET", 5, &["D", "E"]), 2);
        assert!(!outcome.is_personal_best);

        let after = store.get(GameMode::Classic, "VET").unwrap().unwrap();
        assert_eq!(after.ranking, before.ranking + 200);
        assert_eq!(after.best_score, before.best_score);
        assert_approx_eq!(after.speed, before.speed);
        assert_eq!(after.entropy, before.entropy);
        assert_eq!(after.profiles.len(), 5);
    }

    /// Profile sets only ever grow, and the merge reports what was new.
    #[test]
    fn cumulative_profiles_monotone() {
        let (ledger, _, _) = ledger_fixture();
        let mut sizes = Vec::new();
        for profiles in [&["A"][..], &[][..], &["A", "B"][..], &["C"][..]] {
            let outcome = ledger.merge_round(&round("VET", 10, profiles), 1);
            sizes.push(outcome.merged_profiles.len());
        }
        assert_eq!(sizes, vec![1, 1, 2, 3]);
    }

    /// Cache-based and durable-fallback rank lookups agree on ordering.
    #[test]
    fn cache_and_durable_ranks_agree() {
        let (ledger, store, ranking) = ledger_fixture();
        ledger.merge_round(&round("STRONG", 500, &[]), 1);
        ledger.merge_round(&round("WEAK", 50, &[]), 2);

        let cached_strong = ranking.rank_of_player(GameMode::Classic, "STRONG").unwrap();
        let cached_weak = ranking.rank_of_player(GameMode::Classic, "WEAK").unwrap();
        let durable_strong = store
            .rank_of_player(GameMode::Classic, "STRONG")
            .unwrap()
            .unwrap();
        let durable_weak = store
            .rank_of_player(GameMode::Classic, "WEAK")
            .unwrap()
            .unwrap();

        assert_eq!(cached_strong, durable_strong);
        assert_eq!(cached_weak, durable_weak);
        assert!(cached_strong < cached_weak);
    }

    /// Modes are fully independent leaderboards.
    #[test]
    fn modes_are_isolated() {
        let (ledger, _, ranking) = ledger_fixture();
        ledger.merge_round(&round("SOLO", 100, &[]), 1);

        let classic = ranking.leaderboard_page(GameMode::Classic, 1, 10, None);
        let blitz = ranking.leaderboard_page(GameMode::Blitz, 1, 10, None);
        assert_eq!(classic.total, 1);
        assert_eq!(blitz.total, 0);
    }
}

/// WIRE PROTOCOL TESTS
mod protocol_tests {
    use super::*;

    /// Tests packet serialization round-trip for the full protocol surface
    #[tokio::test]
    async fn packet_serialization_roundtrip() {
        let test_packets = vec![
            Packet::Connect {
                origin: "http://localhost:3000".to_string(),
                name: "alice".to_string(),
                mode: GameMode::Classic,
            },
            Packet::KeyBatch {
                keys: vec!["a".to_string()],
                token: Some("t".to_string()),
            },
            Packet::RoundOver { reported_score: 99 },
            Packet::Disconnect,
            Packet::RoundStarted {
                token: "t".to_string(),
                duration_ms: 30_000,
            },
            Packet::ScoreUpdate { score: 10 },
            Packet::LeaderboardChanged,
        ];

        for packet in test_packets {
            let serialized = bincode::serialize(&packet).unwrap();
            let deserialized: Packet = bincode::deserialize(&serialized).unwrap();

            match (&packet, &deserialized) {
                (Packet::Connect { .. }, Packet::Connect { .. }) => {}
                (Packet::KeyBatch { .. }, Packet::KeyBatch { .. }) => {}
                (Packet::RoundOver { .. }, Packet::RoundOver { .. }) => {}
                (Packet::Disconnect, Packet::Disconnect) => {}
                (Packet::RoundStarted { .. }, Packet::RoundStarted { .. }) => {}
                (Packet::ScoreUpdate { .. }, Packet::ScoreUpdate { .. }) => {}
                (Packet::LeaderboardChanged, Packet::LeaderboardChanged) => {}
                _ => panic!("Packet type mismatch after roundtrip"),
            }
        }
    }
}
