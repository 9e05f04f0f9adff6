//! Batch admission pipeline.
//!
//! Every inbound key batch runs an ordered sequence of checks against its
//! live session. Any stage may silently drop the batch: a forged or
//! malformed batch gets no feedback at all, which denies an attacker the
//! calibration signal an explicit rejection would leak. Rate abuse accrues
//! strikes instead of failing fast and only escalates to forced
//! termination past [`VIOLATION_LIMIT`].

use crate::session::GameSession;
use log::{debug, warn};
use shared::{
    BURST_ALLOWANCE, MAX_BATCH_KEYS, MAX_KEYS_PER_SECOND, MIN_BATCH_INTERVAL_MS, STALE_GRACE_MS,
    VIOLATION_LIMIT,
};

/// One decoded client batch. A bare key sequence on the wire decodes with
/// `token: None` and is treated exactly like a mismatched token.
#[derive(Debug, Clone)]
pub struct KeyBatch {
    pub keys: Vec<String>,
    pub token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Session missing, not yet active, or already ended.
    Inactive,
    /// Token missing or not equal to the session's token.
    TokenMismatch,
    /// Arrived after `round_duration + STALE_GRACE_MS`.
    Stale,
    /// The elapsed-time key budget left no headroom.
    BudgetExhausted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Silently dropped; the client sees nothing.
    Dropped(DropReason),
    /// Some prefix of the batch was credited; `score` is the new total.
    Accepted { credited: u32, score: u32 },
    /// The strike threshold was crossed; the session is now ended-forced
    /// with the abuse sentinel appended.
    Terminated,
}

/// Maximum total keys a session may have been credited by `elapsed_ms` into
/// a round. Whole-second granularity: the budget steps up once per second.
pub fn allowed_total(elapsed_ms: u64) -> u32 {
    BURST_ALLOWANCE + (elapsed_ms / 1_000) as u32 * MAX_KEYS_PER_SECOND
}

/// Runs the admission pipeline for one batch, mutating the session's score
/// and violation counters. Termination (when it happens) occurs in the same
/// call that detects it.
pub fn process_batch(session: &mut GameSession, batch: &KeyBatch, now_ms: u64) -> BatchOutcome {
    // Stage 1: the session must be live. Shape is enforced at decode time
    // and origin at connection time, so only liveness is left here.
    if !session.is_active() {
        return BatchOutcome::Dropped(DropReason::Inactive);
    }

    // Stage 2: token equality. No side effects on mismatch, so probing
    // with stolen or guessed tokens teaches the attacker nothing.
    match &batch.token {
        Some(token) if *token == session.token => {}
        _ => {
            debug!("Conn {}: batch dropped, token mismatch", session.conn);
            return BatchOutcome::Dropped(DropReason::TokenMismatch);
        }
    }

    // Stage 3: staleness. Late flushes inside the grace window are fine;
    // anything later is indistinguishable from replay.
    let elapsed = session.elapsed_ms(now_ms);
    if elapsed > session.mode.round_duration_ms() + STALE_GRACE_MS {
        debug!("Conn {}: batch dropped, {}ms stale", session.conn, elapsed);
        return BatchOutcome::Dropped(DropReason::Stale);
    }

    // Stage 4: elapsed-budget ceiling. No headroom means the client is
    // reporting more keys than a human could have produced.
    let headroom = allowed_total(elapsed).saturating_sub(session.score);
    if headroom == 0 {
        session.violations += 1;
        warn!(
            "Conn {}: key budget exhausted at score {} ({} strikes)",
            session.conn, session.score, session.violations
        );
        if session.violations >= VIOLATION_LIMIT {
            return terminate(session);
        }
        return BatchOutcome::Dropped(DropReason::BudgetExhausted);
    }

    // Stage 5: batch frequency. Accrues a strike but never drops the batch
    // itself, so a legitimate rapid final flush is counted, not rejected.
    if let Some(last) = session.last_batch_at {
        if now_ms.saturating_sub(last) < MIN_BATCH_INTERVAL_MS {
            session.violations += 1;
            warn!(
                "Conn {}: batches too frequent ({} strikes)",
                session.conn, session.violations
            );
            if session.violations >= VIOLATION_LIMIT {
                return terminate(session);
            }
        }
    }
    session.last_batch_at = Some(now_ms);

    // Stage 6: admission. Cap the claimed length first, then credit no
    // more than the remaining headroom.
    let capped = batch.keys.len().min(MAX_BATCH_KEYS);
    let credited = (capped as u32).min(headroom);
    session.score += credited;
    session
        .key_history
        .extend(batch.keys[..credited as usize].iter().cloned());

    BatchOutcome::Accepted {
        credited,
        score: session.score,
    }
}

fn terminate(session: &mut GameSession) -> BatchOutcome {
    session.end_forced();
    warn!(
        "Conn {}: session force-terminated at score {}",
        session.conn, session.score
    );
    BatchOutcome::Terminated
}
