//! Composite ranking score formula.
//!
//! Pure leaf: everything the leaderboard orders by funnels through this one
//! function so the weighting lives in exactly one place.

/// Weight of one raw accepted key.
const SCORE_WEIGHT: i64 = 10;
/// Weight of one entropy point (0-100 scale from the classifier).
const ENTROPY_WEIGHT: i64 = 15;
/// Weight of one key-per-second of sustained speed.
const SPEED_WEIGHT: f64 = 5.0;
/// Flat bonus per unlocked behavioral profile.
const PROFILE_BONUS: i64 = 100;

/// Computes the composite ranking score for one round.
///
/// `raw_score` is the server-tracked accepted key count, `entropy` the 0-100
/// classifier value, `speed` the sustained keys-per-second, and
/// `profile_count` the size of the player's cumulative profile set. The
/// result is monotone in every argument.
pub fn ranking_score(raw_score: u32, entropy: u8, speed: f64, profile_count: usize) -> i64 {
    let speed_term = (speed.max(0.0) * SPEED_WEIGHT).round() as i64;
    raw_score as i64 * SCORE_WEIGHT
        + entropy.min(100) as i64 * ENTROPY_WEIGHT
        + speed_term
        + profile_count as i64 * PROFILE_BONUS
}
