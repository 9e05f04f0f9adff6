use serde::{Deserialize, Serialize};

/// Free allowance of keys a session may report before the elapsed-time
/// budget starts mattering. Covers client-side batching jitter at round start.
pub const BURST_ALLOWANCE: u32 = 300;
/// Physically plausible human maximum, in keys per second.
pub const MAX_KEYS_PER_SECOND: u32 = 300;
/// Hard cap on how many keys a single batch may claim.
pub const MAX_BATCH_KEYS: usize = 200;
/// Batches arriving closer together than this accrue a violation strike.
pub const MIN_BATCH_INTERVAL_MS: u64 = 10;
/// Strikes at which a session is forcibly terminated.
pub const VIOLATION_LIMIT: u32 = 3;
/// Minimum gap between two rounds on the same connection.
pub const ROUND_COOLDOWN_MS: u64 = 3_000;
/// Grace period after round end during which late batches are still dropped
/// silently instead of being an error.
pub const STALE_GRACE_MS: u64 = 1_000;
/// The backstop timer fires this long after the nominal round duration.
pub const BACKSTOP_GRACE_MS: u64 = 3_000;
/// Global "leaderboard changed" pushes are throttled to one per interval.
pub const BROADCAST_THROTTLE_MS: u64 = 2_000;

pub const MAX_NAME_LEN: usize = 12;
pub const DEFAULT_NAME: &str = "ANONYMOUS";

/// Synthetic key-history entry appended when abuse is detected. Never a real
/// key label, so the behavioral classifier can tell forced rounds apart.
pub const ABUSE_SENTINEL: &str = "__ABUSE__";
/// Profile title whose presence in a player's cumulative set demotes them to
/// a negative leaderboard score.
pub const FLAGGED_PROFILE: &str = "CHEATER";

/// Game modes, fixing the round duration and therefore the key budget.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GameMode {
    Classic,
    Blitz,
}

impl GameMode {
    pub fn round_duration_ms(&self) -> u64 {
        match self {
            GameMode::Classic => 30_000,
            GameMode::Blitz => 10_000,
        }
    }

    /// Maximum number of keys any session in this mode could legitimately
    /// report over a full round.
    pub fn max_keys(&self) -> u32 {
        BURST_ALLOWANCE + (self.round_duration_ms() / 1_000) as u32 * MAX_KEYS_PER_SECOND
    }

    /// Stable identifier used as the durable-store key and cache namespace.
    pub fn as_str(&self) -> &'static str {
        match self {
            GameMode::Classic => "classic",
            GameMode::Blitz => "blitz",
        }
    }

    pub fn parse(s: &str) -> Option<GameMode> {
        match s {
            "classic" => Some(GameMode::Classic),
            "blitz" => Some(GameMode::Blitz),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum Packet {
    // Client -> server
    Connect {
        origin: String,
        name: String,
        mode: GameMode,
    },
    KeyBatch {
        keys: Vec<String>,
        /// A bare key sequence without a token is decoded as `None` and
        /// treated exactly like a token mismatch.
        token: Option<String>,
    },
    RoundOver {
        /// Read but never trusted; the server's own tracked score is the
        /// only value that is persisted.
        reported_score: u32,
    },
    Disconnect,

    // Server -> client
    RoundStarted {
        token: String,
        duration_ms: u64,
    },
    ScoreUpdate {
        score: u32,
    },
    RoundResult {
        score: u32,
        ranking_score: i64,
        is_personal_best: bool,
        all_time_best: i64,
        unlocked_profiles: Vec<String>,
    },
    LeaderboardChanged,
}

/// Sanitizes an untrusted display name: HTML tags stripped, charset reduced
/// to alphanumerics plus space/underscore/hyphen, uppercased, truncated to
/// [`MAX_NAME_LEN`]. Anything left empty becomes [`DEFAULT_NAME`].
pub fn sanitize_name(raw: &str) -> String {
    let mut cleaned = String::with_capacity(raw.len());
    let mut in_tag = false;
    for c in raw.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if in_tag => {}
            _ if c.is_ascii_alphanumeric() || c == ' ' || c == '_' || c == '-' => {
                cleaned.push(c.to_ascii_uppercase());
            }
            _ => {}
        }
    }
    let trimmed: String = cleaned.trim().chars().take(MAX_NAME_LEN).collect();
    let trimmed = trimmed.trim_end().to_string();
    if trimmed.is_empty() {
        DEFAULT_NAME.to_string()
    } else {
        trimmed
    }
}
