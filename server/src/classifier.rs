//! Boundary to the behavioral classifier.
//!
//! The classifier consumes a finished session's key history and labels the
//! round with profile titles, an entropy value and a flagged verdict. The
//! heuristic rule table lives outside this crate; what matters here is the
//! seam, so the pipeline and ledger can be exercised against any
//! implementation.

use shared::{GameMode, ABUSE_SENTINEL};
use std::collections::HashSet;

/// Result of classifying one finished round.
#[derive(Debug, Clone)]
pub struct Verdict {
    /// Behavioral profile titles unlocked by this round's input pattern.
    pub profiles: Vec<String>,
    /// 0-100 measure of input variety.
    pub entropy: u8,
    /// A flagged round skips the durable write and cache update entirely.
    pub is_flagged: bool,
}

pub trait Classifier: Send + Sync {
    fn classify(&self, key_history: &[String], mode: GameMode) -> Verdict;
}

/// Minimal built-in classifier: flags any history carrying the abuse
/// sentinel and derives entropy from label variety. Unlocks no profiles;
/// the full rule table is an external collaborator.
pub struct SentinelClassifier;

impl Classifier for SentinelClassifier {
    fn classify(&self, key_history: &[String], _mode: GameMode) -> Verdict {
        let is_flagged = key_history.iter().any(|k| k == ABUSE_SENTINEL);
        let real: Vec<&String> = key_history
            .iter()
            .filter(|k| k.as_str() != ABUSE_SENTINEL)
            .collect();
        let distinct: HashSet<&str> = real.iter().map(|k| k.as_str()).collect();
        let entropy = if real.is_empty() {
            0
        } else {
            ((distinct.len() * 100) / real.len()).min(100) as u8
        };
        Verdict {
            profiles: Vec::new(),
            entropy,
            is_flagged,
        }
    }
}
