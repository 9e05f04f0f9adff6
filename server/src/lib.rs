//! # Keyrush Game Server Library
//!
//! Authoritative backend for a competitive real-time reflex game. Clients
//! are inherently untrusted: they report discrete input events in batches,
//! and this crate decides which inputs count, computes a defensible
//! composite score, and maintains a globally consistent ranked leaderboard
//! across a low-latency cache and a durable store.
//!
//! ## Core Responsibilities
//!
//! ### Input Admission
//! Every inbound key batch runs a four-stage anti-cheat pipeline
//! (shape/origin, token, staleness, rate budgets) against its live session.
//! Invalid batches are dropped silently so an attacker gets no calibration
//! feedback; rate abuse accrues strikes that escalate to forced
//! termination. The goal is raising attack cost, not cryptographic
//! impossibility.
//!
//! ### Score Keeping
//! When a round finishes, the score ledger merges the session's tracked
//! score (never the client-reported one) into the player's permanent
//! record, decides personal-best status, and maintains the cumulative
//! profile union that feeds the composite ranking formula.
//!
//! ### Ranking
//! An in-memory ranked set per mode answers rank and leaderboard queries in
//! logarithmic time; the SQLite store is the fallback of record and the
//! source for full cache rebuilds. Flagged cheaters are demoted to negative
//! scores but remain visible.
//!
//! ## Architecture Design
//!
//! All state lives in one explicit [`service::GameService`] object holding
//! concurrent-safe maps, constructed once and passed by reference, so tests
//! run against fresh instances. Sessions are only mutated by messages from
//! their own connection; the network edge serializes per-connection
//! traffic, which removes any need for cross-connection locking on a single
//! session. Every failure class degrades toward stale or locally
//! approximated results rather than surfacing an error mid-round.
//!
//! ## Module Organization
//!
//! - [`session`]: the per-connection session state machine plus the
//!   session and cooldown stores.
//! - [`anticheat`]: the batch admission pipeline.
//! - [`classifier`]: the seam to the external behavioral classifier.
//! - [`score`]: the pure composite ranking formula.
//! - [`ledger`]: merge of finished rounds into durable records.
//! - [`store`]: SQLite-backed player rows and the lifetime counter.
//! - [`ranking`]: ranked-set cache, durable fallback and resync.
//! - [`service`]: the public operations consumed by the network and
//!   query layers.
//! - [`network`]: the UDP + bincode edge.

pub mod anticheat;
pub mod classifier;
pub mod ledger;
pub mod network;
pub mod ranking;
pub mod score;
pub mod service;
pub mod session;
pub mod store;
pub mod utils;
