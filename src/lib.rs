//! Checkpoint Quiz - multi-checkpoint scavenger hunt quiz engine
//!
//! Participants scan a sequence of physical checkpoint tags, answer one
//! gating question at each, and receive a one-time redemption credential
//! when every checkpoint is complete.
//!
//! # How it works
//!
//! 1. A participant scans a checkpoint tag; the opaque token resolves to a
//!    (campaign, checkpoint, question category) triple
//! 2. Their provider ID token is verified server-side and mapped to a user
//! 3. One session per (user, campaign) tracks progress; each checkpoint gets
//!    a question sampled from its category pool on first visit
//! 4. Answers are graded exactly once under row locks; wrong answers may
//!    rotate the question per campaign policy
//! 5. Completing every checkpoint issues a single-use redemption token,
//!    consumed atomically at a kiosk
//!
//! # Concurrency guarantees
//!
//! - Exactly one session per (user, campaign), even under duplicate scans
//! - A completed checkpoint is never reopened or reassigned
//! - Exactly one redemption token per completed session
//! - A redemption token is consumed at most once

pub mod config;
pub mod error;
pub mod identity;
pub mod pg_storage;
pub mod server;
pub mod theme;

pub use config::Config;
pub use error::QuizError;
pub use identity::{HttpJwksProvider, IdentityVerifier, JwksProvider, VerifiedIdentity};
pub use pg_storage::{PgStorage, DEFAULT_REDEEM_TTL_DAYS};
pub use theme::{merge_theme, ThemeConfig, DEFAULT_THEME};
