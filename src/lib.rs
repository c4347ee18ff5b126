//! Merit Ledger - Anonymous points for network contribution
//!
//! Tracks contribution scores for anonymous identities. Raw platform IDs
//! never reach storage or logs; every row is keyed by a peppered HMAC.
//!
//! # How it works
//!
//! 1. Contributions arrive as (identity, action type, points) and are
//!    awarded in a single transaction
//! 2. Scores map onto ranks; a promotion issues a verifiable certificate
//! 3. The top ranks register a physical reward under an anonymous id
//! 4. Streaks, daily combos and achievements earn bonus points on top
//! 5. Bandwidth screenshots are read with OCR and mapped onto tiers
//!
//! # Privacy measures
//!
//! - Identities are HMAC-hashed with a pepper before they touch a table
//! - Action history carries an expiry and is purged on a schedule
//! - Screenshot frames live on disk only for one recognition pass
//! - Secrets and credentialed URLs are masked before logging

pub mod config;
pub mod identity;
pub mod ocr;
pub mod progression;
pub mod redact;
pub mod server;
pub mod store;

pub use config::Config;
pub use identity::IdentityHasher;
pub use ocr::{OcrError, TesseractCli, TextRecognizer, TierReading, TierVerifier};
pub use progression::{classify_tier, rank_for_score, rank_label, RankTier, TierBand, RANKS};
pub use store::{
    AggregateStats, AwardOutcome, Certificate, ClaimStatus, ComboStatus, PgStore, PhysicalReward,
    RewardVerification, StreakOutcome, TierOutcome, UserStats, BANDWIDTH_COOLDOWN_SECS,
};
