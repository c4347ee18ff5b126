//! PostgreSQL Storage for the Points Ledger
//!
//! Persists scores, action history, certificates, physical rewards, streaks
//! and aggregate stats, keyed exclusively by anonymous identity hashes.
//! Connects with DATABASE_URL and applies embedded migrations on startup.

use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use deadpool_postgres::{Config, GenericClient, Pool, Runtime};
use postgres_types::{FromSql, ToSql};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio_postgres::NoTls;
use tracing::{debug, info, warn};

use crate::identity::IdentityHasher;
use crate::progression::{
    advance_streak, combo_bonus, rank_for_score, rank_label, reward_type_for_rank, streak_bonus,
    streak_multiplier, TierBand, ACHIEVEMENTS, RANKS,
};
use crate::redact::redact;

/// Database pool configuration
const DB_POOL_MAX_SIZE: usize = 10;
const DB_QUERY_TIMEOUT_SECS: u64 = 30;

/// Advisory lock key serializing retention purges across replicas.
const RETENTION_LOCK_KEY: i64 = 823_815_512;

/// Cooldown between bandwidth tier confirmations per identity.
pub const BANDWIDTH_COOLDOWN_SECS: i64 = 3_600;

/// Action types the ledger itself writes.
pub const ACTION_BANDWIDTH_SHARED: &str = "bandwidth_shared";
pub const ACTION_STREAK_BONUS: &str = "streak_bonus";
pub const ACTION_COMBO_BONUS: &str = "combo_bonus";
pub const ACTION_ACHIEVEMENT_BONUS: &str = "achievement_bonus";

// ============================================================================
// DATA STRUCTURES
// ============================================================================

/// Result of awarding points, including anything the rank transition
/// triggered after the commit.
#[derive(Debug, Clone, Serialize)]
pub struct AwardOutcome {
    pub user_hash: String,
    pub points_awarded: i64,
    pub total_score: i64,
    pub rank_idx: i32,
    pub rank: String,
    /// True only on promotion to a higher rank.
    pub rank_changed: bool,
    pub certificate: Option<Certificate>,
    pub physical_reward: Option<PhysicalReward>,
}

/// Proof of rank. Carries no user hash so it can be shown publicly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Certificate {
    pub certificate_id: String,
    pub rank: String,
    pub score: i64,
    pub issued_at: DateTime<Utc>,
    pub verification_hash: String,
    pub qr_payload: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSql, FromSql)]
#[postgres(name = "claim_status")]
#[serde(rename_all = "lowercase")]
pub enum ClaimStatus {
    #[postgres(name = "eligible")]
    Eligible,
    #[postgres(name = "claimed")]
    Claimed,
    #[postgres(name = "shipped")]
    Shipped,
    #[postgres(name = "delivered")]
    Delivered,
}

/// A registered physical reward. Serial and hologram codes are assigned
/// once; rank upgrades never reissue them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhysicalReward {
    pub anonymous_id: String,
    pub reward_type: String,
    pub rank_achieved: String,
    pub max_rank_idx: i32,
    pub eligibility_date: DateTime<Utc>,
    pub serial_number: String,
    pub hologram_code: String,
    pub claim_status: ClaimStatus,
}

/// Public view of a reward registration for authenticity checks. Carries no
/// user hash and no hologram code.
#[derive(Debug, Clone, Serialize)]
pub struct RewardVerification {
    pub anonymous_id: String,
    pub reward_type: String,
    pub rank_achieved: String,
    pub claim_status: ClaimStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserStats {
    pub user_hash: String,
    pub score: i64,
    pub rank_idx: i32,
    pub rank: String,
    pub next_rank: Option<String>,
    pub points_to_next: Option<i64>,
    /// 1-based position among all users by score.
    pub position: i64,
    pub joined_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

/// One public leaderboard entry. Position, score and rank only; identity
/// keys never leave the store through this surface.
#[derive(Debug, Clone, Serialize)]
pub struct LeaderboardRow {
    pub position: i64,
    pub score: i64,
    pub rank: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreakState {
    pub streak_type: String,
    pub current: i32,
    pub longest: i32,
    pub last_action_date: Option<NaiveDate>,
    pub total_count: i32,
}

/// What recording one qualifying day did to a streak.
#[derive(Debug, Clone, Serialize)]
pub struct StreakOutcome {
    pub streak_type: String,
    pub current: i32,
    pub longest: i32,
    /// False for a same-day repeat.
    pub extended: bool,
    pub bonus_points: i64,
    /// Multiplier callers apply to base action points.
    pub multiplier: f64,
}

/// Where an identity stands on today's variety bonus.
#[derive(Debug, Clone, Serialize)]
pub struct ComboStatus {
    pub distinct_actions: i64,
    pub bonus_points: i64,
    /// True when today's combo bonus has already been paid.
    pub already_awarded_today: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnlockedAchievement {
    pub achievement_id: String,
    pub name: String,
    pub points_reward: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EarnedAchievement {
    pub achievement_id: String,
    pub name: String,
    pub description: String,
    pub category: String,
    pub points_reward: i64,
    pub unlocked_at: DateTime<Utc>,
}

/// Outcome of a bandwidth tier confirmation.
#[derive(Debug, Clone, Serialize)]
pub struct TierOutcome {
    pub rate_limited: bool,
    pub retry_after_secs: Option<i64>,
    pub award: Option<AwardOutcome>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AggregateStats {
    pub total_users: i64,
    pub total_actions: i64,
    pub total_gb_shared: f64,
    pub actions_by_type: HashMap<String, i64>,
    pub tier_distribution: HashMap<String, i64>,
}

// ============================================================================
// CERTIFICATE CODES
// ============================================================================

/// Deterministic certificate id: the same identity, rank and issue instant
/// always produce the same id, so a retried issuance cannot mint duplicates.
pub fn certificate_id(user_hash: &str, rank: &str, issued_at: DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user_hash.as_bytes());
    hasher.update(rank.as_bytes());
    hasher.update(issued_at.to_rfc3339().as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("CERT-{}", digest[..16].to_uppercase())
}

/// Tamper check binding a certificate to its rank, score and issue instant.
pub fn verification_hash(
    certificate_id: &str,
    rank: &str,
    score: i64,
    issued_at: DateTime<Utc>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(certificate_id.as_bytes());
    hasher.update(rank.as_bytes());
    hasher.update(score.to_string().as_bytes());
    hasher.update(issued_at.to_rfc3339().as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..16].to_string()
}

fn random_code(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf).to_uppercase()
}

fn short(user_hash: &str) -> &str {
    &user_hash[..12.min(user_hash.len())]
}

// ============================================================================
// PG STORE
// ============================================================================

#[derive(Clone)]
pub struct PgStore {
    pool: Pool,
    hasher: IdentityHasher,
    retention_days: i64,
    verify_base_url: String,
}

impl PgStore {
    /// Create storage from DATABASE_URL
    pub async fn new(
        database_url: &str,
        hasher: IdentityHasher,
        retention_days: i64,
        verify_base_url: String,
    ) -> Result<Self> {
        use deadpool_postgres::{ManagerConfig, PoolConfig, RecyclingMethod};
        use std::time::Duration;

        let mut config = Config::new();
        config.url = Some(database_url.to_string());

        config.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });

        config.pool = Some(PoolConfig {
            max_size: DB_POOL_MAX_SIZE,
            timeouts: deadpool_postgres::Timeouts {
                wait: Some(Duration::from_secs(DB_QUERY_TIMEOUT_SECS)),
                create: Some(Duration::from_secs(10)),
                recycle: Some(Duration::from_secs(30)),
            },
            ..Default::default()
        });

        let pool = config.create_pool(Some(Runtime::Tokio1), NoTls)?;

        // Test connection
        let client = pool.get().await?;
        client
            .execute(
                &format!("SET statement_timeout = '{}s'", DB_QUERY_TIMEOUT_SECS),
                &[],
            )
            .await?;

        info!(
            "Connected to PostgreSQL (pool_size: {}, query_timeout: {}s)",
            DB_POOL_MAX_SIZE, DB_QUERY_TIMEOUT_SECS
        );

        let store = Self {
            pool,
            hasher,
            retention_days,
            verify_base_url,
        };
        store.run_migrations().await?;
        store.sync_achievement_definitions().await?;

        Ok(store)
    }

    /// Create storage from DATABASE_URL environment variable
    pub async fn from_env(
        hasher: IdentityHasher,
        retention_days: i64,
        verify_base_url: String,
    ) -> Result<Self> {
        let url =
            std::env::var("DATABASE_URL").map_err(|_| anyhow::anyhow!("DATABASE_URL not set"))?;
        Self::new(&url, hasher, retention_days, verify_base_url).await
    }

    /// Run embedded migrations
    async fn run_migrations(&self) -> Result<()> {
        let client = self.pool.get().await?;

        // Check if migrations table exists
        let exists: bool = client
            .query_one(
                "SELECT EXISTS(SELECT 1 FROM information_schema.tables WHERE table_name = 'schema_migrations')",
                &[],
            )
            .await?
            .get(0);

        if !exists {
            let migration_sql = include_str!("../migrations/001_initial_schema.sql");
            client.batch_execute(migration_sql).await?;
            info!("Applied migration 001_initial_schema");
        }

        // Check for certificates and physical rewards (version 2)
        let has_rewards: bool = client
            .query_one(
                "SELECT EXISTS(SELECT 1 FROM schema_migrations WHERE version = 2)",
                &[],
            )
            .await?
            .get(0);

        if !has_rewards {
            let migration_sql = include_str!("../migrations/002_certificates_rewards.sql");
            client.batch_execute(migration_sql).await?;
            info!("Applied migration 002_certificates_rewards");
        }

        // Check for streaks, achievements and tier confirmations (version 3)
        let has_gamification: bool = client
            .query_one(
                "SELECT EXISTS(SELECT 1 FROM schema_migrations WHERE version = 3)",
                &[],
            )
            .await?
            .get(0);

        if !has_gamification {
            let migration_sql = include_str!("../migrations/003_gamification.sql");
            client.batch_execute(migration_sql).await?;
            info!("Applied migration 003_gamification");
        }

        Ok(())
    }

    /// Upsert the in-code achievement table into the definitions table so
    /// unlock rows always reference a current definition.
    async fn sync_achievement_definitions(&self) -> Result<()> {
        let client = self.pool.get().await?;

        for def in ACHIEVEMENTS.iter() {
            client
                .execute(
                    "INSERT INTO achievements (achievement_id, name, description, category, points_reward, requirement_type, requirement_value)
                     VALUES ($1, $2, $3, $4, $5, $6, $7)
                     ON CONFLICT (achievement_id) DO UPDATE SET
                        name = EXCLUDED.name,
                        description = EXCLUDED.description,
                        category = EXCLUDED.category,
                        points_reward = EXCLUDED.points_reward,
                        requirement_type = EXCLUDED.requirement_type,
                        requirement_value = EXCLUDED.requirement_value",
                    &[
                        &def.id,
                        &def.name,
                        &def.description,
                        &def.category,
                        &def.reward_points,
                        &def.requirement_type(),
                        &def.requirement_value(),
                    ],
                )
                .await?;
        }

        debug!("Synced {} achievement definitions", ACHIEVEMENTS.len());
        Ok(())
    }

    // ========================================================================
    // USERS & POINTS
    // ========================================================================

    /// Ensure a ledger row exists for this identity. Returns the anonymous
    /// key and whether the row was created just now.
    pub async fn ensure_user(&self, raw_id: &str) -> Result<(String, bool)> {
        let user_hash = self.hasher.hash_identity(raw_id);
        let client = self.pool.get().await?;

        let inserted = upsert_user(&client, &user_hash).await?;
        if inserted {
            bump_stat_int(&client, "total_users", 1).await?;
            info!("New user {}", short(&user_hash));
        }

        Ok((user_hash, inserted))
    }

    /// Award points inside a single transaction: score, rank index and the
    /// action log move together or not at all. Certificates and physical
    /// rewards are issued after the commit; their failure never takes the
    /// committed points with it.
    pub async fn add_points(
        &self,
        raw_id: &str,
        action_type: &str,
        points: i64,
    ) -> Result<AwardOutcome> {
        let user_hash = self.hasher.hash_identity(raw_id);
        let expires_at = Utc::now() + Duration::days(self.retention_days);

        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let inserted = upsert_user(&tx, &user_hash).await?;

        // Row lock so concurrent awards for the same identity serialize.
        let prev_rank: i32 = tx
            .query_one(
                "SELECT rank_idx FROM users WHERE user_hash = $1 FOR UPDATE",
                &[&user_hash],
            )
            .await?
            .get(0);

        let total_score: i64 = tx
            .query_one(
                "UPDATE users SET score = GREATEST(0, score + $2), last_active = NOW()
                 WHERE user_hash = $1
                 RETURNING score",
                &[&user_hash, &points],
            )
            .await?
            .get(0);

        let rank_idx = rank_for_score(total_score) as i32;
        if rank_idx != prev_rank {
            tx.execute(
                "UPDATE users SET rank_idx = $2 WHERE user_hash = $1",
                &[&user_hash, &rank_idx],
            )
            .await?;
        }

        tx.execute(
            "INSERT INTO action_logs (user_hash, action_type, points, expires_at)
             VALUES ($1, $2, $3, $4)",
            &[&user_hash, &action_type, &points, &expires_at],
        )
        .await?;

        if inserted {
            bump_stat_int(&tx, "total_users", 1).await?;
        }
        bump_stat_int(&tx, "total_actions", 1).await?;
        bump_stat_map(&tx, "actions_by_type", action_type, 1).await?;

        tx.commit().await?;
        drop(client);

        debug!(
            "Awarded {} points ({}) to {}",
            points,
            action_type,
            short(&user_hash)
        );

        // Promotion compares rank indices, never display labels.
        let promoted = rank_idx > prev_rank;
        let mut certificate = None;
        let mut physical_reward = None;

        if promoted {
            info!(
                "User {} promoted to {} (rank {})",
                short(&user_hash),
                rank_label(rank_idx as usize),
                rank_idx
            );

            match self
                .issue_certificate(&user_hash, rank_idx as usize, total_score)
                .await
            {
                Ok(cert) => certificate = Some(cert),
                Err(e) => warn!(
                    "Certificate issuance failed, points kept: {}",
                    redact(&e.to_string())
                ),
            }

            match self
                .register_physical_reward(&user_hash, rank_idx as usize)
                .await
            {
                Ok(reward) => physical_reward = reward,
                Err(e) => warn!(
                    "Physical reward registration failed, points kept: {}",
                    redact(&e.to_string())
                ),
            }
        }

        Ok(AwardOutcome {
            user_hash,
            points_awarded: points,
            total_score,
            rank_idx,
            rank: rank_label(rank_idx as usize).to_string(),
            rank_changed: promoted,
            certificate,
            physical_reward,
        })
    }

    /// Score, rank and position for one identity
    pub async fn get_user_stats(&self, raw_id: &str) -> Result<Option<UserStats>> {
        let user_hash = self.hasher.hash_identity(raw_id);
        let client = self.pool.get().await?;

        let row = client
            .query_opt(
                "SELECT score, rank_idx, joined_at, last_active FROM users WHERE user_hash = $1",
                &[&user_hash],
            )
            .await?;

        let row = match row {
            Some(r) => r,
            None => return Ok(None),
        };

        let score: i64 = row.get(0);
        let rank_idx: i32 = row.get(1);

        let position: i64 = client
            .query_one("SELECT COUNT(*) + 1 FROM users WHERE score > $1", &[&score])
            .await?
            .get(0);

        let next = RANKS.get(rank_idx as usize + 1);

        Ok(Some(UserStats {
            user_hash,
            score,
            rank_idx,
            rank: rank_label(rank_idx as usize).to_string(),
            next_rank: next.map(|tier| tier.label.to_string()),
            points_to_next: next.map(|tier| (tier.min_score - score).max(0)),
            position,
            joined_at: row.get(2),
            last_active: row.get(3),
        }))
    }

    /// 1-based leaderboard position, or `None` for an unknown identity
    pub async fn get_user_position(&self, raw_id: &str) -> Result<Option<i64>> {
        let user_hash = self.hasher.hash_identity(raw_id);
        let client = self.pool.get().await?;

        let row = client
            .query_opt("SELECT score FROM users WHERE user_hash = $1", &[&user_hash])
            .await?;
        let score: i64 = match row {
            Some(r) => r.get(0),
            None => return Ok(None),
        };

        let position: i64 = client
            .query_one("SELECT COUNT(*) + 1 FROM users WHERE score > $1", &[&score])
            .await?
            .get(0);

        Ok(Some(position))
    }

    /// Top scores in rank order. Anonymous by construction: the query never
    /// selects user_hash.
    pub async fn get_leaderboard(&self, limit: i64) -> Result<Vec<LeaderboardRow>> {
        let client = self.pool.get().await?;

        let rows = client
            .query(
                "SELECT score, rank_idx FROM users
                 ORDER BY score DESC, joined_at ASC
                 LIMIT $1",
                &[&limit],
            )
            .await?;

        Ok(rows
            .iter()
            .enumerate()
            .map(|(i, r)| LeaderboardRow {
                position: i as i64 + 1,
                score: r.get(0),
                rank: rank_label(r.get::<_, i32>(1) as usize).to_string(),
            })
            .collect())
    }

    /// Erase an identity's history. Score, rank, certificates and reward
    /// registrations survive; the raw action trail does not.
    pub async fn delete_user_data(&self, raw_id: &str) -> Result<u64> {
        let user_hash = self.hasher.hash_identity(raw_id);
        let client = self.pool.get().await?;

        let logs = client
            .execute("DELETE FROM action_logs WHERE user_hash = $1", &[&user_hash])
            .await?;
        let tiers = client
            .execute(
                "DELETE FROM tier_confirmations WHERE user_hash = $1",
                &[&user_hash],
            )
            .await?;

        info!(
            "Erased {} history rows for {} (score and rank retained)",
            logs + tiers,
            short(&user_hash)
        );
        Ok(logs + tiers)
    }

    // ========================================================================
    // RATE LIMITS
    // ========================================================================

    /// When an identity last performed an action, if ever. Cooldown policy
    /// lives with the caller; this is only the timestamp store.
    pub async fn get_last_action(
        &self,
        raw_id: &str,
        action_type: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        let user_hash = self.hasher.hash_identity(raw_id);
        let client = self.pool.get().await?;

        let row = client
            .query_opt(
                "SELECT last_action_at FROM rate_limits WHERE user_hash = $1 AND action_type = $2",
                &[&user_hash, &action_type],
            )
            .await?;

        Ok(row.map(|r| r.get(0)))
    }

    /// Record that an action happened now.
    pub async fn set_last_action(&self, raw_id: &str, action_type: &str) -> Result<()> {
        let user_hash = self.hasher.hash_identity(raw_id);
        let client = self.pool.get().await?;
        touch_rate_limit(&client, &user_hash, action_type).await
    }

    // ========================================================================
    // CERTIFICATES
    // ========================================================================

    /// Mint and persist a rank certificate for an anonymous key. The id is
    /// deterministic, so a retry lands on the existing row.
    pub async fn issue_certificate(
        &self,
        user_hash: &str,
        rank_idx: usize,
        score: i64,
    ) -> Result<Certificate> {
        let issued_at = Utc::now();
        let rank = rank_label(rank_idx);
        let certificate_id = certificate_id(user_hash, rank, issued_at);
        let verification_hash = verification_hash(&certificate_id, rank, score, issued_at);
        let qr_payload = format!("{}?id={}", self.verify_base_url, certificate_id);

        let client = self.pool.get().await?;
        client
            .execute(
                "INSERT INTO certificates (certificate_id, user_hash, rank, score, issued_at, verification_hash, qr_payload)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)
                 ON CONFLICT (certificate_id) DO NOTHING",
                &[
                    &certificate_id,
                    &user_hash,
                    &rank,
                    &score,
                    &issued_at,
                    &verification_hash,
                    &qr_payload,
                ],
            )
            .await?;

        info!("Issued certificate {} for rank {}", certificate_id, rank);

        Ok(Certificate {
            certificate_id,
            rank: rank.to_string(),
            score,
            issued_at,
            verification_hash,
            qr_payload,
        })
    }

    /// Look up a certificate by its public id
    pub async fn verify_certificate(&self, certificate_id: &str) -> Result<Option<Certificate>> {
        let client = self.pool.get().await?;

        let row = client
            .query_opt(
                "SELECT certificate_id, rank, score, issued_at, verification_hash, qr_payload
                 FROM certificates WHERE certificate_id = $1",
                &[&certificate_id],
            )
            .await?;

        Ok(row.map(|r| Certificate {
            certificate_id: r.get(0),
            rank: r.get(1),
            score: r.get(2),
            issued_at: r.get(3),
            verification_hash: r.get(4),
            qr_payload: r.get(5),
        }))
    }

    /// All certificates earned by an identity, newest first
    pub async fn list_certificates(&self, raw_id: &str) -> Result<Vec<Certificate>> {
        let user_hash = self.hasher.hash_identity(raw_id);
        let client = self.pool.get().await?;

        let rows = client
            .query(
                "SELECT certificate_id, rank, score, issued_at, verification_hash, qr_payload
                 FROM certificates WHERE user_hash = $1
                 ORDER BY issued_at DESC",
                &[&user_hash],
            )
            .await?;

        Ok(rows
            .iter()
            .map(|r| Certificate {
                certificate_id: r.get(0),
                rank: r.get(1),
                score: r.get(2),
                issued_at: r.get(3),
                verification_hash: r.get(4),
                qr_payload: r.get(5),
            })
            .collect())
    }

    // ========================================================================
    // PHYSICAL REWARDS
    // ========================================================================

    /// Register a physical reward for a top-rank promotion. At most one row
    /// per identity: only a strictly higher promotion touches an existing
    /// registration, upgrading rank and reward type while keeping the codes.
    /// Returns `Some` on a fresh registration or an upgrade, `None` when
    /// nothing changed.
    pub async fn register_physical_reward(
        &self,
        user_hash: &str,
        rank_idx: usize,
    ) -> Result<Option<PhysicalReward>> {
        let reward_type = match reward_type_for_rank(rank_idx) {
            Some(t) => t,
            None => return Ok(None),
        };
        let rank = rank_label(rank_idx);

        let anonymous_id = format!(
            "HERO-{}",
            uuid::Uuid::new_v4().simple().to_string()[..12].to_uppercase()
        );
        let serial_number = format!("SN-{}", random_code(8));
        let hologram_code = format!("HOLO-{}", random_code(4));

        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "INSERT INTO physical_rewards
                    (anonymous_id, user_hash, reward_type, rank_achieved, max_rank_idx,
                     eligibility_date, serial_number, hologram_code)
                 VALUES ($1, $2, $3, $4, $5, NOW(), $6, $7)
                 ON CONFLICT (user_hash) DO UPDATE SET
                    max_rank_idx = EXCLUDED.max_rank_idx,
                    rank_achieved = EXCLUDED.rank_achieved,
                    reward_type = EXCLUDED.reward_type
                 WHERE EXCLUDED.max_rank_idx > physical_rewards.max_rank_idx
                 RETURNING (xmax = 0) AS inserted, anonymous_id, reward_type, rank_achieved,
                           max_rank_idx, eligibility_date, serial_number, hologram_code, claim_status",
                &[
                    &anonymous_id,
                    &user_hash,
                    &reward_type,
                    &rank,
                    &(rank_idx as i32),
                    &serial_number,
                    &hologram_code,
                ],
            )
            .await?;

        // No row back means the conflict row already sits at an equal or
        // higher rank.
        let row = match row {
            Some(row) => row,
            None => {
                debug!(
                    "Physical reward for {} already registered at this rank or above",
                    short(user_hash)
                );
                return Ok(None);
            }
        };

        let inserted: bool = row.get(0);
        let reward = PhysicalReward {
            anonymous_id: row.get(1),
            reward_type: row.get(2),
            rank_achieved: row.get(3),
            max_rank_idx: row.get(4),
            eligibility_date: row.get(5),
            serial_number: row.get(6),
            hologram_code: row.get(7),
            claim_status: row.get(8),
        };

        if inserted {
            info!(
                "Registered physical reward {} ({})",
                reward.serial_number, reward.reward_type
            );
        } else {
            info!(
                "Upgraded physical reward {} to {} (serial retained)",
                reward.anonymous_id, reward.rank_achieved
            );
        }
        Ok(Some(reward))
    }

    /// The physical reward registered for an identity, if any
    pub async fn get_physical_reward(&self, raw_id: &str) -> Result<Option<PhysicalReward>> {
        let user_hash = self.hasher.hash_identity(raw_id);
        let client = self.pool.get().await?;

        let row = client
            .query_opt(
                "SELECT anonymous_id, reward_type, rank_achieved, max_rank_idx,
                        eligibility_date, serial_number, hologram_code, claim_status
                 FROM physical_rewards WHERE user_hash = $1",
                &[&user_hash],
            )
            .await?;

        Ok(row.map(|r| PhysicalReward {
            anonymous_id: r.get(0),
            reward_type: r.get(1),
            rank_achieved: r.get(2),
            max_rank_idx: r.get(3),
            eligibility_date: r.get(4),
            serial_number: r.get(5),
            hologram_code: r.get(6),
            claim_status: r.get(7),
        }))
    }

    /// Authenticity lookup by engraved serial number. Returns only the
    /// fields safe to show whoever is holding the item.
    pub async fn lookup_reward_by_serial(
        &self,
        serial: &str,
    ) -> Result<Option<RewardVerification>> {
        let client = self.pool.get().await?;

        let row = client
            .query_opt(
                "SELECT anonymous_id, reward_type, rank_achieved, claim_status
                 FROM physical_rewards WHERE serial_number = $1",
                &[&serial],
            )
            .await?;

        Ok(row.map(|r| RewardVerification {
            anonymous_id: r.get(0),
            reward_type: r.get(1),
            rank_achieved: r.get(2),
            claim_status: r.get(3),
        }))
    }

    // ========================================================================
    // STREAKS & ACHIEVEMENTS
    // ========================================================================

    /// Apply one qualifying day to a streak and pay the milestone bonus when
    /// the new length lands exactly on one. Same-day repeats change nothing.
    pub async fn update_streak(&self, raw_id: &str, streak_type: &str) -> Result<StreakOutcome> {
        let user_hash = self.hasher.hash_identity(raw_id);
        let today = Utc::now().date_naive();
        let client = self.pool.get().await?;

        let row = client
            .query_opt(
                "SELECT current_streak, longest_streak, last_action_date
                 FROM user_streaks WHERE user_hash = $1 AND streak_type = $2",
                &[&user_hash, &streak_type],
            )
            .await?;

        let (current, longest, last) = match &row {
            Some(r) => (
                r.get::<_, i32>(0),
                r.get::<_, i32>(1),
                r.get::<_, Option<NaiveDate>>(2),
            ),
            None => (0, 0, None),
        };

        let advance = advance_streak(current, longest, last, today);

        client
            .execute(
                "INSERT INTO user_streaks (user_hash, streak_type, current_streak, longest_streak, last_action_date, total_count)
                 VALUES ($1, $2, $3, $4, $5, 1)
                 ON CONFLICT (user_hash, streak_type) DO UPDATE SET
                    current_streak = $3,
                    longest_streak = $4,
                    last_action_date = $5,
                    total_count = user_streaks.total_count + $6",
                &[
                    &user_hash,
                    &streak_type,
                    &advance.current,
                    &advance.longest,
                    &today,
                    &(if advance.changed { 1i32 } else { 0i32 }),
                ],
            )
            .await?;
        drop(client);

        let multiplier = streak_multiplier(advance.current);
        let bonus = if advance.changed {
            streak_bonus(advance.current)
        } else {
            0
        };

        if bonus > 0 {
            info!(
                "Streak {} day {} pays {} bonus points to {}",
                streak_type,
                advance.current,
                bonus,
                short(&user_hash)
            );
            self.add_points(raw_id, ACTION_STREAK_BONUS, bonus).await?;
        }

        Ok(StreakOutcome {
            streak_type: streak_type.to_string(),
            current: advance.current,
            longest: advance.longest,
            extended: advance.changed,
            bonus_points: bonus,
            multiplier,
        })
    }

    /// All streaks for an identity, longest-running first
    pub async fn get_streaks(&self, raw_id: &str) -> Result<Vec<StreakState>> {
        let user_hash = self.hasher.hash_identity(raw_id);
        let client = self.pool.get().await?;

        let rows = client
            .query(
                "SELECT streak_type, current_streak, longest_streak, last_action_date, total_count
                 FROM user_streaks WHERE user_hash = $1
                 ORDER BY current_streak DESC",
                &[&user_hash],
            )
            .await?;

        Ok(rows
            .iter()
            .map(|r| StreakState {
                streak_type: r.get(0),
                current: r.get(1),
                longest: r.get(2),
                last_action_date: r.get(3),
                total_count: r.get(4),
            })
            .collect())
    }

    /// Where an identity stands on today's variety bonus: distinct action
    /// types since UTC midnight, the bonus those earn and whether it was
    /// paid already. Read-only; the caller awards the bonus as a
    /// `combo_bonus` action, which this count then sees as paid.
    pub async fn check_daily_combo(&self, raw_id: &str) -> Result<ComboStatus> {
        let user_hash = self.hasher.hash_identity(raw_id);
        let today_start =
            Utc.from_utc_datetime(&Utc::now().date_naive().and_time(NaiveTime::MIN));
        let client = self.pool.get().await?;

        // Bonus actions themselves do not count toward variety.
        let distinct: i64 = client
            .query_one(
                "SELECT COUNT(DISTINCT action_type) FROM action_logs
                 WHERE user_hash = $1 AND created_at >= $2
                   AND action_type NOT IN ($3, $4, $5)",
                &[
                    &user_hash,
                    &today_start,
                    &ACTION_STREAK_BONUS,
                    &ACTION_COMBO_BONUS,
                    &ACTION_ACHIEVEMENT_BONUS,
                ],
            )
            .await?
            .get(0);

        let already_awarded_today = client
            .query_opt(
                "SELECT 1 FROM action_logs
                 WHERE user_hash = $1 AND action_type = $2 AND created_at >= $3
                 LIMIT 1",
                &[&user_hash, &ACTION_COMBO_BONUS, &today_start],
            )
            .await?
            .is_some();

        Ok(ComboStatus {
            distinct_actions: distinct,
            bonus_points: combo_bonus(distinct),
            already_awarded_today,
        })
    }

    /// Unlock every achievement whose requirement the identity now meets.
    /// Unlocks are idempotent; each pays its reward exactly once.
    pub async fn check_and_unlock(&self, raw_id: &str) -> Result<Vec<UnlockedAchievement>> {
        let user_hash = self.hasher.hash_identity(raw_id);
        let client = self.pool.get().await?;

        let row = client
            .query_opt("SELECT score FROM users WHERE user_hash = $1", &[&user_hash])
            .await?;
        let score: i64 = match row {
            Some(r) => r.get(0),
            None => return Ok(Vec::new()),
        };

        let rows = client
            .query(
                "SELECT action_type, COUNT(*) FROM action_logs
                 WHERE user_hash = $1 GROUP BY action_type",
                &[&user_hash],
            )
            .await?;
        let mut counts: HashMap<String, i64> = HashMap::new();
        for row in rows {
            counts.insert(row.get(0), row.get(1));
        }

        let mut newly = Vec::new();
        for def in ACHIEVEMENTS.iter() {
            if !def.satisfied(score, &counts) {
                continue;
            }
            let inserted = client
                .execute(
                    "INSERT INTO user_achievements (user_hash, achievement_id, unlocked_at)
                     VALUES ($1, $2, NOW())
                     ON CONFLICT DO NOTHING",
                    &[&user_hash, &def.id],
                )
                .await?;
            if inserted > 0 {
                newly.push(UnlockedAchievement {
                    achievement_id: def.id.to_string(),
                    name: def.name.to_string(),
                    points_reward: def.reward_points,
                });
            }
        }
        drop(client);

        for unlocked in &newly {
            info!(
                "Achievement {} unlocked by {} (+{} points)",
                unlocked.achievement_id,
                short(&user_hash),
                unlocked.points_reward
            );
            self.add_points(raw_id, ACTION_ACHIEVEMENT_BONUS, unlocked.points_reward)
                .await?;
        }

        Ok(newly)
    }

    /// Achievements an identity has earned, newest first
    pub async fn get_achievements(&self, raw_id: &str) -> Result<Vec<EarnedAchievement>> {
        let user_hash = self.hasher.hash_identity(raw_id);
        let client = self.pool.get().await?;

        let rows = client
            .query(
                "SELECT a.achievement_id, a.name, a.description, a.category, a.points_reward, ua.unlocked_at
                 FROM user_achievements ua
                 JOIN achievements a ON a.achievement_id = ua.achievement_id
                 WHERE ua.user_hash = $1
                 ORDER BY ua.unlocked_at DESC",
                &[&user_hash],
            )
            .await?;

        Ok(rows
            .iter()
            .map(|r| EarnedAchievement {
                achievement_id: r.get(0),
                name: r.get(1),
                description: r.get(2),
                category: r.get(3),
                points_reward: r.get(4),
                unlocked_at: r.get(5),
            })
            .collect())
    }

    // ========================================================================
    // TIER CONFIRMATIONS
    // ========================================================================

    /// Record a confirmed bandwidth tier: log the anonymized confirmation,
    /// award its points and start the cooldown. Only the tier label and the
    /// normalized amount are stored, never the screenshot or its text.
    pub async fn confirm_tier(
        &self,
        raw_id: &str,
        band: &TierBand,
        gb_amount: f64,
    ) -> Result<TierOutcome> {
        let user_hash = self.hasher.hash_identity(raw_id);

        if let Some(last) = self.get_last_action(raw_id, ACTION_BANDWIDTH_SHARED).await? {
            let elapsed = Utc::now().signed_duration_since(last).num_seconds();
            if elapsed < BANDWIDTH_COOLDOWN_SECS {
                let retry_after = BANDWIDTH_COOLDOWN_SECS - elapsed;
                debug!(
                    "Tier confirmation rate limited for {} ({}s left)",
                    short(&user_hash),
                    retry_after
                );
                return Ok(TierOutcome {
                    rate_limited: true,
                    retry_after_secs: Some(retry_after),
                    award: None,
                });
            }
        }

        let client = self.pool.get().await?;
        client
            .execute(
                "INSERT INTO tier_confirmations (user_hash, tier, gb_amount, points)
                 VALUES ($1, $2, $3, $4)",
                &[&user_hash, &band.label, &gb_amount, &band.points],
            )
            .await?;
        bump_stat_float(&client, "total_gb_shared", gb_amount).await?;
        bump_stat_map(&client, "tier_distribution", band.label, 1).await?;
        drop(client);

        let award = self
            .add_points(raw_id, ACTION_BANDWIDTH_SHARED, band.points)
            .await?;
        self.set_last_action(raw_id, ACTION_BANDWIDTH_SHARED).await?;

        info!(
            "Tier {} confirmed for {} (+{} points)",
            band.label,
            short(&user_hash),
            band.points
        );

        Ok(TierOutcome {
            rate_limited: false,
            retry_after_secs: None,
            award: Some(award),
        })
    }

    // ========================================================================
    // AGGREGATE STATS
    // ========================================================================

    /// Anonymous service-wide counters
    pub async fn get_aggregate_statistics(&self) -> Result<AggregateStats> {
        let client = self.pool.get().await?;

        let rows = client.query("SELECT key, value FROM stats", &[]).await?;

        let mut stats = AggregateStats::default();
        for row in rows {
            let key: String = row.get(0);
            let value: String = row.get(1);
            match key.as_str() {
                "total_users" => stats.total_users = value.parse().unwrap_or(0),
                "total_actions" => stats.total_actions = value.parse().unwrap_or(0),
                "total_gb_shared" => stats.total_gb_shared = value.parse().unwrap_or(0.0),
                "actions_by_type" => {
                    stats.actions_by_type = serde_json::from_str(&value).unwrap_or_default()
                }
                "tier_distribution" => {
                    stats.tier_distribution = serde_json::from_str(&value).unwrap_or_default()
                }
                _ => {}
            }
        }

        Ok(stats)
    }

    // ========================================================================
    // RETENTION
    // ========================================================================

    /// Purge expired action logs. Guarded by an advisory lock so only one
    /// replica purges at a time; losing the lock counts as nothing purged.
    pub async fn purge_expired(&self) -> Result<u64> {
        let client = self.pool.get().await?;

        let locked: bool = client
            .query_one("SELECT pg_try_advisory_lock($1)", &[&RETENTION_LOCK_KEY])
            .await?
            .get(0);
        if !locked {
            debug!("Retention purge already running elsewhere; skipping");
            return Ok(0);
        }

        let result = client
            .execute("DELETE FROM action_logs WHERE expires_at < NOW()", &[])
            .await;

        // The advisory lock is session-scoped; release it on the same
        // connection whether or not the purge succeeded.
        if let Err(e) = client
            .query_one("SELECT pg_advisory_unlock($1)", &[&RETENTION_LOCK_KEY])
            .await
        {
            warn!("Failed to release retention lock: {}", e);
        }

        let purged = result?;
        if purged > 0 {
            info!("Purged {} expired action logs", purged);
        } else {
            debug!("Retention purge found nothing to delete");
        }
        Ok(purged)
    }

    // ========================================================================
    // HEALTH
    // ========================================================================

    pub async fn health_check(&self) -> Result<()> {
        let client = self.pool.get().await?;
        client.query_one("SELECT 1", &[]).await?;
        Ok(())
    }
}

// ============================================================================
// SHARED QUERY HELPERS
// ============================================================================

/// Upsert the users row. `xmax = 0` distinguishes a fresh insert from an
/// update of an existing row within the same statement.
async fn upsert_user(client: &impl GenericClient, user_hash: &str) -> Result<bool> {
    let row = client
        .query_one(
            "INSERT INTO users (user_hash) VALUES ($1)
             ON CONFLICT (user_hash) DO UPDATE SET last_active = NOW()
             RETURNING (xmax = 0) AS inserted",
            &[&user_hash],
        )
        .await?;
    Ok(row.get(0))
}

async fn touch_rate_limit(
    client: &impl GenericClient,
    user_hash: &str,
    action_type: &str,
) -> Result<()> {
    client
        .execute(
            "INSERT INTO rate_limits (user_hash, action_type, last_action_at)
             VALUES ($1, $2, NOW())
             ON CONFLICT (user_hash, action_type) DO UPDATE SET last_action_at = NOW()",
            &[&user_hash, &action_type],
        )
        .await?;
    Ok(())
}

async fn bump_stat_int(client: &impl GenericClient, key: &str, delta: i64) -> Result<()> {
    client
        .execute(
            "INSERT INTO stats (key, value) VALUES ($1, $2::TEXT)
             ON CONFLICT (key) DO UPDATE SET
                value = ((stats.value)::BIGINT + $2)::TEXT,
                updated_at = NOW()",
            &[&key, &delta],
        )
        .await?;
    Ok(())
}

async fn bump_stat_float(client: &impl GenericClient, key: &str, delta: f64) -> Result<()> {
    client
        .execute(
            "INSERT INTO stats (key, value) VALUES ($1, $2::TEXT)
             ON CONFLICT (key) DO UPDATE SET
                value = ((stats.value)::DOUBLE PRECISION + $2)::TEXT,
                updated_at = NOW()",
            &[&key, &delta],
        )
        .await?;
    Ok(())
}

/// Increment one field of a JSON map held in the stats table.
async fn bump_stat_map(
    client: &impl GenericClient,
    key: &str,
    field: &str,
    delta: i64,
) -> Result<()> {
    client
        .execute(
            "INSERT INTO stats (key, value) VALUES ($1, jsonb_build_object($2, $3)::TEXT)
             ON CONFLICT (key) DO UPDATE SET
                value = (COALESCE(stats.value::JSONB, '{}'::JSONB) ||
                         jsonb_build_object($2, COALESCE((stats.value::JSONB ->> $2)::BIGINT, 0) + $3))::TEXT,
                updated_at = NOW()",
            &[&key, &field, &delta],
        )
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_certificate_id_deterministic() {
        let issued = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let a = certificate_id("abc123", "Colonel", issued);
        let b = certificate_id("abc123", "Colonel", issued);
        assert_eq!(a, b);
        assert!(a.starts_with("CERT-"));
        assert_eq!(a.len(), "CERT-".len() + 16);
    }

    #[test]
    fn test_certificate_id_varies_by_inputs() {
        let issued = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 1).unwrap();
        let base = certificate_id("abc123", "Colonel", issued);
        assert_ne!(base, certificate_id("abc124", "Colonel", issued));
        assert_ne!(base, certificate_id("abc123", "Brigadier", issued));
        assert_ne!(base, certificate_id("abc123", "Colonel", later));
    }

    #[test]
    fn test_verification_hash_binds_all_fields() {
        let issued = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let base = verification_hash("CERT-AAAA", "Colonel", 1_000, issued);
        assert_eq!(base.len(), 16);
        assert_ne!(base, verification_hash("CERT-AAAB", "Colonel", 1_000, issued));
        assert_ne!(base, verification_hash("CERT-AAAA", "Colonel", 1_001, issued));
        assert_ne!(base, verification_hash("CERT-AAAA", "Brigadier", 1_000, issued));
    }

    #[test]
    fn test_random_code_shape() {
        let serial = random_code(8);
        assert_eq!(serial.len(), 16);
        assert!(serial
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
        assert_eq!(random_code(4).len(), 8);
        assert_ne!(random_code(8), random_code(8));
    }

    #[test]
    fn test_short_hash_is_prefix() {
        let hash = "abcdef0123456789".repeat(4);
        assert_eq!(short(&hash), "abcdef012345");
        assert_eq!(short("ab"), "ab");
    }

    #[test]
    fn test_write_helpers_accept_both_client_shapes() {
        // Compile-time check: the pool hands out `Client` and transactions
        // are `Transaction<'_>`; the helper bound must hold for both as-is.
        fn assert_generic_client<C: GenericClient>() {}
        assert_generic_client::<deadpool_postgres::Client>();
        assert_generic_client::<deadpool_postgres::Transaction<'_>>();
    }

    #[test]
    fn test_leaderboard_row_carries_no_identity() {
        let row = LeaderboardRow {
            position: 1,
            score: 12_500,
            rank: "Colonel".to_string(),
        };
        let json = serde_json::to_value(&row).unwrap();
        let fields = json.as_object().unwrap();
        assert!(fields.get("user_hash").is_none());
        let mut keys: Vec<_> = fields.keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(keys, ["position", "rank", "score"]);
    }
}
