//! PostgreSQL storage for the checkpoint quiz engine.
//!
//! Holds the session manager, question assignment, answer grading, progress
//! projection, and redemption operations. All multi-step operations run in a
//! single transaction; a transaction that is not committed rolls back on
//! drop, so no partial state is ever observable. Unique constraints plus
//! no-op upserts are the concurrency primitives for get-or-create and
//! exactly-once semantics; `FOR UPDATE` row locks serialize grading per
//! session-checkpoint.

use chrono::{DateTime, Utc};
use deadpool_postgres::{Config, Pool, Runtime};
use serde::{Deserialize, Serialize};
use tokio_postgres::{GenericClient, NoTls};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::QuizError;
use crate::theme::{merge_theme, ThemeConfig};

/// Database pool configuration
const DB_POOL_MAX_SIZE: usize = 20;
const DB_QUERY_TIMEOUT_SECS: u64 = 30;

/// Default redemption token lifetime in days
pub const DEFAULT_REDEEM_TTL_DAYS: i64 = 7;

// ============================================================================
// DATA STRUCTURES
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuizUser {
    pub id: i64,
    pub subject: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: i64,
    pub slug: String,
    pub title: String,
    pub description: Option<String>,
    pub theme_id: i64,
    pub is_active: bool,
    pub total_checkpoints: i32,
    pub retry_rotate_question: bool,
    pub scene_background_url: String,
    pub scene_characters: Vec<i64>,
}

/// Campaign with its theme resolved and scene characters loaded in the
/// order the campaign lists them
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignConfig {
    pub campaign: Campaign,
    pub theme: ThemeConfig,
    pub characters: Vec<QuizCharacter>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuizCharacter {
    pub id: i64,
    pub name: String,
    pub asset_idle: String,
    pub asset_correct: String,
    pub asset_wrong: String,
    pub metadata: serde_json::Value,
}

/// A checkpoint token resolved from a scanned tag
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointToken {
    pub id: i64,
    pub token: String,
    pub campaign_id: i64,
    pub checkpoint_index: i32,
    pub category_id: i64,
    pub category_name: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: i64,
    pub user_id: i64,
    pub campaign_id: i64,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCheckpoint {
    pub id: i64,
    pub session_id: i64,
    pub checkpoint_index: i32,
    pub assigned_question_id: Option<i64>,
    pub is_completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    pub id: i64,
    pub question_text: String,
    pub explanation: Option<String>,
}

/// A choice as sent to participants; never carries the correctness marker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub id: i64,
    pub question_id: i64,
    pub choice_text: String,
    pub sort_order: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionWithChoices {
    pub question: Question,
    pub choices: Vec<Choice>,
}

/// Checkpoint state returned to a scanning participant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignedCheckpoint {
    pub checkpoint: SessionCheckpoint,
    /// None when the checkpoint is already completed
    pub question: Option<Question>,
    pub choices: Vec<Choice>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointStatus {
    pub index: i32,
    pub is_completed: bool,
}

/// Dense progress summary; `checkpoints` always has `total` entries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Progress {
    pub completed: i32,
    pub total: i32,
    pub checkpoints: Vec<CheckpointStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedeemToken {
    pub id: i64,
    pub token: String,
    pub session_id: i64,
    pub expires_at: DateTime<Utc>,
    pub is_used: bool,
    pub used_at: Option<DateTime<Utc>>,
    pub kiosk_id: Option<String>,
}

/// Outcome of a graded submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradeResult {
    pub is_correct: bool,
    pub correct_choice_id: i64,
    pub explanation: Option<String>,
    pub is_checkpoint_complete: bool,
    pub is_all_complete: bool,
    pub checkpoint_index: i32,
    pub category_name: String,
    /// Set only when this submission completed the campaign
    pub redeem_token: Option<String>,
    /// Replacement question when the rotation policy fired
    pub new_question: Option<QuestionWithChoices>,
    pub progress: Progress,
}

/// Result of consuming a redemption token at a kiosk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Redemption {
    pub session_id: i64,
    pub campaign_title: String,
    pub campaign_slug: String,
    pub redeemed_at: DateTime<Utc>,
}

// ============================================================================
// PG STORAGE
// ============================================================================

#[derive(Clone)]
pub struct PgStorage {
    pool: Pool,
    redeem_ttl_days: i64,
}

impl PgStorage {
    /// Create storage from DATABASE_URL
    pub async fn new(database_url: &str, redeem_ttl_days: i64) -> Result<Self, QuizError> {
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

        let pool = config
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| QuizError::Storage(e.to_string()))?;

        // Test connection and bound statement execution server-side
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

        let storage = Self {
            pool,
            redeem_ttl_days,
        };
        storage.run_migrations().await?;

        Ok(storage)
    }

    /// Create storage from DATABASE_URL environment variable
    pub async fn from_env() -> Result<Self, QuizError> {
        let url = std::env::var("DATABASE_URL")
            .map_err(|_| QuizError::Storage("DATABASE_URL not set".to_string()))?;
        Self::new(&url, DEFAULT_REDEEM_TTL_DAYS).await
    }

    /// Run embedded migrations
    async fn run_migrations(&self) -> Result<(), QuizError> {
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
            // Run initial schema migration
            let migration_sql = include_str!("../migrations/001_schema.sql");
            client.batch_execute(migration_sql).await?;
            info!("Applied migration 001_schema");
        }

        // Check for hot-path indexes migration (version 2)
        let has_indexes: bool = client
            .query_one(
                "SELECT EXISTS(SELECT 1 FROM schema_migrations WHERE version = 2)",
                &[],
            )
            .await?
            .get(0);

        if !has_indexes {
            let migration_sql = include_str!("../migrations/002_indexes.sql");
            client.batch_execute(migration_sql).await?;
            info!("Applied migration 002_indexes");
        }

        Ok(())
    }

    // ========================================================================
    // USERS
    // ========================================================================

    /// Upsert a user by their verified provider subject.
    ///
    /// Display attributes are refreshed on every resolution but an absent
    /// value never clears what is already stored.
    pub async fn find_or_create_user(
        &self,
        subject: &str,
        display_name: Option<&str>,
        avatar_url: Option<&str>,
    ) -> Result<QuizUser, QuizError> {
        let client = self.pool.get().await?;

        let row = client
            .query_one(
                "INSERT INTO quiz_users (subject, display_name, avatar_url)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (subject)
                 DO UPDATE SET
                    display_name = COALESCE($2, quiz_users.display_name),
                    avatar_url = COALESCE($3, quiz_users.avatar_url)
                 RETURNING id, subject, display_name, avatar_url",
                &[&subject, &display_name, &avatar_url],
            )
            .await?;

        Ok(QuizUser {
            id: row.get(0),
            subject: row.get(1),
            display_name: row.get(2),
            avatar_url: row.get(3),
        })
    }

    // ========================================================================
    // CAMPAIGNS
    // ========================================================================

    /// Get a campaign with its merged theme and ordered scene characters
    pub async fn get_campaign_config(
        &self,
        campaign_id: i64,
    ) -> Result<Option<CampaignConfig>, QuizError> {
        let client = self.pool.get().await?;

        let row = client
            .query_opt(
                "SELECT c.id, c.slug, c.title, c.description, c.theme_id, c.is_active,
                        c.total_checkpoints, c.retry_rotate_question,
                        c.scene_background_url, c.scene_characters,
                        t.config
                 FROM quiz_campaigns c
                 JOIN quiz_themes t ON t.id = c.theme_id
                 WHERE c.id = $1",
                &[&campaign_id],
            )
            .await?;

        let row = match row {
            Some(r) => r,
            None => return Ok(None),
        };

        let campaign = Campaign {
            id: row.get(0),
            slug: row.get(1),
            title: row.get(2),
            description: row.get(3),
            theme_id: row.get(4),
            is_active: row.get(5),
            total_checkpoints: row.get(6),
            retry_rotate_question: row.get(7),
            scene_background_url: row.get(8),
            scene_characters: row.get(9),
        };
        let theme = merge_theme(&row.get::<_, serde_json::Value>(10));

        let characters = if campaign.scene_characters.is_empty() {
            Vec::new()
        } else {
            let rows = client
                .query(
                    "SELECT id, name, asset_idle, asset_correct, asset_wrong, metadata
                     FROM quiz_characters
                     WHERE id = ANY($1)",
                    &[&campaign.scene_characters],
                )
                .await?;

            let loaded: Vec<QuizCharacter> = rows
                .iter()
                .map(|r| QuizCharacter {
                    id: r.get(0),
                    name: r.get(1),
                    asset_idle: r.get(2),
                    asset_correct: r.get(3),
                    asset_wrong: r.get(4),
                    metadata: r.get(5),
                })
                .collect();

            order_characters(&campaign.scene_characters, &loaded)
        };

        Ok(Some(CampaignConfig {
            campaign,
            theme,
            characters,
        }))
    }

    /// Get an active campaign by its slug
    pub async fn get_campaign_by_slug(
        &self,
        slug: &str,
    ) -> Result<Option<CampaignConfig>, QuizError> {
        let client = self.pool.get().await?;

        let row = client
            .query_opt(
                "SELECT id FROM quiz_campaigns WHERE slug = $1 AND is_active = true",
                &[&slug],
            )
            .await?;

        match row {
            Some(r) => self.get_campaign_config(r.get(0)).await,
            None => Ok(None),
        }
    }

    // ========================================================================
    // CHECKPOINT TOKENS
    // ========================================================================

    /// Resolve a scanned tag token to its checkpoint, or None when the token
    /// is unknown or expired
    pub async fn validate_checkpoint_token(
        &self,
        token: &str,
    ) -> Result<Option<CheckpointToken>, QuizError> {
        let client = self.pool.get().await?;

        let row = client
            .query_opt(
                "SELECT ct.id, ct.token, ct.campaign_id, ct.checkpoint_index,
                        ct.category_id, ct.expires_at, qc.name
                 FROM checkpoint_tokens ct
                 JOIN quiz_categories qc ON qc.id = ct.category_id
                 WHERE ct.token = $1 AND ct.expires_at > NOW()",
                &[&token],
            )
            .await?;

        Ok(row.map(|r| CheckpointToken {
            id: r.get(0),
            token: r.get(1),
            campaign_id: r.get(2),
            checkpoint_index: r.get(3),
            category_id: r.get(4),
            expires_at: r.get(5),
            category_name: r.get(6),
        }))
    }

    // ========================================================================
    // SESSION MANAGER
    // ========================================================================

    /// Get or create the one session for this (user, campaign).
    ///
    /// Safe under concurrent first scans: the candidate row is locked, and
    /// the insert is a no-op upsert on the unique constraint, so the second
    /// caller observes the first caller's row instead of an error.
    pub async fn get_or_create_session(
        &self,
        user_id: i64,
        campaign_id: i64,
    ) -> Result<Session, QuizError> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let existing = tx
            .query_opt(
                "SELECT id, user_id, campaign_id, created_at, completed_at
                 FROM user_sessions
                 WHERE user_id = $1 AND campaign_id = $2
                 FOR UPDATE",
                &[&user_id, &campaign_id],
            )
            .await?;

        let row = match existing {
            Some(row) => row,
            None => {
                let row = tx
                    .query_one(
                        "INSERT INTO user_sessions (user_id, campaign_id)
                         VALUES ($1, $2)
                         ON CONFLICT (user_id, campaign_id)
                         DO UPDATE SET user_id = user_sessions.user_id
                         RETURNING id, user_id, campaign_id, created_at, completed_at",
                        &[&user_id, &campaign_id],
                    )
                    .await?;
                info!(
                    "created session {} for user {} in campaign {}",
                    row.get::<_, i64>(0),
                    user_id,
                    campaign_id
                );
                row
            }
        };

        tx.commit().await?;

        Ok(Session {
            id: row.get(0),
            user_id: row.get(1),
            campaign_id: row.get(2),
            created_at: row.get(3),
            completed_at: row.get(4),
        })
    }

    // ========================================================================
    // QUESTION ASSIGNMENT
    // ========================================================================

    /// Get or assign the question for a (session, checkpoint) pair.
    ///
    /// First visit samples uniformly from the category's active pool and
    /// records the assignment; a concurrently created row wins over ours.
    /// Completed checkpoints come back with no question or choices. Returns
    /// None when the category pool is empty.
    pub async fn get_or_assign_question(
        &self,
        session_id: i64,
        checkpoint_index: i32,
        category_id: i64,
    ) -> Result<Option<AssignedCheckpoint>, QuizError> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let existing = tx
            .query_opt(
                "SELECT id, session_id, checkpoint_index, assigned_question_id,
                        is_completed, completed_at
                 FROM session_checkpoints
                 WHERE session_id = $1 AND checkpoint_index = $2
                 FOR UPDATE",
                &[&session_id, &checkpoint_index],
            )
            .await?;

        let checkpoint = match existing {
            Some(row) => row_to_session_checkpoint(&row),
            None => {
                // First visit: sample from the category pool
                let question = match pick_question(&*tx, category_id, &[]).await? {
                    Some(q) => q,
                    None => {
                        debug!("category {} has no active questions", category_id);
                        return Ok(None);
                    }
                };

                let row = tx
                    .query_one(
                        "INSERT INTO session_checkpoints
                            (session_id, checkpoint_index, assigned_question_id)
                         VALUES ($1, $2, $3)
                         ON CONFLICT (session_id, checkpoint_index)
                         DO UPDATE SET session_id = session_checkpoints.session_id
                         RETURNING id, session_id, checkpoint_index, assigned_question_id,
                                   is_completed, completed_at",
                        &[&session_id, &checkpoint_index, &question.id],
                    )
                    .await?;
                row_to_session_checkpoint(&row)
            }
        };

        // Completed checkpoints are never re-asked
        if checkpoint.is_completed {
            tx.commit().await?;
            return Ok(Some(AssignedCheckpoint {
                checkpoint,
                question: None,
                choices: Vec::new(),
            }));
        }

        let question_id = match checkpoint.assigned_question_id {
            Some(id) => id,
            None => return Ok(None),
        };

        let question = tx
            .query_opt(
                "SELECT id, question_text, explanation FROM quiz_questions WHERE id = $1",
                &[&question_id],
            )
            .await?;
        let question = match question {
            Some(r) => Question {
                id: r.get(0),
                question_text: r.get(1),
                explanation: r.get(2),
            },
            None => return Ok(None),
        };

        let choices = load_choices(&*tx, question_id).await?;

        tx.commit().await?;

        Ok(Some(AssignedCheckpoint {
            checkpoint,
            question: Some(question),
            choices,
        }))
    }

    // ========================================================================
    // ANSWER GRADING
    // ========================================================================

    /// Grade one submission against a session-checkpoint.
    ///
    /// Runs in one transaction with the session-checkpoint row locked, so
    /// concurrent submissions for the same checkpoint are strictly ordered:
    /// only the first can transition to completed, the second sees
    /// `is_completed = true` and is rejected with no side effects. Returns
    /// None for any invalid submission (unknown checkpoint, wrong owner,
    /// already completed, choice/question mismatch) without writing anything.
    pub async fn submit_answer(
        &self,
        session_checkpoint_id: i64,
        question_id: i64,
        choice_id: i64,
        user_id: i64,
    ) -> Result<Option<GradeResult>, QuizError> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        // Lock the session-checkpoint and resolve its session and category
        let row = tx
            .query_opt(
                "SELECT sc.id, sc.session_id, sc.checkpoint_index, sc.assigned_question_id,
                        sc.is_completed, us.user_id, us.campaign_id, ct.category_id, qc.name
                 FROM session_checkpoints sc
                 JOIN user_sessions us ON us.id = sc.session_id
                 JOIN checkpoint_tokens ct ON ct.campaign_id = us.campaign_id
                                          AND ct.checkpoint_index = sc.checkpoint_index
                 JOIN quiz_categories qc ON qc.id = ct.category_id
                 WHERE sc.id = $1
                 FOR UPDATE OF sc",
                &[&session_checkpoint_id],
            )
            .await?;

        let row = match row {
            Some(r) => r,
            None => return Ok(None),
        };

        let session_id: i64 = row.get(1);
        let checkpoint_index: i32 = row.get(2);
        let is_checkpoint_completed: bool = row.get(4);
        let owner_id: i64 = row.get(5);
        let campaign_id: i64 = row.get(6);
        let category_id: i64 = row.get(7);
        let category_name: String = row.get(8);

        // Replay after completion and cross-user forgery are rejected before
        // anything is written
        if owner_id != user_id || is_checkpoint_completed {
            debug!(
                "rejected submission for checkpoint {} (owner {}, caller {}, completed {})",
                session_checkpoint_id, owner_id, user_id, is_checkpoint_completed
            );
            return Ok(None);
        }

        // The submitted choice must belong to the submitted question
        let choice = tx
            .query_opt(
                "SELECT id, is_correct FROM quiz_choices WHERE id = $1 AND question_id = $2",
                &[&choice_id, &question_id],
            )
            .await?;
        let choice = match choice {
            Some(c) => c,
            None => return Ok(None),
        };
        let is_correct: bool = choice.get(1);

        // Every validated submission is recorded, correct or not; the log
        // drives rotation exclusion
        tx.execute(
            "INSERT INTO checkpoint_attempts
                (session_checkpoint_id, question_id, choice_id, is_correct)
             VALUES ($1, $2, $3, $4)",
            &[&session_checkpoint_id, &question_id, &choice_id, &is_correct],
        )
        .await?;

        // The canonical correct choice and explanation leave the store only
        // after an attempt has been recorded
        let correct_choice_id: i64 = tx
            .query_one(
                "SELECT id FROM quiz_choices WHERE question_id = $1 AND is_correct = true",
                &[&question_id],
            )
            .await?
            .get(0);

        let explanation: Option<String> = tx
            .query_one(
                "SELECT explanation FROM quiz_questions WHERE id = $1",
                &[&question_id],
            )
            .await?
            .get(0);

        let campaign = tx
            .query_one(
                "SELECT total_checkpoints, retry_rotate_question
                 FROM quiz_campaigns WHERE id = $1",
                &[&campaign_id],
            )
            .await?;
        let total_checkpoints: i32 = campaign.get(0);
        let rotate_on_wrong: bool = campaign.get(1);

        let mut is_all_complete = false;
        let mut redeem_token: Option<String> = None;
        let mut new_question: Option<QuestionWithChoices> = None;

        if is_correct {
            tx.execute(
                "UPDATE session_checkpoints
                 SET is_completed = true, completed_at = NOW()
                 WHERE id = $1",
                &[&session_checkpoint_id],
            )
            .await?;

            let completed_count: i64 = tx
                .query_one(
                    "SELECT COUNT(*) FROM session_checkpoints
                     WHERE session_id = $1 AND is_completed = true",
                    &[&session_id],
                )
                .await?
                .get(0);

            if completed_count >= total_checkpoints as i64 {
                is_all_complete = true;

                tx.execute(
                    "UPDATE user_sessions SET completed_at = NOW() WHERE id = $1",
                    &[&session_id],
                )
                .await?;

                // Exactly one live token per session: the no-op upsert hands
                // a concurrent final answer the existing token
                let candidate = Uuid::new_v4().to_string();
                let expires_at = Utc::now() + chrono::Duration::days(self.redeem_ttl_days);
                let token: String = tx
                    .query_one(
                        "INSERT INTO redeem_tokens (token, session_id, expires_at)
                         VALUES ($1, $2, $3)
                         ON CONFLICT (session_id)
                         DO UPDATE SET session_id = redeem_tokens.session_id
                         RETURNING token",
                        &[&candidate, &session_id, &expires_at],
                    )
                    .await?
                    .get(0);

                info!("session {} completed all checkpoints, redeem token issued", session_id);
                redeem_token = Some(token);
            }
        } else if rotate_on_wrong {
            let attempted: Vec<i64> = tx
                .query(
                    "SELECT DISTINCT question_id FROM checkpoint_attempts
                     WHERE session_checkpoint_id = $1",
                    &[&session_checkpoint_id],
                )
                .await?
                .iter()
                .map(|r| r.get(0))
                .collect();

            // Prefer unseen questions; cycle back to the full pool when the
            // category is exhausted rather than stranding the player
            let next = match pick_question(&*tx, category_id, &attempted).await? {
                Some(q) => Some(q),
                None => pick_question(&*tx, category_id, &[]).await?,
            };

            if let Some(next) = next {
                tx.execute(
                    "UPDATE session_checkpoints SET assigned_question_id = $1 WHERE id = $2",
                    &[&next.id, &session_checkpoint_id],
                )
                .await?;

                let choices = load_choices(&*tx, next.id).await?;
                new_question = Some(QuestionWithChoices {
                    question: next,
                    choices,
                });
            }
        }

        let progress = progress_in_tx(&*tx, session_id, campaign_id).await?;

        tx.commit().await?;

        Ok(Some(GradeResult {
            is_correct,
            correct_choice_id,
            explanation,
            is_checkpoint_complete: is_correct,
            is_all_complete,
            checkpoint_index,
            category_name,
            redeem_token,
            new_question,
            progress,
        }))
    }

    // ========================================================================
    // PROGRESS
    // ========================================================================

    /// Project the completed/total summary for a session.
    ///
    /// The status array is always dense over `1..=total_checkpoints`;
    /// unvisited checkpoints report not-completed.
    pub async fn get_progress(
        &self,
        session_id: i64,
        campaign_id: i64,
    ) -> Result<Progress, QuizError> {
        let client = self.pool.get().await?;

        let total: i32 = match client
            .query_opt(
                "SELECT total_checkpoints FROM quiz_campaigns WHERE id = $1",
                &[&campaign_id],
            )
            .await?
        {
            Some(row) => row.get(0),
            None => return Ok(build_progress(0, &[])),
        };

        let rows = client
            .query(
                "SELECT checkpoint_index, is_completed
                 FROM session_checkpoints
                 WHERE session_id = $1
                 ORDER BY checkpoint_index",
                &[&session_id],
            )
            .await?;

        let states: Vec<(i32, bool)> = rows.iter().map(|r| (r.get(0), r.get(1))).collect();
        Ok(build_progress(total, &states))
    }

    // ========================================================================
    // REDEMPTION
    // ========================================================================

    /// Get the session's unconsumed, unexpired redemption token, if any
    pub async fn existing_redeem_token(
        &self,
        session_id: i64,
    ) -> Result<Option<RedeemToken>, QuizError> {
        let client = self.pool.get().await?;

        let row = client
            .query_opt(
                "SELECT id, token, session_id, expires_at, is_used, used_at, kiosk_id
                 FROM redeem_tokens
                 WHERE session_id = $1 AND is_used = false AND expires_at > NOW()",
                &[&session_id],
            )
            .await?;

        Ok(row.map(|r| RedeemToken {
            id: r.get(0),
            token: r.get(1),
            session_id: r.get(2),
            expires_at: r.get(3),
            is_used: r.get(4),
            used_at: r.get(5),
            kiosk_id: r.get(6),
        }))
    }

    /// Atomically consume a redemption token for a kiosk.
    ///
    /// The conditional update is the concurrency control: only a row that is
    /// still unused and unexpired matches, so concurrent scans of the same
    /// code resolve to at most one success. None never distinguishes unknown
    /// from expired from already used.
    pub async fn redeem(
        &self,
        token: &str,
        kiosk_id: &str,
    ) -> Result<Option<Redemption>, QuizError> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let row = tx
            .query_opt(
                "UPDATE redeem_tokens
                 SET is_used = true, used_at = NOW(), kiosk_id = $2
                 WHERE token = $1 AND is_used = false AND expires_at > NOW()
                 RETURNING session_id, used_at",
                &[&token, &kiosk_id],
            )
            .await?;

        let row = match row {
            Some(r) => r,
            None => return Ok(None),
        };
        let session_id: i64 = row.get(0);
        let redeemed_at: DateTime<Utc> = row.get(1);

        let campaign = tx
            .query_one(
                "SELECT c.title, c.slug
                 FROM user_sessions us
                 JOIN quiz_campaigns c ON c.id = us.campaign_id
                 WHERE us.id = $1",
                &[&session_id],
            )
            .await?;

        tx.commit().await?;

        info!("redeem token consumed for session {} by kiosk {}", session_id, kiosk_id);

        Ok(Some(Redemption {
            session_id,
            campaign_title: campaign.get(0),
            campaign_slug: campaign.get(1),
            redeemed_at,
        }))
    }
}

// ============================================================================
// HELPERS
// ============================================================================

fn row_to_session_checkpoint(row: &tokio_postgres::Row) -> SessionCheckpoint {
    SessionCheckpoint {
        id: row.get(0),
        session_id: row.get(1),
        checkpoint_index: row.get(2),
        assigned_question_id: row.get(3),
        is_completed: row.get(4),
        completed_at: row.get(5),
    }
}

/// Sample one active question uniformly from the category pool, excluding
/// the given question ids
async fn pick_question<C: GenericClient>(
    client: &C,
    category_id: i64,
    exclude: &[i64],
) -> Result<Option<Question>, QuizError> {
    let row = client
        .query_opt(
            "SELECT id, question_text, explanation
             FROM quiz_questions
             WHERE category_id = $1 AND is_active = true AND id != ALL($2::bigint[])
             ORDER BY RANDOM()
             LIMIT 1",
            &[&category_id, &exclude],
        )
        .await?;

    Ok(row.map(|r| Question {
        id: r.get(0),
        question_text: r.get(1),
        explanation: r.get(2),
    }))
}

/// Load a question's choices in their stable display order
async fn load_choices<C: GenericClient>(
    client: &C,
    question_id: i64,
) -> Result<Vec<Choice>, QuizError> {
    let rows = client
        .query(
            "SELECT id, question_id, choice_text, sort_order
             FROM quiz_choices
             WHERE question_id = $1
             ORDER BY sort_order",
            &[&question_id],
        )
        .await?;

    Ok(rows
        .iter()
        .map(|r| Choice {
            id: r.get(0),
            question_id: r.get(1),
            choice_text: r.get(2),
            sort_order: r.get(3),
        })
        .collect())
}

async fn progress_in_tx<C: GenericClient>(
    client: &C,
    session_id: i64,
    campaign_id: i64,
) -> Result<Progress, QuizError> {
    let total: i32 = client
        .query_one(
            "SELECT total_checkpoints FROM quiz_campaigns WHERE id = $1",
            &[&campaign_id],
        )
        .await?
        .get(0);

    let rows = client
        .query(
            "SELECT checkpoint_index, is_completed
             FROM session_checkpoints
             WHERE session_id = $1
             ORDER BY checkpoint_index",
            &[&session_id],
        )
        .await?;

    let states: Vec<(i32, bool)> = rows.iter().map(|r| (r.get(0), r.get(1))).collect();
    Ok(build_progress(total, &states))
}

/// Build the dense per-checkpoint status array.
///
/// Length is always `total`, indexed 1..=total; the sparse row set never
/// determines the shape.
fn build_progress(total: i32, states: &[(i32, bool)]) -> Progress {
    let completed = states.iter().filter(|(_, done)| *done).count() as i32;
    let checkpoints = (1..=total)
        .map(|index| CheckpointStatus {
            index,
            is_completed: states
                .iter()
                .any(|(i, done)| *i == index && *done),
        })
        .collect();

    Progress {
        completed,
        total,
        checkpoints,
    }
}

/// Resolve characters in the order the campaign lists them, skipping ids
/// that no longer exist
fn order_characters(ids: &[i64], loaded: &[QuizCharacter]) -> Vec<QuizCharacter> {
    ids.iter()
        .filter_map(|id| loaded.iter().find(|c| c.id == *id).cloned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn character(id: i64, name: &str) -> QuizCharacter {
        QuizCharacter {
            id,
            name: name.to_string(),
            asset_idle: format!("/assets/{}_idle.png", name),
            asset_correct: format!("/assets/{}_correct.png", name),
            asset_wrong: format!("/assets/{}_wrong.png", name),
            metadata: serde_json::json!({}),
        }
    }

    #[test]
    fn test_progress_is_dense_with_no_rows() {
        let progress = build_progress(5, &[]);
        assert_eq!(progress.total, 5);
        assert_eq!(progress.completed, 0);
        assert_eq!(progress.checkpoints.len(), 5);
        assert!(progress.checkpoints.iter().all(|c| !c.is_completed));
        assert_eq!(progress.checkpoints[0].index, 1);
        assert_eq!(progress.checkpoints[4].index, 5);
    }

    #[test]
    fn test_progress_with_sparse_rows() {
        // Only checkpoints 2 and 4 have been visited; 4 is completed
        let progress = build_progress(5, &[(2, false), (4, true)]);
        assert_eq!(progress.completed, 1);
        assert_eq!(progress.checkpoints.len(), 5);
        assert!(!progress.checkpoints[1].is_completed);
        assert!(progress.checkpoints[3].is_completed);
    }

    #[test]
    fn test_progress_all_complete() {
        let states: Vec<(i32, bool)> = (1..=3).map(|i| (i, true)).collect();
        let progress = build_progress(3, &states);
        assert_eq!(progress.completed, 3);
        assert!(progress.checkpoints.iter().all(|c| c.is_completed));
    }

    #[test]
    fn test_progress_zero_total() {
        let progress = build_progress(0, &[]);
        assert_eq!(progress.total, 0);
        assert!(progress.checkpoints.is_empty());
    }

    #[test]
    fn test_characters_keep_campaign_order() {
        let loaded = vec![character(1, "fox"), character(2, "owl"), character(3, "hare")];
        let ordered = order_characters(&[3, 1, 2], &loaded);
        let names: Vec<_> = ordered.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["hare", "fox", "owl"]);
    }

    #[test]
    fn test_missing_characters_are_skipped() {
        let loaded = vec![character(1, "fox")];
        let ordered = order_characters(&[9, 1], &loaded);
        assert_eq!(ordered.len(), 1);
        assert_eq!(ordered[0].id, 1);
    }
}
