//! Checkpoint Quiz Server
//!
//! HTTP endpoints for the scan → answer → redeem flow.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};

use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::error::QuizError;
use crate::identity::IdentityVerifier;
use crate::pg_storage::{CampaignConfig, Choice, PgStorage, Progress, Question};

/// Uniform kiosk failure: never distinguishes unknown, expired, or replayed
const REDEEM_FAILURE_MSG: &str = "Invalid, expired, or already used redeem token";

pub struct AppState {
    pub storage: Arc<PgStorage>,
    pub identity: Arc<IdentityVerifier>,
    pub started_at: std::time::Instant,
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/auth/verify", post(verify_handler))
        .route("/api/campaign/:slug", get(campaign_handler))
        .route("/api/scan/enter", get(scan_enter_handler))
        .route("/api/answer", post(answer_handler))
        .route("/api/kiosk/redeem", post(redeem_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ============================================================================
// GET /health
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub uptime_secs: u64,
    pub version: String,
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        healthy: true,
        uptime_secs: state.started_at.elapsed().as_secs(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============================================================================
// POST /api/auth/verify - confirm login and upsert the user
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    pub id_token: String,
}

#[derive(Debug, Serialize)]
pub struct VerifyResponse {
    pub user: UserView,
}

#[derive(Debug, Serialize)]
pub struct UserView {
    pub id: i64,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

async fn verify_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<VerifyRequest>,
) -> Result<Json<VerifyResponse>, QuizError> {
    if request.id_token.is_empty() {
        return Err(QuizError::Validation("Missing id_token".to_string()));
    }

    let identity = state.identity.verify(&request.id_token).await?;
    let user = state
        .storage
        .find_or_create_user(
            &identity.subject,
            identity.display_name.as_deref(),
            identity.avatar_url.as_deref(),
        )
        .await?;

    Ok(Json(VerifyResponse {
        user: UserView {
            id: user.id,
            display_name: user.display_name,
            avatar_url: user.avatar_url,
        },
    }))
}

// ============================================================================
// GET /api/campaign/{slug} - campaign config for rendering clients
// ============================================================================

async fn campaign_handler(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
) -> Result<Json<CampaignConfig>, QuizError> {
    let config = state
        .storage
        .get_campaign_by_slug(&slug)
        .await?
        .ok_or_else(|| QuizError::NotFound("Campaign not found".to_string()))?;

    Ok(Json(config))
}

// ============================================================================
// GET /api/scan/enter - enter a checkpoint from a scanned tag
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ScanEnterQuery {
    pub checkpoint_token: String,
    pub id_token: String,
}

#[derive(Debug, Serialize)]
pub struct CheckpointSummary {
    pub index: i32,
    pub category_name: String,
    pub is_completed: bool,
}

#[derive(Debug, Serialize)]
pub struct QuestionView {
    pub id: i64,
    pub text: String,
    pub choices: Vec<Choice>,
}

impl QuestionView {
    fn new(question: Question, choices: Vec<Choice>) -> Self {
        Self {
            id: question.id,
            text: question.question_text,
            choices,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ScanEnterResponse {
    pub campaign: CampaignConfig,
    pub checkpoint: CheckpointSummary,
    pub progress: Progress,
    /// None when this checkpoint is already completed
    pub question: Option<QuestionView>,
    pub session_checkpoint_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redeem_token: Option<String>,
}

async fn scan_enter_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ScanEnterQuery>,
) -> Result<Json<ScanEnterResponse>, QuizError> {
    if query.checkpoint_token.is_empty() || query.id_token.is_empty() {
        return Err(QuizError::Validation(
            "Missing checkpoint_token or id_token".to_string(),
        ));
    }

    // Resolve the scanned tag before touching identity or progress
    let cp_token = state
        .storage
        .validate_checkpoint_token(&query.checkpoint_token)
        .await?
        .ok_or_else(|| {
            QuizError::NotFound("Invalid or expired checkpoint token".to_string())
        })?;

    let identity = state.identity.verify(&query.id_token).await?;
    let user = state
        .storage
        .find_or_create_user(
            &identity.subject,
            identity.display_name.as_deref(),
            identity.avatar_url.as_deref(),
        )
        .await?;

    let session = state
        .storage
        .get_or_create_session(user.id, cp_token.campaign_id)
        .await?;

    let campaign = state
        .storage
        .get_campaign_config(cp_token.campaign_id)
        .await?
        .ok_or_else(|| QuizError::NotFound("Campaign not found".to_string()))?;

    let assigned = state
        .storage
        .get_or_assign_question(session.id, cp_token.checkpoint_index, cp_token.category_id)
        .await?
        .ok_or_else(|| QuizError::NotFound("No questions available".to_string()))?;

    let progress = state
        .storage
        .get_progress(session.id, cp_token.campaign_id)
        .await?;

    // Completed campaigns surface the still-unconsumed redeem token on
    // every subsequent scan
    let redeem_token = if progress.completed >= progress.total {
        state
            .storage
            .existing_redeem_token(session.id)
            .await?
            .map(|t| t.token)
    } else {
        None
    };

    let question = match assigned.question {
        Some(q) => Some(QuestionView::new(q, assigned.choices)),
        None => None,
    };

    Ok(Json(ScanEnterResponse {
        campaign,
        checkpoint: CheckpointSummary {
            index: cp_token.checkpoint_index,
            category_name: cp_token.category_name,
            is_completed: assigned.checkpoint.is_completed,
        },
        progress,
        question,
        session_checkpoint_id: assigned.checkpoint.id,
        redeem_token,
    }))
}

// ============================================================================
// POST /api/answer - grade a submission
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct AnswerRequest {
    pub session_checkpoint_id: i64,
    pub question_id: i64,
    pub choice_id: i64,
    pub id_token: String,
}

#[derive(Debug, Serialize)]
pub struct AnswerResponse {
    pub is_correct: bool,
    pub correct_choice_id: i64,
    pub explanation: Option<String>,
    pub checkpoint: CheckpointSummary,
    pub progress: Progress,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_question: Option<QuestionView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redeem_token: Option<String>,
}

async fn answer_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AnswerRequest>,
) -> Result<Json<AnswerResponse>, QuizError> {
    if request.id_token.is_empty() {
        return Err(QuizError::Validation("Missing id_token".to_string()));
    }

    let identity = state.identity.verify(&request.id_token).await?;
    let user = state
        .storage
        .find_or_create_user(
            &identity.subject,
            identity.display_name.as_deref(),
            identity.avatar_url.as_deref(),
        )
        .await?;

    let result = state
        .storage
        .submit_answer(
            request.session_checkpoint_id,
            request.question_id,
            request.choice_id,
            user.id,
        )
        .await?
        .ok_or(QuizError::InvalidSubmission)?;

    Ok(Json(AnswerResponse {
        is_correct: result.is_correct,
        correct_choice_id: result.correct_choice_id,
        explanation: result.explanation,
        checkpoint: CheckpointSummary {
            index: result.checkpoint_index,
            category_name: result.category_name,
            is_completed: result.is_checkpoint_complete,
        },
        progress: result.progress,
        new_question: result
            .new_question
            .map(|q| QuestionView::new(q.question, q.choices)),
        redeem_token: result.redeem_token,
    }))
}

// ============================================================================
// POST /api/kiosk/redeem - consume a redemption token
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct RedeemRequest {
    pub redeem_token: String,
    pub kiosk_id: String,
}

#[derive(Debug, Serialize)]
pub struct RedeemResponse {
    pub success: bool,
    pub campaign: RedeemCampaignView,
    pub redeemed_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Serialize)]
pub struct RedeemCampaignView {
    pub title: String,
    pub slug: String,
}

async fn redeem_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RedeemRequest>,
) -> Result<Response, QuizError> {
    if request.redeem_token.is_empty() || request.kiosk_id.is_empty() {
        return Err(QuizError::Validation(
            "Missing redeem_token or kiosk_id".to_string(),
        ));
    }

    match state
        .storage
        .redeem(&request.redeem_token, &request.kiosk_id)
        .await?
    {
        Some(redemption) => Ok(Json(RedeemResponse {
            success: true,
            campaign: RedeemCampaignView {
                title: redemption.campaign_title,
                slug: redemption.campaign_slug,
            },
            redeemed_at: redemption.redeemed_at,
        })
        .into_response()),
        None => Ok((
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "success": false,
                "error": REDEEM_FAILURE_MSG,
            })),
        )
            .into_response()),
    }
}

// ============================================================================
// SERVER
// ============================================================================

/// Run the server
pub async fn run_server(
    host: &str,
    port: u16,
    storage: Arc<PgStorage>,
    identity: Arc<IdentityVerifier>,
) -> anyhow::Result<()> {
    let state = Arc::new(AppState {
        storage,
        identity,
        started_at: std::time::Instant::now(),
    });

    let app = create_router(state);
    let addr = format!("{}:{}", host, port);

    info!("Starting Checkpoint Quiz server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
