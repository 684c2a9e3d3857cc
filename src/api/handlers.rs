//! HTTP request handlers

use super::types::{
    CompleteSessionRequest, CreateSessionRequest, Envelope, MessageBatchRequest,
    ReportTaskRequest, TransferSessionRequest,
};
use super::AppState;
use crate::admission::{AdmissionDecision, AdmissionRequest};
use crate::db::DbError;
use crate::ingest::{IngestError, IngestRequest};
use crate::session::TaskType;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::json;
use std::future::Future;

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Liveness
        .route("/", get(health))
        .route("/health", get(health))
        // Admission
        .route("/api/sessions/create", post(create_session))
        // Session lifecycle
        .route("/api/sessions/:session_id", get(get_session))
        .route("/api/sessions/:session_id/complete", post(complete_session))
        .route("/api/sessions/:session_id/transfer", post(transfer_session))
        // Worker hand-off
        .route("/api/tasks/next_id", get(next_task_id))
        .route("/api/tasks/:task_id/send_info", get(send_info))
        .route("/api/tasks/:task_id/complete", post(report_task))
        .route("/api/tasks/:task_id/retry", post(retry_task))
        // Ingestion
        .route("/api/messages/batch", post(ingest_batch))
        .with_state(state)
}

// ============================================================
// Liveness
// ============================================================

async fn health() -> Json<Envelope> {
    Json(Envelope::ok(
        "ok",
        Some(json!({
            "service": "parley",
            "version": env!("CARGO_PKG_VERSION"),
        })),
    ))
}

// ============================================================
// Admission
// ============================================================

async fn create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateSessionRequest>,
) -> Result<Json<Envelope>, AppError> {
    with_deadline(&headers, async move {
        let task_type = TaskType::parse(&req.task_type)
            .ok_or_else(|| AppError::Validation(format!("unknown task_type: {}", req.task_type)))?;
        if req.account_id.trim().is_empty() || req.shop_id.trim().is_empty() {
            return Err(AppError::Validation(
                "account_id and shop_id are required".to_string(),
            ));
        }
        if task_type.is_bot() && req.send_content.trim().is_empty() {
            return Err(AppError::Validation(
                "send_content is required for bot sessions".to_string(),
            ));
        }

        let decision = state.admission.admit(
            &AdmissionRequest {
                account_id: req.account_id,
                shop_id: req.shop_id,
                shop_name: req.shop_name,
                platform: req.platform,
                task_type,
                external_task_id: req.external_task_id,
                send_content: req.send_content,
                max_inactive_minutes: req.max_inactive_minutes,
            },
            Utc::now(),
        )?;

        match decision {
            AdmissionDecision::Accepted {
                session,
                task_id,
                preempted_session_id,
            } => Ok(Json(Envelope::ok(
                "session created",
                Some(json!({
                    "session_id": session.id,
                    "external_task_id": session.external_task_id,
                    "task_type": session.task_type,
                    "created_at": session.created_at,
                    "task_id": task_id,
                    "preempted_session_id": preempted_session_id,
                })),
            ))),
            AdmissionDecision::Duplicate { session } => Ok(Json(Envelope::ok(
                "duplicate external_task_id, returning original session",
                Some(json!({
                    "session_id": session.id,
                    "external_task_id": session.external_task_id,
                    "task_type": session.task_type,
                    "created_at": session.created_at,
                    "duplicate": true,
                })),
            ))),
            AdmissionDecision::Conflict {
                conflict_session_id,
                conflict_task_type,
            } => Err(AppError::Conflict {
                message: "an active session already exists for this account and shop".to_string(),
                data: Some(json!({
                    "conflict_session_id": conflict_session_id,
                    "conflict_task_type": conflict_task_type,
                })),
            }),
        }
    })
    .await
}

// ============================================================
// Session Lifecycle
// ============================================================

async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Envelope>, AppError> {
    let session = state.manager.get(&session_id)?;
    let messages = state.db.messages_for_session(&session_id)?;
    let transfers = state.db.transfers_for_session(&session_id)?;
    Ok(Json(Envelope::ok(
        "session",
        Some(json!({
            "session": session,
            "messages": messages,
            "transfers": transfers,
        })),
    )))
}

async fn complete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<CompleteSessionRequest>,
) -> Result<Json<Envelope>, AppError> {
    with_deadline(&headers, async move {
        let outcome = state.manager.complete(
            &session_id,
            req.success,
            req.error_message.as_deref(),
            Utc::now(),
        )?;
        Ok(Json(Envelope::ok(
            "session completion processed",
            Some(json!({
                "session_id": outcome.session.id,
                "state": outcome.session.state,
                "task_id": outcome.task.as_ref().map(|t| t.task_id),
                "task_status": outcome.task.as_ref().map(|t| t.status),
            })),
        )))
    })
    .await
}

async fn transfer_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<TransferSessionRequest>,
) -> Result<Json<Envelope>, AppError> {
    with_deadline(&headers, async move {
        let session =
            state
                .manager
                .transfer(&session_id, &req.reason, &req.urgency, Utc::now())?;
        Ok(Json(Envelope::ok(
            "session transferred",
            Some(json!({
                "session_id": session.id,
                "state": session.state,
                "transferred_at": session.transferred_at,
            })),
        )))
    })
    .await
}

// ============================================================
// Worker Hand-off
// ============================================================

async fn next_task_id(State(state): State<AppState>) -> Json<Envelope> {
    match state.dispatcher.next_task_id() {
        Some(task_id) => Json(Envelope::ok(
            "task available",
            Some(json!({
                // Queue payloads are the decimal string form of the id.
                "task_id": task_id.to_string(),
                "timestamp": Utc::now(),
            })),
        )),
        None => Json(Envelope {
            success: false,
            message: "queue empty".to_string(),
            data: Some(json!({ "task_id": null })),
            error_code: None,
        }),
    }
}

async fn send_info(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Envelope>, AppError> {
    with_deadline(&headers, async move {
        let task_id = parse_task_id(&task_id)?;
        let info = state.dispatcher.get_send_info(task_id, Utc::now())?;
        Ok(Json(Envelope::ok(
            "send info",
            Some(serde_json::to_value(info).unwrap_or(serde_json::Value::Null)),
        )))
    })
    .await
}

async fn report_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<ReportTaskRequest>,
) -> Result<Json<Envelope>, AppError> {
    with_deadline(&headers, async move {
        let task_id = parse_task_id(&task_id)?;
        let (task, session) = state.dispatcher.report(
            task_id,
            req.success,
            req.error_message.as_deref(),
            Utc::now(),
        )?;
        Ok(Json(Envelope::ok(
            "send report processed",
            Some(json!({
                "task_id": task.task_id,
                "task_status": task.status,
                "session_id": session.id,
                "session_state": session.state,
            })),
        )))
    })
    .await
}

async fn retry_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<Envelope>, AppError> {
    let task_id = parse_task_id(&task_id)?;
    // Surface a miss as TASK_NOT_FOUND rather than a silent no-op.
    let task = state.db.get_task(task_id)?;
    let requeued = state.dispatcher.retry(task_id, Utc::now())?;
    Ok(Json(Envelope::ok(
        if requeued {
            "task requeued"
        } else {
            "task not in a retryable state"
        },
        Some(json!({
            "task_id": task.task_id,
            "requeued": requeued,
        })),
    )))
}

// ============================================================
// Ingestion
// ============================================================

async fn ingest_batch(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<MessageBatchRequest>,
) -> Result<Json<Envelope>, AppError> {
    with_deadline(&headers, async move {
        let summary = state.ingestor.ingest(
            &IngestRequest {
                shop_name: req.shop_name,
                platform: req.platform,
                max_inactive_minutes: req.max_inactive_minutes,
                account_id: req.account_id,
                messages: req.messages,
            },
            Utc::now(),
        )?;
        Ok(Json(Envelope::ok(
            "batch ingested",
            Some(serde_json::to_value(summary).unwrap_or(serde_json::Value::Null)),
        )))
    })
    .await
}

fn parse_task_id(raw: &str) -> Result<i64, AppError> {
    raw.parse()
        .map_err(|_| AppError::Validation(format!("invalid task id: {raw}")))
}

// ============================================================
// Deadlines
// ============================================================

/// Enforce the caller's `x-deadline-ms` budget around a handler body.
async fn with_deadline<T>(
    headers: &HeaderMap,
    fut: impl Future<Output = Result<T, AppError>>,
) -> Result<T, AppError> {
    let limit = headers
        .get("x-deadline-ms")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(std::time::Duration::from_millis);
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| AppError::DeadlineExceeded)?,
        None => fut.await,
    }
}

// ============================================================
// Error Handling
// ============================================================

pub(super) enum AppError {
    Validation(String),
    NoAccount,
    NotFound { code: &'static str, message: String },
    InvalidState(String),
    Conflict { message: String, data: Option<serde_json::Value> },
    Unavailable(String),
    DeadlineExceeded,
    Internal(String),
}

impl From<DbError> for AppError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::SessionNotFound(id) => AppError::NotFound {
                code: "SESSION_NOT_FOUND",
                message: format!("session not found: {id}"),
            },
            DbError::TaskNotFound(id) => AppError::NotFound {
                code: "TASK_NOT_FOUND",
                message: format!("task not found: {id}"),
            },
            DbError::Transition(e) => AppError::InvalidState(e.to_string()),
            DbError::SlotTaken => AppError::Conflict {
                message: "an active session already exists for this account and shop".to_string(),
                data: None,
            },
            DbError::DuplicateExternalTask(ext) => AppError::Conflict {
                message: format!("external_task_id already exists: {ext}"),
                data: None,
            },
            DbError::Busy => AppError::Unavailable("store busy".to_string()),
            DbError::Sqlite(e) => AppError::Internal(e.to_string()),
        }
    }
}

impl From<IngestError> for AppError {
    fn from(e: IngestError) -> Self {
        match e {
            IngestError::NoAccount => AppError::NoAccount,
            IngestError::Db(e) => e.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message, data) = match self {
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION", msg, None),
            AppError::NoAccount => (
                StatusCode::BAD_REQUEST,
                "NO_ACCOUNT",
                "no account identity in batch".to_string(),
                None,
            ),
            AppError::NotFound { code, message } => (StatusCode::NOT_FOUND, code, message, None),
            AppError::InvalidState(msg) => (StatusCode::CONFLICT, "INVALID_STATE", msg, None),
            AppError::Conflict { message, data } => {
                (StatusCode::CONFLICT, "UNAVAILABLE", message, data)
            }
            AppError::Unavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE", msg, None)
            }
            AppError::DeadlineExceeded => (
                StatusCode::GATEWAY_TIMEOUT,
                "DEADLINE_EXCEEDED",
                "request deadline exceeded".to_string(),
                None,
            ),
            AppError::Internal(msg) => {
                tracing::error!(error = %msg, "Internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", msg, None)
            }
        };

        let body = Json(Envelope::err(message, code, data));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_errors_map_to_stable_codes() {
        let err: AppError = DbError::SessionNotFound("s-1".to_string()).into();
        assert!(matches!(
            err,
            AppError::NotFound { code: "SESSION_NOT_FOUND", .. }
        ));

        let err: AppError = DbError::TaskNotFound(7).into();
        assert!(matches!(err, AppError::NotFound { code: "TASK_NOT_FOUND", .. }));

        let err: AppError = DbError::Busy.into();
        assert!(matches!(err, AppError::Unavailable(_)));

        let err: AppError = IngestError::NoAccount.into();
        assert!(matches!(err, AppError::NoAccount));
    }

    #[tokio::test]
    async fn deadline_header_cuts_off_slow_work() {
        let mut headers = HeaderMap::new();
        headers.insert("x-deadline-ms", "10".parse().unwrap());

        let result: Result<(), AppError> = with_deadline(&headers, async {
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(AppError::DeadlineExceeded)));

        // No header, no limit.
        let result: Result<u8, AppError> =
            with_deadline(&HeaderMap::new(), async { Ok(7) }).await;
        assert_eq!(result.ok(), Some(7));
    }
}
