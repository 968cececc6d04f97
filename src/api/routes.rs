//! HTTP route handlers.

use std::convert::Infallible;
use std::sync::Arc;

use axum::middleware;
use axum::{
    extract::{Extension, Path, Query, State},
    response::{
        sse::{Event, KeepAlive, Sse},
        Json,
    },
    routing::{get, post, put},
    Router,
};
use futures::stream::Stream;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::ledger::{Transaction, UserId};
use crate::market::{
    ApprovalReceipt, BroadcastEventSink, DomainEvent, Marketplace, PageRequest, SubmitOutcome, TaskPage,
};
use crate::store::UserProfile;
use crate::task::{Execution, ExecutionId, Task, TaskId, TaskSpec, TaskType};

use super::auth::{self, Caller};
use super::error::ApiError;
use super::types::*;

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub market: Arc<Marketplace>,
    /// Source of the SSE stream
    pub events: BroadcastEventSink,
    /// Cancelled on shutdown; ends open event streams
    pub shutdown: CancellationToken,
}

/// Build the application router.
pub fn router(state: Arc<AppState>) -> Router {
    let public_routes = Router::new().route("/api/health", get(health));

    let protected_routes = Router::new()
        .route("/api/users/:id", put(register_user))
        .route("/api/accounts/:id", get(get_account))
        .route("/api/accounts/:id/deposit", post(deposit))
        .route("/api/tasks", post(create_task))
        .route("/api/tasks/eligible", get(list_eligible))
        .route("/api/tasks/:id", get(get_task))
        .route("/api/tasks/:id/submit", post(submit))
        .route("/api/tasks/:id/pause", post(pause_task))
        .route("/api/tasks/:id/resume", post(resume_task))
        .route("/api/tasks/:id/cancel", post(cancel_task))
        .route("/api/tasks/:id/pending", get(pending_executions))
        .route("/api/executions/:id", get(get_execution))
        .route("/api/executions/:id/approve", post(approve))
        .route("/api/executions/:id/reject", post(reject))
        .route("/api/executions/:id/appeal", post(appeal))
        .route("/api/events", get(stream_events))
        .layer(middleware::from_fn(auth::require_identity));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server. Returns once a shutdown signal arrives or
/// `shutdown` is cancelled.
pub async fn serve(
    config: Config,
    market: Arc<Marketplace>,
    events: BroadcastEventSink,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let state = Arc::new(AppState {
        config,
        market,
        events,
        shutdown: shutdown.clone(),
    });
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    // Setup graceful shutdown on SIGTERM/SIGINT
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal(shutdown).await;
        })
        .await?;

    Ok(())
}

/// Wait for a shutdown signal, then cancel background work.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = shutdown.cancelled() => {},
    }

    tracing::info!("Shutdown signal received, stopping sweep and event streams");
    shutdown.cancel();
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        persistent: state.market.is_persistent(),
    })
}

// ---- users & accounts ----

async fn register_user(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
    Json(req): Json<RegisterUserRequest>,
) -> ApiResult<UserProfile> {
    caller.require_moderator()?;
    let profile = state.market.register_user(UserId::new(id), req.level).await?;
    Ok(Json(profile))
}

async fn deposit(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
    Json(req): Json<DepositRequest>,
) -> ApiResult<Transaction> {
    caller.require_moderator()?;
    let tx = state
        .market
        .deposit(&UserId::new(id), req.amount, &req.reference)
        .await?;
    Ok(Json(tx))
}

async fn get_account(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
) -> ApiResult<AccountResponse> {
    let account = UserId::new(id);
    caller.require_self_or_moderator(&account)?;
    let user = state.market.user(&account).await?;
    let balance = state.market.balance(&account).await?;
    let transactions = state.market.transactions(&account).await?;
    Ok(Json(AccountResponse {
        user,
        balance,
        transactions,
    }))
}

// ---- tasks ----

async fn create_task(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Json(spec): Json<TaskSpec>,
) -> ApiResult<Task> {
    let task = state.market.create_task(&caller.user_id, spec).await?;
    Ok(Json(task))
}

async fn list_eligible(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Query(query): Query<EligibleQuery>,
) -> ApiResult<TaskPage> {
    let task_type = match query.task_type.as_deref() {
        Some(raw) => Some(
            TaskType::parse(raw).ok_or_else(|| ApiError::bad_request(format!("unknown task type: {}", raw)))?,
        ),
        None => None,
    };
    let profile = state.market.user(&caller.user_id).await?;
    let page = state
        .market
        .list_eligible(
            &caller.user_id,
            profile.level,
            task_type,
            PageRequest {
                cursor: query.cursor,
                limit: query.limit,
            },
        )
        .await?;
    Ok(Json(page))
}

async fn get_task(State(state): State<Arc<AppState>>, Path(id): Path<TaskId>) -> ApiResult<Task> {
    Ok(Json(state.market.get_task(id).await?))
}

async fn submit(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<TaskId>,
    body: Option<Json<SubmitRequest>>,
) -> ApiResult<SubmitOutcome> {
    let proof_ref = body.and_then(|Json(req)| req.proof_ref);
    let outcome = state.market.submit(&caller.user_id, id, proof_ref).await?;
    Ok(Json(outcome))
}

async fn pause_task(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<TaskId>,
) -> ApiResult<Task> {
    Ok(Json(state.market.pause(id, &caller.user_id).await?))
}

async fn resume_task(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<TaskId>,
) -> ApiResult<Task> {
    Ok(Json(state.market.resume(id, &caller.user_id).await?))
}

async fn cancel_task(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<TaskId>,
    Json(req): Json<ReasonRequest>,
) -> ApiResult<Task> {
    let task = state.market.cancel(id, &caller.actor(), &req.reason).await?;
    Ok(Json(task))
}

async fn pending_executions(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<TaskId>,
) -> ApiResult<Vec<Execution>> {
    Ok(Json(state.market.pending_for_task(id, &caller.actor()).await?))
}

// ---- executions ----

async fn get_execution(State(state): State<Arc<AppState>>, Path(id): Path<ExecutionId>) -> ApiResult<Execution> {
    Ok(Json(state.market.get_execution(id).await?))
}

async fn approve(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<ExecutionId>,
) -> ApiResult<ApprovalReceipt> {
    Ok(Json(state.market.approve(id, caller.actor()).await?))
}

async fn reject(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<ExecutionId>,
    Json(req): Json<ReasonRequest>,
) -> ApiResult<Execution> {
    Ok(Json(state.market.reject(id, caller.actor(), &req.reason).await?))
}

async fn appeal(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<ExecutionId>,
    body: Option<Json<AppealRequest>>,
) -> ApiResult<Execution> {
    let note = body.and_then(|Json(req)| req.note);
    Ok(Json(state.market.appeal(id, &caller.user_id, note).await?))
}

// ---- events ----

/// Moderators see every event; users see the events addressed to them.
fn visible_to(event: &DomainEvent, caller: &Caller) -> bool {
    caller.moderator || event.recipient() == Some(&caller.user_id)
}

/// Stream domain events via SSE.
async fn stream_events(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.events.subscribe();
    let shutdown = state.shutdown.clone();

    let stream = async_stream::stream! {
        loop {
            tokio::select! {
                result = rx.recv() => {
                    match result {
                        Ok(ev) => {
                            if !visible_to(&ev, &caller) {
                                continue;
                            }
                            match Event::default().event(ev.event_name()).json_data(&ev) {
                                Ok(sse) => yield Ok(sse),
                                Err(e) => tracing::warn!(event = ev.event_name(), "Failed to encode event: {}", e),
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            let sse = Event::default()
                                .event("error")
                                .data(format!("event stream lagged; {} events were dropped", skipped));
                            yield Ok(sse);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("keepalive"),
    )
}
