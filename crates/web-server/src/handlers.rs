use crate::models::{NewSubscriber, Subscriber, SubscriberProfile, SUBSCRIBER_ID_SEQUENCE};
use crate::{error::AppError, AppState};
use axum::{
    extract::{Path, State},
    Json,
};
use chrono::Utc;
use database::{classify, Session, SessionScope};
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;

/// The success half of the `{status, data}` response envelope.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub status: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

fn success<T>(data: T) -> Json<ApiResponse<T>> {
    Json(ApiResponse {
        status: true,
        data: Some(data),
    })
}

/// # GET /test/ping
pub async fn ping() -> Json<ApiResponse<&'static str>> {
    success("pong")
}

/// # GET /api/health
/// Answers 200 with the engine's endpoint and limits when its startup probe
/// succeeded, 503 otherwise.
pub async fn health(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ApiResponse<JsonValue>>, AppError> {
    let engine = state.registry.get_healthy_engine()?;
    let limits = engine.limits();
    Ok(success(json!({
        "engine": engine.descriptor(),
        "max_open_connections": limits.max_open,
        "max_idle_connections": limits.max_idle,
    })))
}

/// # POST /api/subscribers
pub async fn create_subscriber(
    State(state): State<Arc<AppState>>,
    Json(body): Json<NewSubscriber>,
) -> Result<Json<ApiResponse<Subscriber>>, AppError> {
    body.validate()?;
    let id = state.sequences.next_value(SUBSCRIBER_ID_SEQUENCE).await?;
    let subscriber = body.into_subscriber(id, Utc::now());

    state.repo.insert_one(SessionScope::Auto, &subscriber).await?;
    tracing::info!(id, open_id = %subscriber.open_id, "Subscriber registered.");
    Ok(success(subscriber))
}

/// # POST /api/subscribers/batch
/// Registers every subscriber in the body, or none of them.
pub async fn create_subscribers(
    State(state): State<Arc<AppState>>,
    Json(bodies): Json<Vec<NewSubscriber>>,
) -> Result<Json<ApiResponse<Vec<Subscriber>>>, AppError> {
    for body in &bodies {
        body.validate()?;
    }

    let now = Utc::now();
    let mut subscribers = Vec::with_capacity(bodies.len());
    for body in bodies {
        let id = state.sequences.next_value(SUBSCRIBER_ID_SEQUENCE).await?;
        subscribers.push(body.into_subscriber(id, now));
    }

    state.repo.insert_many(SessionScope::Auto, &subscribers).await?;
    Ok(success(subscribers))
}

/// # PUT /api/subscribers/:open_id
/// Replaces the profile fields inside one transaction: the row is locked,
/// modified and written back in full.
pub async fn update_subscriber(
    State(state): State<Arc<AppState>>,
    Path(open_id): Path<String>,
    Json(profile): Json<SubscriberProfile>,
) -> Result<Json<ApiResponse<Subscriber>>, AppError> {
    let mut session = state.repo.sessions().new_managed_session()?;
    let result = update_in_session(&state, &mut session, &open_id, profile).await;
    // Rolls back anything still open when an earlier step failed.
    let closed = session.close().await;

    let subscriber = result?;
    closed?;
    Ok(success(subscriber))
}

async fn update_in_session(
    state: &AppState,
    session: &mut Session,
    open_id: &str,
    profile: SubscriberProfile,
) -> Result<Subscriber, AppError> {
    session.begin().await?;

    let current: Option<Subscriber> = sqlx::query_as(
        "SELECT id, open_id, nickname, city, subscribed_at \
         FROM subscribers WHERE open_id = $1 FOR UPDATE",
    )
    .bind(open_id)
    .fetch_optional(session.connection().await?)
    .await
    .map_err(|e| classify(e, "load subscriber"))?;

    let mut subscriber =
        current.ok_or_else(|| AppError::NotFound(format!("subscriber {open_id} not found")))?;
    subscriber.nickname = profile.nickname;
    subscriber.city = profile.city;

    state
        .repo
        .update_by_unique_condition(SessionScope::Caller(session), &subscriber)
        .await?;
    session.commit().await?;
    Ok(subscriber)
}

/// # DELETE /api/subscribers/:open_id
pub async fn delete_subscriber(
    State(state): State<Arc<AppState>>,
    Path(open_id): Path<String>,
) -> Result<Json<ApiResponse<JsonValue>>, AppError> {
    let deleted = state
        .repo
        .delete_by_unique_condition(SessionScope::Auto, &Subscriber::keyed(open_id))
        .await?;
    Ok(success(json!({ "deleted": deleted })))
}
