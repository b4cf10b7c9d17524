use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, patch, post, put},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use super::auth::{AdminUser, CurrentUser, TokenService, authenticate, hash_password};
use super::db::{DbHandle, HubDb, is_constraint_violation};
use super::models::*;
use super::phone::normalize_phone_number;
use super::webhook::sms_webhook;
use super::ws::{Notice, WsMessage, broadcast_message};
use crate::config::HubConfig;
use crate::errors::HubError;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub ws_tx: broadcast::Sender<Notice>,
    pub tokens: TokenService,
    pub config: HubConfig,
}

impl AppState {
    pub fn new(db: HubDb, config: HubConfig) -> Self {
        let (ws_tx, _) = broadcast::channel(256);
        Self {
            db: DbHandle::new(db),
            ws_tx,
            tokens: TokenService::from_config(&config.auth),
            config,
        }
    }
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Serialize, Deserialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub token_type: String,
    pub user: UserPublic,
}

#[derive(Deserialize)]
pub struct CreateUserRequest {
    pub username: String,
    pub password: String,
    pub email: Option<String>,
    pub role: Option<String>,
}

#[derive(Deserialize)]
pub struct UpdateUserRequest {
    pub is_active: Option<bool>,
}

#[derive(Deserialize)]
pub struct AssignNumberRequest {
    pub number_id: i64,
}

#[derive(Deserialize)]
pub struct CreatePersonRequest {
    pub name: String,
    pub email: Option<String>,
}

#[derive(Deserialize)]
pub struct CreateAssignmentRequest {
    pub person_id: i64,
    pub number_id: i64,
    pub store_account_id: i64,
    pub purpose: Option<String>,
}

#[derive(Deserialize)]
pub struct MarkReadRequest {
    #[serde(default = "default_true")]
    pub is_read: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize)]
pub struct ActiveOnlyQuery {
    #[serde(default = "default_true")]
    pub active_only: bool,
}

#[derive(Deserialize)]
pub struct LimitQuery {
    pub limit: Option<i64>,
}

#[derive(Deserialize, Default)]
pub struct MessagesQuery {
    pub to_number: Option<String>,
    pub from_number: Option<String>,
    pub store_tag: Option<String>,
    pub purpose_tag: Option<String>,
    #[serde(default)]
    pub unread_only: bool,
    pub since: Option<String>,
    pub until: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Serialize, Deserialize)]
pub struct ImportResult {
    pub table: String,
    pub inserted: usize,
    pub total: usize,
}

const DEFAULT_LIMIT: i64 = 200;

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<HubError> for ApiError {
    fn from(err: HubError) -> Self {
        ApiError::from(anyhow::Error::new(err))
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        let hub = err.chain().find_map(|e| e.downcast_ref::<HubError>());
        match hub {
            Some(HubError::InvalidInput(msg)) => return ApiError::BadRequest(msg.clone()),
            Some(e @ HubError::NotFound { .. }) => return ApiError::NotFound(e.to_string()),
            Some(e @ HubError::InvalidCredentials) => return ApiError::Unauthorized(e.to_string()),
            Some(HubError::InvalidToken(_)) => {
                return ApiError::Unauthorized("Invalid token".into());
            }
            Some(HubError::InvalidSignature) => {
                return ApiError::Forbidden("Invalid signature".into());
            }
            _ => {}
        }
        if is_constraint_violation(&err) {
            let cause = err.root_cause().to_string();
            return ApiError::Conflict(format!("Conflicts with an existing record: {}", cause));
        }
        error!(error = %format!("{:#}", err), "request failed");
        ApiError::Internal(err.to_string())
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/sms/webhook", post(sms_webhook))
        .route("/twilio/sms", post(sms_webhook))
        .route("/api/auth/login", post(login))
        .route("/api/auth/me", get(me))
        .route("/api/dashboard/stats", get(dashboard_stats))
        .route("/api/users", get(list_users).post(create_user))
        .route("/api/users/{id}", patch(update_user))
        .route(
            "/api/users/{id}/numbers",
            get(list_user_numbers).post(assign_user_number),
        )
        .route(
            "/api/users/{id}/numbers/{number_id}",
            delete(unassign_user_number),
        )
        .route("/api/numbers", get(list_numbers).post(create_number))
        .route(
            "/api/numbers/{id}",
            get(get_number).patch(update_number).delete(delete_number),
        )
        .route("/api/numbers/{id}/tags", put(set_number_tags))
        .route("/api/numbers/{id}/users", get(list_number_users))
        .route("/api/people", get(list_people).post(create_person))
        .route("/api/people/{id}", delete(delete_person))
        .route(
            "/api/store-accounts",
            get(list_store_accounts).post(create_store_account),
        )
        .route("/api/store-accounts/{id}", delete(delete_store_account))
        .route(
            "/api/assignments",
            get(list_assignments).post(create_assignment),
        )
        .route("/api/assignments/{id}", delete(delete_assignment))
        .route(
            "/api/assignments/{id}/deactivate",
            post(deactivate_assignment),
        )
        .route("/api/messages", get(list_messages))
        .route("/api/messages/number/{number}", get(messages_for_number))
        .route("/api/messages/{id}/read", patch(mark_message_read))
        .route("/api/logs", get(list_logs))
        .route("/api/export", get(export_inventory))
        .route("/api/import/{table}", post(import_table))
}

// ── Helpers ───────────────────────────────────────────────────────────

/// Record an admin action in the event log. The mutation it describes has
/// already been written, so a failed insert is logged rather than returned.
fn audit(
    db: &HubDb,
    actor: &User,
    event_type: &str,
    message: String,
    context: serde_json::Value,
) {
    if let Err(e) = db.log_event(EventLevel::Info, event_type, &message, Some(actor.id), &context)
    {
        warn!(error = %e, event = event_type, "failed to record audit event");
    }
    info!(actor = %actor.username, event = event_type, "{}", message);
}

fn views(state: &SharedState, messages: Vec<SmsMessage>) -> Vec<MessageView> {
    let now = Utc::now();
    let window = state.config.otp_window();
    messages.into_iter().map(|m| m.view(now, window)).collect()
}

// ── Health / auth ─────────────────────────────────────────────────────

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

async fn login(
    State(state): State<SharedState>,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user = state
        .db
        .call(move |db| authenticate(db, &req.username, &req.password))
        .await?;
    let access_token = state.tokens.issue(user.id)?;
    Ok(Json(LoginResponse {
        access_token,
        token_type: "bearer".to_string(),
        user: user.public(),
    }))
}

async fn me(CurrentUser(user): CurrentUser) -> impl IntoResponse {
    Json(user.public())
}

async fn dashboard_stats(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    let today = Utc::now().date_naive().to_string();
    let stats = state
        .db
        .call(move |db| db.dashboard_stats(&user, &today))
        .await?;
    Ok(Json(stats))
}

// ── Users ─────────────────────────────────────────────────────────────

async fn list_users(
    State(state): State<SharedState>,
    AdminUser(_): AdminUser,
    Query(q): Query<ActiveOnlyQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let users = state
        .db
        .call(move |db| db.list_users(q.active_only))
        .await?;
    Ok(Json(users.iter().map(User::public).collect::<Vec<_>>()))
}

async fn create_user(
    State(state): State<SharedState>,
    AdminUser(admin): AdminUser,
    Json(req): Json<CreateUserRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.password.is_empty() {
        return Err(ApiError::BadRequest("Password is required".into()));
    }
    let role = match req.role.as_deref() {
        Some(r) => Role::from_str(r).map_err(ApiError::BadRequest)?,
        None => Role::User,
    };
    let password = req.password;
    let hash = tokio::task::spawn_blocking(move || hash_password(&password))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))??;
    let user = state
        .db
        .call(move |db| {
            let user = db.create_user(&req.username, req.email.as_deref(), role, &hash)?;
            audit(
                db,
                &admin,
                "user_created",
                format!("Created user {} ({})", user.username, user.role.as_str()),
                serde_json::json!({"user_id": user.id}),
            );
            Ok(user)
        })
        .await?;
    Ok((StatusCode::CREATED, Json(user.public())))
}

async fn update_user(
    State(state): State<SharedState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<i64>,
    Json(req): Json<UpdateUserRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.is_active == Some(false) && id == admin.id {
        return Err(ApiError::BadRequest("Cannot deactivate your own account".into()));
    }
    let user = state
        .db
        .call(move |db| {
            let Some(mut user) = db.get_user(id)? else {
                return Ok(None);
            };
            if let Some(is_active) = req.is_active {
                user = db
                    .set_user_active(id, is_active)?
                    .ok_or(HubError::NotFound { kind: "User", id })?;
                audit(
                    db,
                    &admin,
                    "user_updated",
                    format!(
                        "{} user {}",
                        if is_active { "Activated" } else { "Deactivated" },
                        user.username
                    ),
                    serde_json::json!({"user_id": id, "is_active": is_active}),
                );
            }
            Ok(Some(user))
        })
        .await?;
    match user {
        Some(user) => Ok(Json(user.public())),
        None => Err(ApiError::NotFound(format!("User {} not found", id))),
    }
}

async fn list_user_numbers(
    State(state): State<SharedState>,
    AdminUser(_): AdminUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let numbers = state
        .db
        .call(move |db| {
            if db.get_user(id)?.is_none() {
                return Err(HubError::NotFound { kind: "User", id }.into());
            }
            db.list_numbers_for_user(id)
        })
        .await?;
    Ok(Json(numbers))
}

async fn assign_user_number(
    State(state): State<SharedState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<i64>,
    Json(req): Json<AssignNumberRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let number_id = req.number_id;
    let numbers = state
        .db
        .call(move |db| {
            let user = db
                .get_user(id)?
                .ok_or(HubError::NotFound { kind: "User", id })?;
            let number = db.get_number(number_id)?.ok_or(HubError::NotFound {
                kind: "Number",
                id: number_id,
            })?;
            db.assign_number_to_user(id, number_id)?;
            audit(
                db,
                &admin,
                "number_assigned",
                format!("Assigned {} to {}", number.e164, user.username),
                serde_json::json!({"user_id": id, "number_id": number_id}),
            );
            db.list_numbers_for_user(id)
        })
        .await?;
    Ok(Json(numbers))
}

async fn unassign_user_number(
    State(state): State<SharedState>,
    AdminUser(admin): AdminUser,
    Path((id, number_id)): Path<(i64, i64)>,
) -> Result<impl IntoResponse, ApiError> {
    let removed = state
        .db
        .call(move |db| {
            let removed = db.unassign_number_from_user(id, number_id)?;
            if removed {
                audit(
                    db,
                    &admin,
                    "number_unassigned",
                    format!("Removed number {} from user {}", number_id, id),
                    serde_json::json!({"user_id": id, "number_id": number_id}),
                );
            }
            Ok(removed)
        })
        .await?;
    if removed {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!(
            "User {} has no active assignment for number {}",
            id, number_id
        )))
    }
}

// ── Numbers ───────────────────────────────────────────────────────────

async fn list_numbers(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    let numbers = state
        .db
        .call(move |db| {
            if user.is_admin() {
                db.list_numbers()
            } else {
                db.list_numbers_for_user(user.id)
            }
        })
        .await?;
    Ok(Json(numbers))
}

async fn get_number(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let (number, allowed) = state
        .db
        .call(move |db| {
            let number = db.get_number(id)?;
            let allowed = db.can_view_number(&user, Some(id))?;
            Ok((number, allowed))
        })
        .await?;
    match number {
        None => Err(ApiError::NotFound(format!("Number {} not found", id))),
        Some(_) if !allowed => Err(ApiError::Forbidden("Not allowed to view this number".into())),
        Some(number) => Ok(Json(number)),
    }
}

async fn create_number(
    State(state): State<SharedState>,
    AdminUser(admin): AdminUser,
    Json(req): Json<NewNumber>,
) -> Result<impl IntoResponse, ApiError> {
    let number = state
        .db
        .call(move |db| {
            let number = db.create_number(&req)?;
            audit(
                db,
                &admin,
                "number_created",
                format!("Created number {}", number.e164),
                serde_json::json!({"number_id": number.id}),
            );
            Ok(number)
        })
        .await?;
    Ok((StatusCode::CREATED, Json(number)))
}

async fn update_number(
    State(state): State<SharedState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<i64>,
    Json(req): Json<NumberUpdate>,
) -> Result<impl IntoResponse, ApiError> {
    let number = state
        .db
        .call(move |db| {
            let Some(number) = db.update_number(id, &req)? else {
                return Ok(None);
            };
            audit(
                db,
                &admin,
                "number_updated",
                format!("Updated number {}", number.e164),
                serde_json::json!({"number_id": id}),
            );
            Ok(Some(number))
        })
        .await?;
    number
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Number {} not found", id)))
}

async fn delete_number(
    State(state): State<SharedState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    delete_row(&state, admin, "numbers", "Number", id).await
}

async fn set_number_tags(
    State(state): State<SharedState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<i64>,
    Json(tags): Json<NumberTags>,
) -> Result<impl IntoResponse, ApiError> {
    let number = state
        .db
        .call(move |db| {
            let Some(number) = db.set_number_tags(id, &tags)? else {
                return Ok(None);
            };
            audit(
                db,
                &admin,
                "number_tags_updated",
                format!("Updated tags for {}", number.e164),
                serde_json::json!({"number_id": id, "tags": tags}),
            );
            Ok(Some(number))
        })
        .await?;
    number
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Number {} not found", id)))
}

async fn list_number_users(
    State(state): State<SharedState>,
    AdminUser(_): AdminUser,
    Path(id): Path<i64>,
    Query(q): Query<ActiveOnlyQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let users = state
        .db
        .call(move |db| {
            if db.get_number(id)?.is_none() {
                return Err(HubError::NotFound { kind: "Number", id }.into());
            }
            db.list_number_users(id, q.active_only)
        })
        .await?;
    Ok(Json(users))
}

// ── People / store accounts / assignments ─────────────────────────────

async fn list_people(
    State(state): State<SharedState>,
    CurrentUser(_): CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    let people = state.db.call(|db| db.list_people()).await?;
    Ok(Json(people))
}

async fn create_person(
    State(state): State<SharedState>,
    AdminUser(admin): AdminUser,
    Json(req): Json<CreatePersonRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let person = state
        .db
        .call(move |db| {
            let person = db.create_person(&req.name, req.email.as_deref())?;
            audit(
                db,
                &admin,
                "person_created",
                format!("Created person {}", person.name),
                serde_json::json!({"person_id": person.id}),
            );
            Ok(person)
        })
        .await?;
    Ok((StatusCode::CREATED, Json(person)))
}

async fn delete_person(
    State(state): State<SharedState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    delete_row(&state, admin, "people", "Person", id).await
}

async fn list_store_accounts(
    State(state): State<SharedState>,
    CurrentUser(_): CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    let stores = state.db.call(|db| db.list_store_accounts()).await?;
    Ok(Json(stores))
}

async fn create_store_account(
    State(state): State<SharedState>,
    AdminUser(admin): AdminUser,
    Json(req): Json<NewStoreAccount>,
) -> Result<impl IntoResponse, ApiError> {
    let store = state
        .db
        .call(move |db| {
            let store = db.create_store_account(&req)?;
            audit(
                db,
                &admin,
                "store_account_created",
                format!("Created store account {}", store.platform),
                serde_json::json!({"store_account_id": store.id}),
            );
            Ok(store)
        })
        .await?;
    Ok((StatusCode::CREATED, Json(store)))
}

async fn delete_store_account(
    State(state): State<SharedState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    delete_row(&state, admin, "store_accounts", "Store account", id).await
}

async fn list_assignments(
    State(state): State<SharedState>,
    CurrentUser(_): CurrentUser,
    Query(q): Query<ActiveOnlyQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let assignments = state
        .db
        .call(move |db| db.list_assignments(q.active_only))
        .await?;
    Ok(Json(assignments))
}

async fn create_assignment(
    State(state): State<SharedState>,
    AdminUser(admin): AdminUser,
    Json(req): Json<CreateAssignmentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let assignment = state
        .db
        .call(move |db| {
            let person = db.get_person(req.person_id)?.ok_or(HubError::NotFound {
                kind: "Person",
                id: req.person_id,
            })?;
            let number = db.get_number(req.number_id)?.ok_or(HubError::NotFound {
                kind: "Number",
                id: req.number_id,
            })?;
            if db.get_store_account(req.store_account_id)?.is_none() {
                return Err(HubError::NotFound {
                    kind: "Store account",
                    id: req.store_account_id,
                }
                .into());
            }
            let assignment = db.create_assignment(
                req.person_id,
                req.number_id,
                req.store_account_id,
                req.purpose.as_deref(),
            )?;
            audit(
                db,
                &admin,
                "assignment_created",
                format!("Assigned {} to {}", number.e164, person.name),
                serde_json::json!({"assignment_id": assignment.id}),
            );
            Ok(assignment)
        })
        .await?;
    Ok((StatusCode::CREATED, Json(assignment)))
}

async fn deactivate_assignment(
    State(state): State<SharedState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let assignment = state
        .db
        .call(move |db| {
            let Some(assignment) = db.deactivate_assignment(id)? else {
                return Ok(None);
            };
            audit(
                db,
                &admin,
                "assignment_deactivated",
                format!("Deactivated assignment {}", id),
                serde_json::json!({"assignment_id": id}),
            );
            Ok(Some(assignment))
        })
        .await?;
    assignment
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Assignment {} not found", id)))
}

async fn delete_assignment(
    State(state): State<SharedState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    delete_row(&state, admin, "assignments", "Assignment", id).await
}

async fn delete_row(
    state: &SharedState,
    admin: User,
    table: &'static str,
    kind: &'static str,
    id: i64,
) -> Result<StatusCode, ApiError> {
    let deleted = state
        .db
        .call(move |db| {
            let deleted = db.delete_row(table, id)?;
            if deleted {
                audit(
                    db,
                    &admin,
                    "row_deleted",
                    format!("Deleted {} {}", kind.to_lowercase(), id),
                    serde_json::json!({"table": table, "id": id}),
                );
            }
            Ok(deleted)
        })
        .await?;
    if deleted {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("{} {} not found", kind, id)))
    }
}

// ── Messages ──────────────────────────────────────────────────────────

async fn list_messages(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Query(q): Query<MessagesQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let filter = MessageFilter {
        viewer: if user.is_admin() { None } else { Some(user.id) },
        to_number: q.to_number,
        from_number: q.from_number,
        store_tag: q.store_tag,
        purpose_tag: q.purpose_tag,
        unread_only: q.unread_only,
        since: q.since,
        until: q.until,
        limit: q.limit.unwrap_or(DEFAULT_LIMIT),
    };
    let messages = state.db.call(move |db| db.query_messages(&filter)).await?;
    Ok(Json(views(&state, messages)))
}

async fn messages_for_number(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Path(number): Path<String>,
    Query(q): Query<LimitQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let normalized = normalize_phone_number(&number);
    if normalized.is_empty() {
        return Err(ApiError::BadRequest(format!("Invalid phone number: {}", number)));
    }
    let limit = q.limit.unwrap_or(DEFAULT_LIMIT);
    let messages = state
        .db
        .call(move |db| {
            let number_id = db.find_number(&normalized)?.map(|n| n.id);
            if !db.can_view_number(&user, number_id)? {
                return Ok(None);
            }
            db.list_messages_for_number(&normalized, limit).map(Some)
        })
        .await?;
    match messages {
        Some(messages) => Ok(Json(views(&state, messages))),
        None => Err(ApiError::Forbidden("Not allowed to view this number".into())),
    }
}

async fn mark_message_read(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
    Json(req): Json<MarkReadRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let is_read = req.is_read;
    let result = state
        .db
        .call(move |db| {
            let Some(message) = db.get_message(id)? else {
                return Err(HubError::NotFound { kind: "Message", id }.into());
            };
            // Messages stored before their number was added resolve by `To`.
            let number_id = match message.number_id {
                Some(n) => Some(n),
                None => db.find_number(&message.to_number)?.map(|n| n.id),
            };
            if !db.can_view_number(&user, number_id)? {
                return Ok(None);
            }
            db.set_message_read(id, is_read)?;
            let audience = match number_id {
                Some(n) => db.active_user_ids_for_number(n)?,
                None => Vec::new(),
            };
            let updated = db
                .get_message(id)?
                .ok_or(HubError::NotFound { kind: "Message", id })?;
            Ok(Some((updated, audience)))
        })
        .await?;

    let Some((message, audience)) = result else {
        return Err(ApiError::Forbidden("Not allowed to view this message".into()));
    };
    broadcast_message(
        &state.ws_tx,
        &WsMessage::MessageRead {
            message_id: message.id,
            number_id: message.number_id,
            is_read,
        },
        audience,
    );
    let view = message.view(Utc::now(), state.config.otp_window());
    Ok(Json(view))
}

// ── Logs / export / import ────────────────────────────────────────────

async fn list_logs(
    State(state): State<SharedState>,
    AdminUser(_): AdminUser,
    Query(q): Query<LimitQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = q.limit.unwrap_or(DEFAULT_LIMIT);
    let events = state.db.call(move |db| db.list_events(limit)).await?;
    Ok(Json(events))
}

async fn export_inventory(
    State(state): State<SharedState>,
    AdminUser(_): AdminUser,
) -> Result<impl IntoResponse, ApiError> {
    let export = state.db.call(|db| db.export_inventory()).await?;
    Ok(Json(export))
}

async fn import_table(
    State(state): State<SharedState>,
    AdminUser(admin): AdminUser,
    Path(table): Path<String>,
    Json(rows): Json<Vec<serde_json::Value>>,
) -> Result<impl IntoResponse, ApiError> {
    let total = rows.len();
    let result = state
        .db
        .call(move |db| {
            let inserted = db.import_rows(&table, &rows)?;
            audit(
                db,
                &admin,
                "import",
                format!("Imported {} of {} rows into {}", inserted, total, table),
                serde_json::json!({"table": table, "inserted": inserted, "total": total}),
            );
            Ok(ImportResult {
                table,
                inserted,
                total,
            })
        })
        .await?;
    Ok(Json(result))
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    struct TestApp {
        app: Router,
        state: SharedState,
        admin_token: String,
        user_token: String,
        user: User,
    }

    fn test_app() -> TestApp {
        test_app_with(HubConfig::default())
    }

    fn test_app_with(mut config: HubConfig) -> TestApp {
        config.auth.jwt_secret = "test-secret".into();
        let db = HubDb::new_in_memory().unwrap();
        let admin = db.create_user("root", None, Role::Admin, "x").unwrap();
        let user = db.create_user("bob", None, Role::User, "x").unwrap();
        let state = Arc::new(AppState::new(db, config));
        let admin_token = state.tokens.issue(admin.id).unwrap();
        let user_token = state.tokens.issue(user.id).unwrap();
        TestApp {
            app: api_router().with_state(state.clone()),
            state,
            admin_token,
            user_token,
            user,
        }
    }

    async fn send(
        app: &Router,
        method: &str,
        uri: &str,
        token: Option<&str>,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {}", token));
        }
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    fn seed_number(t: &TestApp, e164: &str, assign_to_user: bool) -> i64 {
        let db = t.state.db.lock_sync().unwrap();
        let number = db
            .create_number(&NewNumber {
                e164: e164.into(),
                ..Default::default()
            })
            .unwrap();
        if assign_to_user {
            db.assign_number_to_user(t.user.id, number.id).unwrap();
        }
        number.id
    }

    fn seed_message(t: &TestApp, to: &str, sid: &str, body: &str, minutes_ago: i64) -> i64 {
        let db = t.state.db.lock_sync().unwrap();
        db.insert_inbound(&InboundSms {
            provider: "twilio".into(),
            provider_message_sid: Some(sid.into()),
            to_number: to.into(),
            from_number: Some("+15559990000".into()),
            body: Some(body.into()),
            received_at: Utc::now() - chrono::Duration::minutes(minutes_ago),
            raw_payload: serde_json::json!({}),
        })
        .unwrap()
        .id
    }

    #[tokio::test]
    async fn test_health_check() {
        let t = test_app();
        let (status, body) = send(&t.app, "GET", "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_missing_and_invalid_token() {
        let t = test_app();
        let (status, body) = send(&t.app, "GET", "/api/auth/me", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "Not authenticated");

        let (status, body) = send(&t.app, "GET", "/api/auth/me", Some("nope"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "Invalid token");
    }

    #[tokio::test]
    async fn test_inactive_user_token_rejected() {
        let t = test_app();
        t.state
            .db
            .lock_sync()
            .unwrap()
            .set_user_active(t.user.id, false)
            .unwrap();
        let (status, body) = send(&t.app, "GET", "/api/auth/me", Some(&t.user_token), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "User inactive");
    }

    #[tokio::test]
    async fn test_login_and_me() {
        let t = test_app();
        {
            let db = t.state.db.lock_sync().unwrap();
            let hash = hash_password("pw").unwrap();
            db.create_user("carol", None, Role::User, &hash).unwrap();
        }
        let (status, body) = send(
            &t.app,
            "POST",
            "/api/auth/login",
            None,
            Some(serde_json::json!({"username": "Carol", "password": "pw"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["token_type"], "bearer");
        assert_eq!(body["user"]["username"], "carol");
        let token = body["access_token"].as_str().unwrap().to_string();

        let (status, me) = send(&t.app, "GET", "/api/auth/me", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(me["username"], "carol");
        assert!(me.get("password_hash").is_none());

        let (status, body) = send(
            &t.app,
            "POST",
            "/api/auth/login",
            None,
            Some(serde_json::json!({"username": "carol", "password": "bad"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "Incorrect username or password");
    }

    #[tokio::test]
    async fn test_admin_routes_forbidden_for_users() {
        let t = test_app();
        for (method, uri) in [
            ("GET", "/api/users"),
            ("GET", "/api/logs"),
            ("GET", "/api/export"),
        ] {
            let (status, body) = send(&t.app, method, uri, Some(&t.user_token), None).await;
            assert_eq!(status, StatusCode::FORBIDDEN, "{}", uri);
            assert_eq!(body["error"], "Admin access required");
        }
        let (status, _) = send(
            &t.app,
            "POST",
            "/api/people",
            Some(&t.user_token),
            Some(serde_json::json!({"name": "Eve"})),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_create_number_and_conflict() {
        let t = test_app();
        let (status, body) = send(
            &t.app,
            "POST",
            "/api/numbers",
            Some(&t.admin_token),
            Some(serde_json::json!({"e164": "+1 (555) 000-0001", "provider": "twilio"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["e164"], "+15550000001");
        assert_eq!(body["status"], "active");

        let (status, _) = send(
            &t.app,
            "POST",
            "/api/numbers",
            Some(&t.admin_token),
            Some(serde_json::json!({"e164": "+15550000001"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = send(
            &t.app,
            "POST",
            "/api/numbers",
            Some(&t.admin_token),
            Some(serde_json::json!({"e164": "none"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("no digits"));
    }

    #[tokio::test]
    async fn test_user_sees_only_assigned_numbers() {
        let t = test_app();
        let mine = seed_number(&t, "+15550000001", true);
        let other = seed_number(&t, "+15550000002", false);

        let (status, body) = send(&t.app, "GET", "/api/numbers", Some(&t.user_token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);

        let (status, _) = send(
            &t.app,
            "GET",
            &format!("/api/numbers/{}", mine),
            Some(&t.user_token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = send(
            &t.app,
            "GET",
            &format!("/api/numbers/{}", other),
            Some(&t.user_token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = send(&t.app, "GET", "/api/numbers/999", Some(&t.admin_token), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, all) = send(&t.app, "GET", "/api/numbers", Some(&t.admin_token), None).await;
        assert_eq!(all.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_user_number_assignment_endpoints() {
        let t = test_app();
        let number_id = seed_number(&t, "+15550000001", false);
        let uri = format!("/api/users/{}/numbers", t.user.id);

        let (status, body) = send(
            &t.app,
            "POST",
            &uri,
            Some(&t.admin_token),
            Some(serde_json::json!({"number_id": number_id})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);

        let (status, users) = send(
            &t.app,
            "GET",
            &format!("/api/numbers/{}/users", number_id),
            Some(&t.admin_token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(users[0]["username"], "bob");

        let (status, _) = send(
            &t.app,
            "DELETE",
            &format!("{}/{}", uri, number_id),
            Some(&t.admin_token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(
            &t.app,
            "DELETE",
            &format!("{}/{}", uri, number_id),
            Some(&t.admin_token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(
            &t.app,
            "POST",
            &uri,
            Some(&t.admin_token),
            Some(serde_json::json!({"number_id": 999})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_create_user_and_deactivate() {
        let t = test_app();
        let (status, body) = send(
            &t.app,
            "POST",
            "/api/users",
            Some(&t.admin_token),
            Some(serde_json::json!({"username": "Dave", "password": "pw", "role": "ADMIN"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["username"], "dave");
        assert_eq!(body["role"], "admin");

        let (status, _) = send(
            &t.app,
            "POST",
            "/api/users",
            Some(&t.admin_token),
            Some(serde_json::json!({"username": "x", "password": "pw", "role": "owner"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(
            &t.app,
            "PATCH",
            &format!("/api/users/{}", t.user.id),
            Some(&t.admin_token),
            Some(serde_json::json!({"is_active": false})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["is_active"], false);

        let (_, active) = send(&t.app, "GET", "/api/users", Some(&t.admin_token), None).await;
        let names: Vec<&str> = active
            .as_array()
            .unwrap()
            .iter()
            .map(|u| u["username"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["dave", "root"]);
    }

    #[tokio::test]
    async fn test_inventory_and_assignments_flow() {
        let t = test_app();
        let admin = Some(t.admin_token.as_str());
        let (_, person) = send(
            &t.app,
            "POST",
            "/api/people",
            admin,
            Some(serde_json::json!({"name": "Alice"})),
        )
        .await;
        let (_, store) = send(
            &t.app,
            "POST",
            "/api/store-accounts",
            admin,
            Some(serde_json::json!({"platform": "Amazon", "store_name": "Main"})),
        )
        .await;
        let number_id = seed_number(&t, "+15550000001", false);

        let (status, assignment) = send(
            &t.app,
            "POST",
            "/api/assignments",
            admin,
            Some(serde_json::json!({
                "person_id": person["id"],
                "number_id": number_id,
                "store_account_id": store["id"],
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(assignment["purpose"], "2fa");

        // Any authenticated user may read the inventory.
        let (status, list) =
            send(&t.app, "GET", "/api/assignments", Some(&t.user_token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list[0]["person_name"], "Alice");

        let (status, body) = send(
            &t.app,
            "POST",
            &format!("/api/assignments/{}/deactivate", assignment["id"]),
            admin,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["is_active"], false);
        let (_, list) = send(&t.app, "GET", "/api/assignments", admin, None).await;
        assert!(list.as_array().unwrap().is_empty());
        let (_, list) = send(&t.app, "GET", "/api/assignments?active_only=false", admin, None).await;
        assert_eq!(list.as_array().unwrap().len(), 1);

        // The person is still referenced.
        let (status, _) = send(
            &t.app,
            "DELETE",
            &format!("/api/people/{}", person["id"]),
            admin,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = send(
            &t.app,
            "POST",
            "/api/assignments",
            admin,
            Some(serde_json::json!({
                "person_id": 999,
                "number_id": number_id,
                "store_account_id": store["id"],
            })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_messages_scoped_and_otp_redacted() {
        let t = test_app();
        seed_number(&t, "+15550000001", true);
        seed_number(&t, "+15550000002", false);
        seed_message(&t, "+15550000001", "A", "code 1111", 2);
        seed_message(&t, "+15550000001", "B", "code 2222", 30);
        seed_message(&t, "+15550000002", "C", "code 3333", 1);

        let (status, body) = send(&t.app, "GET", "/api/messages", Some(&t.user_token), None).await;
        assert_eq!(status, StatusCode::OK);
        let msgs = body.as_array().unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0]["otp_code"], "1111");
        assert_eq!(msgs[0]["otp_expired"], false);
        assert!(msgs[1]["otp_code"].is_null());
        assert_eq!(msgs[1]["otp_expired"], true);
        assert_eq!(msgs[1]["body"], "code 2222");

        let (_, body) = send(&t.app, "GET", "/api/messages?limit=0", Some(&t.admin_token), None).await;
        assert_eq!(body.as_array().unwrap().len(), 1);
        let (_, body) = send(&t.app, "GET", "/api/messages", Some(&t.admin_token), None).await;
        assert_eq!(body.as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_messages_for_number_access() {
        let t = test_app();
        seed_number(&t, "+15550000001", true);
        seed_number(&t, "+15550000002", false);
        seed_message(&t, "15550000001", "A", "hi 1234", 0);

        let (status, body) = send(
            &t.app,
            "GET",
            "/api/messages/number/+15550000001",
            Some(&t.user_token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);

        let (status, _) = send(
            &t.app,
            "GET",
            "/api/messages/number/15550000002",
            Some(&t.user_token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        // Unknown numbers are visible to admins only.
        let (status, _) = send(
            &t.app,
            "GET",
            "/api/messages/number/15559999999",
            Some(&t.admin_token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = send(
            &t.app,
            "GET",
            "/api/messages/number/abc",
            Some(&t.admin_token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_mark_read_checks_access_and_broadcasts() {
        let t = test_app();
        seed_number(&t, "+15550000001", true);
        seed_number(&t, "+15550000002", false);
        let mine = seed_message(&t, "+15550000001", "A", "x", 0);
        let other = seed_message(&t, "+15550000002", "B", "y", 0);
        let mut rx = t.state.ws_tx.subscribe();

        let (status, body) = send(
            &t.app,
            "PATCH",
            &format!("/api/messages/{}/read", mine),
            Some(&t.user_token),
            Some(serde_json::json!({"is_read": true})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["is_read"], true);

        let notice = rx.recv().await.unwrap();
        assert_eq!(notice.user_ids, vec![t.user.id]);
        let parsed: serde_json::Value = serde_json::from_str(&notice.json).unwrap();
        assert_eq!(parsed["type"], "MessageRead");

        let (status, _) = send(
            &t.app,
            "PATCH",
            &format!("/api/messages/{}/read", other),
            Some(&t.user_token),
            Some(serde_json::json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = send(
            &t.app,
            "PATCH",
            "/api/messages/999/read",
            Some(&t.admin_token),
            Some(serde_json::json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_dashboard_stats_for_user() {
        let t = test_app();
        seed_number(&t, "+15550000001", true);
        seed_number(&t, "+15550000002", false);
        seed_message(&t, "+15550000001", "A", "code 1234", 0);
        seed_message(&t, "+15550000002", "B", "code 5678", 0);

        let (status, body) =
            send(&t.app, "GET", "/api/dashboard/stats", Some(&t.user_token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["active_phone_numbers"], 1);
        assert_eq!(body["otp_today"], 1);
        assert_eq!(body["active_users"], 0);

        let (_, body) =
            send(&t.app, "GET", "/api/dashboard/stats", Some(&t.admin_token), None).await;
        assert_eq!(body["sms_today"], 2);
        assert_eq!(body["active_users"], 2);
    }

    #[tokio::test]
    async fn test_export_import_and_logs() {
        let t = test_app();
        let admin = Some(t.admin_token.as_str());
        send(
            &t.app,
            "POST",
            "/api/people",
            admin,
            Some(serde_json::json!({"name": "Alice"})),
        )
        .await;
        let (status, export) = send(&t.app, "GET", "/api/export", admin, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(export["people"][0]["name"], "Alice");

        let (status, body) = send(
            &t.app,
            "POST",
            "/api/import/people",
            admin,
            Some(serde_json::json!([{"name": "Alice"}, {"name": "Bea"}])),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["inserted"], 1);
        assert_eq!(body["total"], 2);

        let (status, _) = send(
            &t.app,
            "POST",
            "/api/import/users",
            admin,
            Some(serde_json::json!([])),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, logs) = send(&t.app, "GET", "/api/logs?limit=5", admin, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(logs[0]["event_type"], "import");
        assert!(logs[0]["user_id"].as_i64().is_some());
    }

    #[tokio::test]
    async fn test_import_rejects_unreadable_numbers() {
        let t = test_app();
        let admin = Some(t.admin_token.as_str());
        let (status, _) = send(
            &t.app,
            "POST",
            "/api/import/numbers",
            admin,
            Some(serde_json::json!([{"e164": "+15550000002", "status": "bogus"}])),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = send(
            &t.app,
            "POST",
            "/api/import/numbers",
            admin,
            Some(serde_json::json!([{"e164": "n/a"}])),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(&t.app, "GET", "/api/numbers", admin, None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_message_time_bounds_use_instants() {
        let t = test_app();
        seed_number(&t, "+15550000001", true);
        seed_message(&t, "+15550000001", "A", "code 1111", 0);
        let admin = Some(t.admin_token.as_str());

        let later = (Utc::now() + chrono::Duration::hours(2))
            .with_timezone(&chrono::FixedOffset::west_opt(5 * 3600).unwrap())
            .to_rfc3339();
        let uri = format!("/api/messages?since={}", later.replace('+', "%2B"));
        let (status, body) = send(&t.app, "GET", &uri, admin, None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.as_array().unwrap().is_empty());

        let (status, _) = send(&t.app, "GET", "/api/messages?until=soon", admin, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_mutation_succeeds_when_audit_insert_fails() {
        let t = test_app();
        t.state
            .db
            .lock_sync()
            .unwrap()
            .execute_raw(
                "CREATE TRIGGER no_events BEFORE INSERT ON app_events \
                 BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END;",
            )
            .unwrap();

        let (status, body) = send(
            &t.app,
            "POST",
            "/api/people",
            Some(&t.admin_token),
            Some(serde_json::json!({"name": "Alice"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["name"], "Alice");
        let people = t.state.db.lock_sync().unwrap().list_people().unwrap();
        assert_eq!(people.len(), 1);
    }
}
