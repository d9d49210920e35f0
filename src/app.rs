use std::{
    collections::HashMap,
    env,
    sync::Arc,
    time::{Duration, Instant},
};

use axum::{
    extract::{Multipart, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, patch, post, put},
    Json, Router,
};
use bcrypt::{hash, verify, DEFAULT_COST};
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::dispatch::{
    parse_broadcast_numbers, send_cost, template_log_text, Dispatcher, OutboundMessage,
    DEFAULT_API_BASE,
};
use crate::types::*;

const QUEUE_CACHE_TTL: Duration = Duration::from_secs(5);
const BROADCAST_PACING_MS: u64 = 500;
const DEFAULT_TEMPLATE_LANGUAGE: &str = "pt_BR";

fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

fn normalize_email(value: &str) -> String {
    value.trim().to_ascii_lowercase()
}

/// Read-through cache with a short staleness window. Queue and agent-list
/// reads go through one of these; every mutating call on the same entity
/// invalidates it. Readers within the TTL may see pre-mutation state, which
/// the queue contract allows.
pub struct TimedCache<T> {
    ttl: Duration,
    slot: Mutex<Option<(Instant, T)>>,
}

impl<T: Clone> TimedCache<T> {
    pub fn new(ttl: Duration) -> TimedCache<T> {
        TimedCache {
            ttl,
            slot: Mutex::new(None),
        }
    }

    pub async fn get(&self) -> Option<T> {
        let slot = self.slot.lock().await;
        match slot.as_ref() {
            Some((filled_at, value)) if filled_at.elapsed() < self.ttl => Some(value.clone()),
            _ => None,
        }
    }

    pub async fn set(&self, value: T) {
        let mut slot = self.slot.lock().await;
        *slot = Some((Instant::now(), value));
    }

    pub async fn invalidate(&self) {
        let mut slot = self.slot.lock().await;
        *slot = None;
    }
}

pub struct AppState {
    pub db: PgPool,
    pub dispatcher: Dispatcher,
    pub queue_cache: TimedCache<Vec<Contact>>,
    pub agents_cache: TimedCache<Vec<UserProfile>>,
}

type ApiError = (StatusCode, Json<Value>);

fn db_error(err: sqlx::Error) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": format!("database error: {err}") })),
    )
}

fn not_found(what: &str) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": format!("{what} not found") })),
    )
}

fn bad_request(message: &str) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message })))
}

fn parse_user_row(row: sqlx::postgres::PgRow) -> UserProfile {
    UserProfile {
        id: row.get("id"),
        name: row.get("name"),
        email: row.get("email"),
        role: row.get("role"),
        active: row.get("active"),
        send_blocked: row.get("send_blocked"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn parse_contact_row(row: sqlx::postgres::PgRow) -> Contact {
    Contact {
        id: row.get("id"),
        name: row.get("name"),
        phone: row.get("phone"),
        customer_code: row.get("customer_code"),
        tax_id: row.get("tax_id"),
        notes: row.get("notes"),
        status: ContactStatus::parse(&row.get::<String, _>("status")),
        owner_agent_id: row.get("owner_agent_id"),
        last_interaction_at: row.get("last_interaction_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn parse_message_row(row: sqlx::postgres::PgRow) -> ChatMessage {
    ChatMessage {
        id: row.get("id"),
        contact_id: row.get("contact_id"),
        sender: Sender::parse(&row.get::<String, _>("sender")),
        body: row.get("body"),
        kind: SendKind::parse(&row.get::<String, _>("kind")),
        media_id: row.get("media_id"),
        cost: row.get("cost"),
        sent_at: row.get("sent_at"),
    }
}

fn parse_quick_reply_row(row: sqlx::postgres::PgRow) -> QuickReply {
    QuickReply {
        id: row.get("id"),
        title: row.get("title"),
        body: row.get("body"),
        created_by: row.get("created_by"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn parse_template_row(row: sqlx::postgres::PgRow) -> MessageTemplate {
    MessageTemplate {
        id: row.get("id"),
        name: row.get("name"),
        language_code: row.get("language_code"),
        cost: row.get("cost"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

const USER_COLUMNS: &str =
    "id, name, email, role, active, send_blocked, created_at, updated_at";
const CONTACT_COLUMNS: &str = "id, name, phone, customer_code, tax_id, notes, status, \
     owner_agent_id, last_interaction_at, created_at, updated_at";
const MESSAGE_COLUMNS: &str = "id, contact_id, sender, body, kind, media_id, cost, sent_at";

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let header = headers.get("authorization")?.to_str().ok()?;
    let token = header.strip_prefix("Bearer ")?;
    Some(token.trim().to_string())
}

async fn auth_user_from_headers(
    state: &Arc<AppState>,
    headers: &HeaderMap,
) -> Result<UserProfile, ApiError> {
    let token = bearer_token(headers).ok_or((
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "missing bearer token" })),
    ))?;
    let row = sqlx::query(
        "SELECT u.id, u.name, u.email, u.role, u.active, u.send_blocked, u.created_at, u.updated_at \
         FROM auth_tokens t JOIN users u ON u.id = t.user_id WHERE t.token = $1",
    )
    .bind(&token)
    .fetch_optional(&state.db)
    .await
    .ok()
    .flatten()
    .ok_or((
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "invalid token" })),
    ))?;
    let profile = parse_user_row(row);
    if !profile.active {
        return Err((
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "account disabled" })),
        ));
    }
    Ok(profile)
}

fn require_admin(profile: &UserProfile) -> Result<(), ApiError> {
    if profile.is_admin() {
        Ok(())
    } else {
        Err((
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "admin access required" })),
        ))
    }
}

fn require_sender(profile: &UserProfile) -> Result<(), ApiError> {
    if profile.send_blocked {
        Err((
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "sending disabled for this account" })),
        ))
    } else {
        Ok(())
    }
}

async fn find_contact(state: &Arc<AppState>, contact_id: &str) -> Result<Contact, ApiError> {
    let row = sqlx::query(&format!(
        "SELECT {CONTACT_COLUMNS} FROM contacts WHERE id = $1"
    ))
    .bind(contact_id)
    .fetch_optional(&state.db)
    .await
    .map_err(db_error)?;
    row.map(parse_contact_row).ok_or_else(|| not_found("contact"))
}

async fn find_template_by_name(
    state: &Arc<AppState>,
    name: &str,
) -> Result<Option<MessageTemplate>, ApiError> {
    let row = sqlx::query(
        "SELECT id, name, language_code, cost, created_at, updated_at FROM templates WHERE name = $1",
    )
    .bind(name)
    .fetch_optional(&state.db)
    .await
    .map_err(db_error)?;
    Ok(row.map(parse_template_row))
}

// ---------------------------------------------------------------------------
// Queue/assignment engine

async fn load_queue(state: &Arc<AppState>) -> Result<Vec<Contact>, ApiError> {
    if let Some(cached) = state.queue_cache.get().await {
        return Ok(cached);
    }
    let rows = sqlx::query(&format!(
        "SELECT {CONTACT_COLUMNS} FROM contacts WHERE status <> 'closed' \
         ORDER BY last_interaction_at DESC"
    ))
    .fetch_all(&state.db)
    .await
    .map_err(db_error)?;
    let contacts = rows.into_iter().map(parse_contact_row).collect::<Vec<_>>();
    state.queue_cache.set(contacts.clone()).await;
    Ok(contacts)
}

/// Visibility filter applied on top of the cached queue: admins see every
/// open conversation, agents see their own plus unowned ones. Closed rows
/// never pass, even from a stale cache entry.
fn queue_view(contacts: &[Contact], is_admin: bool, agent_id: &str) -> Vec<Contact> {
    contacts
        .iter()
        .filter(|contact| contact.status != ContactStatus::Closed)
        .filter(|contact| {
            is_admin
                || match contact.owner_agent_id.as_deref() {
                    Some(owner) => owner == agent_id,
                    None => true,
                }
        })
        .cloned()
        .collect()
}

async fn get_queue(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    let profile = match auth_user_from_headers(&state, &headers).await {
        Ok(p) => p,
        Err(err) => return err.into_response(),
    };
    let contacts = match load_queue(&state).await {
        Ok(c) => c,
        Err(err) => return err.into_response(),
    };
    let visible = queue_view(&contacts, profile.is_admin(), &profile.id);
    (StatusCode::OK, Json(json!({ "contacts": visible }))).into_response()
}

async fn get_contact(
    Path(contact_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(err) = auth_user_from_headers(&state, &headers).await {
        return err.into_response();
    }
    match find_contact(&state, &contact_id).await {
        Ok(contact) => (StatusCode::OK, Json(json!({ "contact": contact }))).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn patch_contact(
    Path(contact_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<PatchContactBody>,
) -> impl IntoResponse {
    if let Err(err) = auth_user_from_headers(&state, &headers).await {
        return err.into_response();
    }
    let mut contact = match find_contact(&state, &contact_id).await {
        Ok(c) => c,
        Err(err) => return err.into_response(),
    };
    if let Some(v) = body.name {
        contact.name = v;
    }
    if let Some(v) = body.customer_code {
        contact.customer_code = v;
    }
    if let Some(v) = body.tax_id {
        contact.tax_id = v;
    }
    if let Some(v) = body.notes {
        contact.notes = v;
    }
    contact.updated_at = now_iso();
    if let Err(err) = sqlx::query(
        "UPDATE contacts SET name = $1, customer_code = $2, tax_id = $3, notes = $4, \
         updated_at = $5 WHERE id = $6",
    )
    .bind(&contact.name)
    .bind(&contact.customer_code)
    .bind(&contact.tax_id)
    .bind(&contact.notes)
    .bind(&contact.updated_at)
    .bind(&contact.id)
    .execute(&state.db)
    .await
    .map_err(db_error)
    {
        return err.into_response();
    }
    state.queue_cache.invalidate().await;
    (StatusCode::OK, Json(json!({ "contact": contact }))).into_response()
}

async fn transfer_contact(
    Path(contact_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<TransferBody>,
) -> impl IntoResponse {
    if let Err(err) = auth_user_from_headers(&state, &headers).await {
        return err.into_response();
    }
    let mut contact = match find_contact(&state, &contact_id).await {
        Ok(c) => c,
        Err(err) => return err.into_response(),
    };
    let agent_exists =
        sqlx::query_scalar::<_, i64>("SELECT COUNT(1) FROM users WHERE id = $1")
            .bind(&body.agent_id)
            .fetch_one(&state.db)
            .await
            .unwrap_or(0)
            > 0;
    if !agent_exists {
        return not_found("agent").into_response();
    }
    // Last writer wins: no check against the previous owner.
    contact.owner_agent_id = Some(body.agent_id.clone());
    contact.status = ContactStatus::InProgress;
    contact.updated_at = now_iso();
    if let Err(err) = sqlx::query(
        "UPDATE contacts SET owner_agent_id = $1, status = 'in_progress', updated_at = $2 \
         WHERE id = $3",
    )
    .bind(&body.agent_id)
    .bind(&contact.updated_at)
    .bind(&contact.id)
    .execute(&state.db)
    .await
    .map_err(db_error)
    {
        return err.into_response();
    }
    state.queue_cache.invalidate().await;
    (StatusCode::OK, Json(json!({ "contact": contact }))).into_response()
}

async fn close_contact(
    Path(contact_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(err) = auth_user_from_headers(&state, &headers).await {
        return err.into_response();
    }
    let mut contact = match find_contact(&state, &contact_id).await {
        Ok(c) => c,
        Err(err) => return err.into_response(),
    };
    // Owner stays on the contact so cost reporting keeps its attribution.
    contact.status = ContactStatus::Closed;
    contact.updated_at = now_iso();
    if let Err(err) =
        sqlx::query("UPDATE contacts SET status = 'closed', updated_at = $1 WHERE id = $2")
            .bind(&contact.updated_at)
            .bind(&contact.id)
            .execute(&state.db)
            .await
            .map_err(db_error)
    {
        return err.into_response();
    }
    state.queue_cache.invalidate().await;
    (StatusCode::OK, Json(json!({ "contact": contact }))).into_response()
}

// ---------------------------------------------------------------------------
// Message log

async fn get_messages(
    Path(contact_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(err) = auth_user_from_headers(&state, &headers).await {
        return err.into_response();
    }
    if let Err(err) = find_contact(&state, &contact_id).await {
        return err.into_response();
    }
    let rows = sqlx::query(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE contact_id = $1 ORDER BY sent_at ASC"
    ))
    .bind(&contact_id)
    .fetch_all(&state.db)
    .await
    .unwrap_or_default();
    let messages = rows.into_iter().map(parse_message_row).collect::<Vec<_>>();
    (StatusCode::OK, Json(json!({ "messages": messages }))).into_response()
}

async fn append_message(
    state: &Arc<AppState>,
    contact_id: &str,
    sender: Sender,
    body: Option<String>,
    kind: SendKind,
    media_id: Option<String>,
    cost: f64,
    claim_agent: Option<&str>,
) -> Result<ChatMessage, ApiError> {
    let message = ChatMessage {
        id: Uuid::new_v4().to_string(),
        contact_id: contact_id.to_string(),
        sender,
        body,
        kind,
        media_id,
        cost,
        sent_at: now_iso(),
    };
    sqlx::query(
        "INSERT INTO messages (id, contact_id, sender, body, kind, media_id, cost, sent_at) \
         VALUES ($1,$2,$3,$4,$5,$6,$7,$8)",
    )
    .bind(&message.id)
    .bind(&message.contact_id)
    .bind(message.sender.as_str())
    .bind(&message.body)
    .bind(message.kind.as_str())
    .bind(&message.media_id)
    .bind(message.cost)
    .bind(&message.sent_at)
    .execute(&state.db)
    .await
    .map_err(db_error)?;
    // First outbound send claims an unowned contact for the sending agent.
    let _ = sqlx::query(
        "UPDATE contacts SET last_interaction_at = $1, updated_at = $1, \
         owner_agent_id = COALESCE(owner_agent_id, $2) WHERE id = $3",
    )
    .bind(&message.sent_at)
    .bind(claim_agent)
    .bind(contact_id)
    .execute(&state.db)
    .await;
    state.queue_cache.invalidate().await;
    Ok(message)
}

async fn post_message(
    Path(contact_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<SendMessageBody>,
) -> impl IntoResponse {
    let profile = match auth_user_from_headers(&state, &headers).await {
        Ok(p) => p,
        Err(err) => return err.into_response(),
    };
    if let Err(err) = require_sender(&profile) {
        return err.into_response();
    }
    let contact = match find_contact(&state, &contact_id).await {
        Ok(c) => c,
        Err(err) => return err.into_response(),
    };

    let kind = body.kind.unwrap_or(SendKind::Text);
    let text = body.text.unwrap_or_default().trim().to_string();
    let parameters = body.parameters.unwrap_or_default();
    let mut template = None;
    let outbound = match kind {
        SendKind::Text => {
            if text.is_empty() {
                return bad_request("text is required").into_response();
            }
            OutboundMessage::text(&text)
        }
        SendKind::Image | SendKind::Audio | SendKind::Document => {
            let Some(media_id) = body.media_id.as_deref().filter(|v| !v.is_empty()) else {
                return bad_request("mediaId is required for media messages").into_response();
            };
            OutboundMessage::media(kind, media_id, &text)
        }
        SendKind::Template => {
            let Some(name) = body
                .template_name
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
            else {
                return bad_request("templateName is required").into_response();
            };
            template = match find_template_by_name(&state, name).await {
                Ok(t) => t,
                Err(err) => return err.into_response(),
            };
            match &template {
                Some(t) => OutboundMessage::template(t, parameters.clone()),
                None => OutboundMessage {
                    kind: SendKind::Template,
                    text: String::new(),
                    media_id: None,
                    template_name: name.to_string(),
                    language_code: DEFAULT_TEMPLATE_LANGUAGE.to_string(),
                    parameters: parameters.clone(),
                },
            }
        }
    };

    let outcome = state.dispatcher.send(&contact.phone, &outbound).await;
    if !outcome.is_sent() {
        return (
            StatusCode::BAD_GATEWAY,
            Json(json!({
                "error": "provider rejected the message",
                "statusCode": outcome.status_code,
                "body": outcome.body
            })),
        )
            .into_response();
    }

    let log_body = match kind {
        SendKind::Template => Some(template_log_text(&outbound.template_name, &parameters)),
        _ if text.is_empty() => None,
        _ => Some(text),
    };
    let cost = send_cost(kind, template.as_ref());
    let message = match append_message(
        &state,
        &contact.id,
        Sender::Company,
        log_body,
        kind,
        body.media_id,
        cost,
        Some(&profile.id),
    )
    .await
    {
        Ok(m) => m,
        Err(err) => return err.into_response(),
    };
    (StatusCode::CREATED, Json(json!({ "message": message }))).into_response()
}

// ---------------------------------------------------------------------------
// Media pass-through

async fn upload_media(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> impl IntoResponse {
    if let Err(err) = auth_user_from_headers(&state, &headers).await {
        return err.into_response();
    }
    while let Ok(Some(field)) = multipart.next_field().await {
        if field.name().unwrap_or("") != "file" {
            continue;
        }
        let file_name = field.file_name().unwrap_or("upload").to_string();
        let mime_type = field
            .content_type()
            .map(|v| v.to_string())
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let bytes = match field.bytes().await {
            Ok(b) if !b.is_empty() => b,
            _ => continue,
        };
        return match state
            .dispatcher
            .upload_media(bytes, &file_name, &mime_type)
            .await
        {
            Ok(media_id) => (
                StatusCode::CREATED,
                Json(json!({
                    "mediaId": media_id,
                    "fileName": file_name,
                    "mimeType": mime_type
                })),
            )
                .into_response(),
            Err(err) => (StatusCode::BAD_GATEWAY, Json(json!({ "error": err }))).into_response(),
        };
    }
    bad_request("missing file field in multipart form").into_response()
}

async fn get_media(
    Path(media_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(err) = auth_user_from_headers(&state, &headers).await {
        return err.into_response();
    }
    match state.dispatcher.fetch_media(&media_id).await {
        Ok((bytes, content_type)) => {
            ([(header::CONTENT_TYPE, content_type)], bytes).into_response()
        }
        Err(err) => (StatusCode::BAD_GATEWAY, Json(json!({ "error": err }))).into_response(),
    }
}

// ---------------------------------------------------------------------------
// Bulk dispatch pipeline

async fn resolve_or_create_contact(
    state: &Arc<AppState>,
    phone: &str,
    agent_id: &str,
) -> Result<Contact, sqlx::Error> {
    let existing = sqlx::query(&format!(
        "SELECT {CONTACT_COLUMNS} FROM contacts WHERE phone = $1"
    ))
    .bind(phone)
    .fetch_optional(&state.db)
    .await?;
    if let Some(row) = existing {
        let mut contact = parse_contact_row(row);
        if contact.owner_agent_id.is_none() {
            // Claim only if still unowned; an owned contact is never reassigned.
            sqlx::query(
                "UPDATE contacts SET owner_agent_id = $1, updated_at = $2 \
                 WHERE id = $3 AND owner_agent_id IS NULL",
            )
            .bind(agent_id)
            .bind(now_iso())
            .bind(&contact.id)
            .execute(&state.db)
            .await?;
            contact.owner_agent_id = Some(agent_id.to_string());
        }
        return Ok(contact);
    }
    let now = now_iso();
    let contact = Contact {
        id: Uuid::new_v4().to_string(),
        name: String::new(),
        phone: phone.to_string(),
        customer_code: String::new(),
        tax_id: String::new(),
        notes: String::new(),
        status: ContactStatus::Queued,
        owner_agent_id: Some(agent_id.to_string()),
        last_interaction_at: now.clone(),
        created_at: now.clone(),
        updated_at: now,
    };
    sqlx::query(
        "INSERT INTO contacts (id, name, phone, customer_code, tax_id, notes, status, \
         owner_agent_id, last_interaction_at, created_at, updated_at) \
         VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11)",
    )
    .bind(&contact.id)
    .bind(&contact.name)
    .bind(&contact.phone)
    .bind(&contact.customer_code)
    .bind(&contact.tax_id)
    .bind(&contact.notes)
    .bind(contact.status.as_str())
    .bind(&contact.owner_agent_id)
    .bind(&contact.last_interaction_at)
    .bind(&contact.created_at)
    .bind(&contact.updated_at)
    .execute(&state.db)
    .await?;
    Ok(contact)
}

async fn post_broadcast(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<BroadcastBody>,
) -> impl IntoResponse {
    let profile = match auth_user_from_headers(&state, &headers).await {
        Ok(p) => p,
        Err(err) => return err.into_response(),
    };
    if let Err(err) = require_sender(&profile) {
        return err.into_response();
    }
    let template_name = body.template_name.trim().to_string();
    if template_name.is_empty() {
        return bad_request("templateName is required").into_response();
    }
    let numbers = parse_broadcast_numbers(&body.numbers);
    if numbers.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": "no valid numbers to send",
                "sent": 0,
                "failed": 0,
                "total": 0
            })),
        )
            .into_response();
    }
    let template = match find_template_by_name(&state, &template_name).await {
        Ok(t) => t,
        Err(err) => return err.into_response(),
    };
    let parameters = body.parameters.unwrap_or_default();
    let outbound = match &template {
        Some(t) => OutboundMessage::template(t, parameters.clone()),
        None => OutboundMessage {
            kind: SendKind::Template,
            text: String::new(),
            media_id: None,
            template_name: template_name.clone(),
            language_code: DEFAULT_TEMPLATE_LANGUAGE.to_string(),
            parameters: parameters.clone(),
        },
    };
    let cost = send_cost(SendKind::Template, template.as_ref());
    let log_body = template_log_text(&template_name, &parameters);

    // Runs inline in the request; each number is attempted exactly once and
    // the pipeline always reaches the final report.
    let mut sent = 0usize;
    let mut failed = 0usize;
    for (index, number) in numbers.iter().enumerate() {
        if index > 0 {
            tokio::time::sleep(Duration::from_millis(BROADCAST_PACING_MS)).await;
        }
        let contact = match resolve_or_create_contact(&state, number, &profile.id).await {
            Ok(c) => c,
            Err(_) => {
                failed += 1;
                continue;
            }
        };
        let outcome = state.dispatcher.send(number, &outbound).await;
        if outcome.is_sent() {
            let _ = append_message(
                &state,
                &contact.id,
                Sender::Company,
                Some(log_body.clone()),
                SendKind::Template,
                None,
                cost,
                Some(&profile.id),
            )
            .await;
            sent += 1;
        } else {
            failed += 1;
        }
    }
    state.queue_cache.invalidate().await;

    let report = BroadcastReport {
        sent,
        failed,
        total: numbers.len(),
    };
    (StatusCode::OK, Json(json!({ "report": report }))).into_response()
}

// ---------------------------------------------------------------------------
// Auth

async fn login(State(state): State<Arc<AppState>>, Json(body): Json<LoginBody>) -> impl IntoResponse {
    let email = normalize_email(&body.email);
    let row = sqlx::query(&format!(
        "SELECT {USER_COLUMNS}, password_hash FROM users WHERE email = $1"
    ))
    .bind(&email)
    .fetch_optional(&state.db)
    .await
    .ok()
    .flatten();
    let Some(row) = row else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid credentials" })),
        )
            .into_response();
    };
    let password_hash: String = row.get("password_hash");
    let profile = parse_user_row(row);
    if !verify(&body.password, &password_hash).unwrap_or(false) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid credentials" })),
        )
            .into_response();
    }
    if !profile.active {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "account disabled" })),
        )
            .into_response();
    }
    let token = Uuid::new_v4().to_string();
    if let Err(err) = sqlx::query(
        "INSERT INTO auth_tokens (token, user_id, created_at) VALUES ($1,$2,$3)",
    )
    .bind(&token)
    .bind(&profile.id)
    .bind(now_iso())
    .execute(&state.db)
    .await
    .map_err(db_error)
    {
        return err.into_response();
    }
    (
        StatusCode::OK,
        Json(json!({ "token": token, "user": profile })),
    )
        .into_response()
}

async fn get_me(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    match auth_user_from_headers(&state, &headers).await {
        Ok(profile) => (StatusCode::OK, Json(json!({ "user": profile }))).into_response(),
        Err(err) => err.into_response(),
    }
}

// ---------------------------------------------------------------------------
// Agent directory and user administration

async fn get_agents(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(err) = auth_user_from_headers(&state, &headers).await {
        return err.into_response();
    }
    if let Some(cached) = state.agents_cache.get().await {
        return (StatusCode::OK, Json(json!({ "agents": cached }))).into_response();
    }
    let rows = sqlx::query(&format!(
        "SELECT {USER_COLUMNS} FROM users WHERE active = TRUE ORDER BY name ASC"
    ))
    .fetch_all(&state.db)
    .await
    .unwrap_or_default();
    let agents = rows.into_iter().map(parse_user_row).collect::<Vec<_>>();
    state.agents_cache.set(agents.clone()).await;
    (StatusCode::OK, Json(json!({ "agents": agents }))).into_response()
}

async fn get_users(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    let profile = match auth_user_from_headers(&state, &headers).await {
        Ok(p) => p,
        Err(err) => return err.into_response(),
    };
    if let Err(err) = require_admin(&profile) {
        return err.into_response();
    }
    let rows = sqlx::query(&format!(
        "SELECT {USER_COLUMNS} FROM users ORDER BY created_at ASC"
    ))
    .fetch_all(&state.db)
    .await
    .unwrap_or_default();
    let users = rows.into_iter().map(parse_user_row).collect::<Vec<_>>();
    (StatusCode::OK, Json(json!({ "users": users }))).into_response()
}

fn sanitize_role(role: Option<&str>) -> String {
    match role {
        Some("admin") => "admin".to_string(),
        _ => "agent".to_string(),
    }
}

async fn create_user(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateUserBody>,
) -> impl IntoResponse {
    let profile = match auth_user_from_headers(&state, &headers).await {
        Ok(p) => p,
        Err(err) => return err.into_response(),
    };
    if let Err(err) = require_admin(&profile) {
        return err.into_response();
    }
    let name = body.name.trim().to_string();
    let email = normalize_email(&body.email);
    if name.is_empty() || email.is_empty() || body.password.is_empty() {
        return bad_request("name, email and password are required").into_response();
    }
    let already_exists =
        sqlx::query_scalar::<_, i64>("SELECT COUNT(1) FROM users WHERE email = $1")
            .bind(&email)
            .fetch_one(&state.db)
            .await
            .unwrap_or(0)
            > 0;
    if already_exists {
        return (
            StatusCode::CONFLICT,
            Json(json!({ "error": "email already registered" })),
        )
            .into_response();
    }
    let Ok(password_hash) = hash(&body.password, DEFAULT_COST) else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "failed to hash password" })),
        )
            .into_response();
    };
    let now = now_iso();
    let user = UserProfile {
        id: Uuid::new_v4().to_string(),
        name,
        email,
        role: sanitize_role(body.role.as_deref()),
        active: true,
        send_blocked: false,
        created_at: now.clone(),
        updated_at: now,
    };
    if let Err(err) = sqlx::query(
        "INSERT INTO users (id, name, email, password_hash, role, active, send_blocked, \
         created_at, updated_at) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)",
    )
    .bind(&user.id)
    .bind(&user.name)
    .bind(&user.email)
    .bind(&password_hash)
    .bind(&user.role)
    .bind(user.active)
    .bind(user.send_blocked)
    .bind(&user.created_at)
    .bind(&user.updated_at)
    .execute(&state.db)
    .await
    .map_err(db_error)
    {
        return err.into_response();
    }
    state.agents_cache.invalidate().await;
    (StatusCode::CREATED, Json(json!({ "user": user }))).into_response()
}

async fn patch_user(
    Path(user_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<PatchUserBody>,
) -> impl IntoResponse {
    let profile = match auth_user_from_headers(&state, &headers).await {
        Ok(p) => p,
        Err(err) => return err.into_response(),
    };
    if let Err(err) = require_admin(&profile) {
        return err.into_response();
    }
    let row = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"))
        .bind(&user_id)
        .fetch_optional(&state.db)
        .await
        .ok()
        .flatten();
    let Some(row) = row else {
        return not_found("user").into_response();
    };
    let mut user = parse_user_row(row);
    if let Some(v) = body.name {
        user.name = v.trim().to_string();
    }
    if let Some(v) = body.email {
        user.email = normalize_email(&v);
    }
    if let Some(v) = body.role {
        user.role = sanitize_role(Some(v.as_str()));
    }
    if let Some(v) = body.active {
        user.active = v;
    }
    if let Some(v) = body.send_blocked {
        user.send_blocked = v;
    }
    user.updated_at = now_iso();
    if let Err(err) = sqlx::query(
        "UPDATE users SET name = $1, email = $2, role = $3, active = $4, send_blocked = $5, \
         updated_at = $6 WHERE id = $7",
    )
    .bind(&user.name)
    .bind(&user.email)
    .bind(&user.role)
    .bind(user.active)
    .bind(user.send_blocked)
    .bind(&user.updated_at)
    .bind(&user.id)
    .execute(&state.db)
    .await
    .map_err(db_error)
    {
        return err.into_response();
    }
    if let Some(password) = body.password.filter(|p| !p.is_empty()) {
        let Ok(password_hash) = hash(&password, DEFAULT_COST) else {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "failed to hash password" })),
            )
                .into_response();
        };
        let _ = sqlx::query("UPDATE users SET password_hash = $1 WHERE id = $2")
            .bind(&password_hash)
            .bind(&user.id)
            .execute(&state.db)
            .await;
    }
    state.agents_cache.invalidate().await;
    (StatusCode::OK, Json(json!({ "user": user }))).into_response()
}

async fn delete_user(
    Path(user_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let profile = match auth_user_from_headers(&state, &headers).await {
        Ok(p) => p,
        Err(err) => return err.into_response(),
    };
    if let Err(err) = require_admin(&profile) {
        return err.into_response();
    }
    // Contacts referencing this user fall back to unowned via the FK; message
    // history is untouched.
    let result = sqlx::query("DELETE FROM users WHERE id = $1")
        .bind(&user_id)
        .execute(&state.db)
        .await;
    match result {
        Ok(done) if done.rows_affected() > 0 => {
            state.agents_cache.invalidate().await;
            state.queue_cache.invalidate().await;
            (StatusCode::OK, Json(json!({ "ok": true }))).into_response()
        }
        Ok(_) => not_found("user").into_response(),
        Err(err) => db_error(err).into_response(),
    }
}

// ---------------------------------------------------------------------------
// Quick replies

async fn get_quick_replies(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(err) = auth_user_from_headers(&state, &headers).await {
        return err.into_response();
    }
    let rows = sqlx::query(
        "SELECT id, title, body, created_by, created_at, updated_at FROM quick_replies \
         ORDER BY title ASC",
    )
    .fetch_all(&state.db)
    .await
    .unwrap_or_default();
    let replies = rows
        .into_iter()
        .map(parse_quick_reply_row)
        .collect::<Vec<_>>();
    (StatusCode::OK, Json(json!({ "quickReplies": replies }))).into_response()
}

async fn create_quick_reply(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateQuickReplyBody>,
) -> impl IntoResponse {
    let profile = match auth_user_from_headers(&state, &headers).await {
        Ok(p) => p,
        Err(err) => return err.into_response(),
    };
    let title = body.title.trim().to_string();
    let content = body.body.trim().to_string();
    if title.is_empty() || content.is_empty() {
        return bad_request("title and body are required").into_response();
    }
    let now = now_iso();
    let reply = QuickReply {
        id: Uuid::new_v4().to_string(),
        title,
        body: content,
        created_by: Some(profile.id),
        created_at: now.clone(),
        updated_at: now,
    };
    if let Err(err) = sqlx::query(
        "INSERT INTO quick_replies (id, title, body, created_by, created_at, updated_at) \
         VALUES ($1,$2,$3,$4,$5,$6)",
    )
    .bind(&reply.id)
    .bind(&reply.title)
    .bind(&reply.body)
    .bind(&reply.created_by)
    .bind(&reply.created_at)
    .bind(&reply.updated_at)
    .execute(&state.db)
    .await
    .map_err(db_error)
    {
        return err.into_response();
    }
    (StatusCode::CREATED, Json(json!({ "quickReply": reply }))).into_response()
}

async fn patch_quick_reply(
    Path(reply_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<PatchQuickReplyBody>,
) -> impl IntoResponse {
    if let Err(err) = auth_user_from_headers(&state, &headers).await {
        return err.into_response();
    }
    let row = sqlx::query(
        "SELECT id, title, body, created_by, created_at, updated_at FROM quick_replies \
         WHERE id = $1",
    )
    .bind(&reply_id)
    .fetch_optional(&state.db)
    .await
    .ok()
    .flatten();
    let Some(row) = row else {
        return not_found("quick reply").into_response();
    };
    let mut reply = parse_quick_reply_row(row);
    if let Some(v) = body.title {
        reply.title = v.trim().to_string();
    }
    if let Some(v) = body.body {
        reply.body = v.trim().to_string();
    }
    reply.updated_at = now_iso();
    if let Err(err) = sqlx::query(
        "UPDATE quick_replies SET title = $1, body = $2, updated_at = $3 WHERE id = $4",
    )
    .bind(&reply.title)
    .bind(&reply.body)
    .bind(&reply.updated_at)
    .bind(&reply.id)
    .execute(&state.db)
    .await
    .map_err(db_error)
    {
        return err.into_response();
    }
    (StatusCode::OK, Json(json!({ "quickReply": reply }))).into_response()
}

async fn delete_quick_reply(
    Path(reply_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(err) = auth_user_from_headers(&state, &headers).await {
        return err.into_response();
    }
    let result = sqlx::query("DELETE FROM quick_replies WHERE id = $1")
        .bind(&reply_id)
        .execute(&state.db)
        .await;
    match result {
        Ok(done) if done.rows_affected() > 0 => {
            (StatusCode::OK, Json(json!({ "ok": true }))).into_response()
        }
        Ok(_) => not_found("quick reply").into_response(),
        Err(err) => db_error(err).into_response(),
    }
}

// ---------------------------------------------------------------------------
// Templates

async fn get_templates(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(err) = auth_user_from_headers(&state, &headers).await {
        return err.into_response();
    }
    let rows = sqlx::query(
        "SELECT id, name, language_code, cost, created_at, updated_at FROM templates \
         ORDER BY name ASC",
    )
    .fetch_all(&state.db)
    .await
    .unwrap_or_default();
    let templates = rows.into_iter().map(parse_template_row).collect::<Vec<_>>();
    (StatusCode::OK, Json(json!({ "templates": templates }))).into_response()
}

async fn create_template(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateTemplateBody>,
) -> impl IntoResponse {
    let profile = match auth_user_from_headers(&state, &headers).await {
        Ok(p) => p,
        Err(err) => return err.into_response(),
    };
    if let Err(err) = require_admin(&profile) {
        return err.into_response();
    }
    let name = body.name.trim().to_string();
    if name.is_empty() {
        return bad_request("name is required").into_response();
    }
    let already_exists =
        sqlx::query_scalar::<_, i64>("SELECT COUNT(1) FROM templates WHERE name = $1")
            .bind(&name)
            .fetch_one(&state.db)
            .await
            .unwrap_or(0)
            > 0;
    if already_exists {
        return (
            StatusCode::CONFLICT,
            Json(json!({ "error": "template name already registered" })),
        )
            .into_response();
    }
    let now = now_iso();
    let template = MessageTemplate {
        id: Uuid::new_v4().to_string(),
        name,
        language_code: body
            .language_code
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or(DEFAULT_TEMPLATE_LANGUAGE)
            .to_string(),
        cost: body.cost.unwrap_or(0.0),
        created_at: now.clone(),
        updated_at: now,
    };
    if let Err(err) = sqlx::query(
        "INSERT INTO templates (id, name, language_code, cost, created_at, updated_at) \
         VALUES ($1,$2,$3,$4,$5,$6)",
    )
    .bind(&template.id)
    .bind(&template.name)
    .bind(&template.language_code)
    .bind(template.cost)
    .bind(&template.created_at)
    .bind(&template.updated_at)
    .execute(&state.db)
    .await
    .map_err(db_error)
    {
        return err.into_response();
    }
    (StatusCode::CREATED, Json(json!({ "template": template }))).into_response()
}

async fn patch_template(
    Path(template_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<PatchTemplateBody>,
) -> impl IntoResponse {
    let profile = match auth_user_from_headers(&state, &headers).await {
        Ok(p) => p,
        Err(err) => return err.into_response(),
    };
    if let Err(err) = require_admin(&profile) {
        return err.into_response();
    }
    let row = sqlx::query(
        "SELECT id, name, language_code, cost, created_at, updated_at FROM templates \
         WHERE id = $1",
    )
    .bind(&template_id)
    .fetch_optional(&state.db)
    .await
    .ok()
    .flatten();
    let Some(row) = row else {
        return not_found("template").into_response();
    };
    let mut template = parse_template_row(row);
    if let Some(v) = body.name {
        let v = v.trim().to_string();
        if !v.is_empty() {
            template.name = v;
        }
    }
    if let Some(v) = body.language_code {
        let v = v.trim().to_string();
        if !v.is_empty() {
            template.language_code = v;
        }
    }
    if let Some(v) = body.cost {
        template.cost = v;
    }
    template.updated_at = now_iso();
    if let Err(err) = sqlx::query(
        "UPDATE templates SET name = $1, language_code = $2, cost = $3, updated_at = $4 \
         WHERE id = $5",
    )
    .bind(&template.name)
    .bind(&template.language_code)
    .bind(template.cost)
    .bind(&template.updated_at)
    .bind(&template.id)
    .execute(&state.db)
    .await
    .map_err(db_error)
    {
        return err.into_response();
    }
    (StatusCode::OK, Json(json!({ "template": template }))).into_response()
}

async fn delete_template(
    Path(template_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let profile = match auth_user_from_headers(&state, &headers).await {
        Ok(p) => p,
        Err(err) => return err.into_response(),
    };
    if let Err(err) = require_admin(&profile) {
        return err.into_response();
    }
    let result = sqlx::query("DELETE FROM templates WHERE id = $1")
        .bind(&template_id)
        .execute(&state.db)
        .await;
    match result {
        Ok(done) if done.rows_affected() > 0 => {
            (StatusCode::OK, Json(json!({ "ok": true }))).into_response()
        }
        Ok(_) => not_found("template").into_response(),
        Err(err) => db_error(err).into_response(),
    }
}

// ---------------------------------------------------------------------------
// Settings

const WELCOME_MESSAGE_KEY: &str = "welcome_message";

async fn get_settings(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    let profile = match auth_user_from_headers(&state, &headers).await {
        Ok(p) => p,
        Err(err) => return err.into_response(),
    };
    if let Err(err) = require_admin(&profile) {
        return err.into_response();
    }
    let welcome = sqlx::query_scalar::<_, String>("SELECT value FROM settings WHERE key = $1")
        .bind(WELCOME_MESSAGE_KEY)
        .fetch_optional(&state.db)
        .await
        .ok()
        .flatten()
        .unwrap_or_default();
    (
        StatusCode::OK,
        Json(json!({ "welcomeMessage": welcome })),
    )
        .into_response()
}

async fn put_welcome_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<PutWelcomeMessageBody>,
) -> impl IntoResponse {
    let profile = match auth_user_from_headers(&state, &headers).await {
        Ok(p) => p,
        Err(err) => return err.into_response(),
    };
    if let Err(err) = require_admin(&profile) {
        return err.into_response();
    }
    if let Err(err) = sqlx::query(
        "INSERT INTO settings (key, value, updated_at) VALUES ($1,$2,$3) \
         ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = EXCLUDED.updated_at",
    )
    .bind(WELCOME_MESSAGE_KEY)
    .bind(&body.welcome_message)
    .bind(now_iso())
    .execute(&state.db)
    .await
    .map_err(db_error)
    {
        return err.into_response();
    }
    (
        StatusCode::OK,
        Json(json!({ "welcomeMessage": body.welcome_message })),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Reporting

async fn get_cost_report(
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let profile = match auth_user_from_headers(&state, &headers).await {
        Ok(p) => p,
        Err(err) => return err.into_response(),
    };
    if let Err(err) = require_admin(&profile) {
        return err.into_response();
    }
    let days = params
        .get("days")
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(30)
        .clamp(1, 365);
    let cutoff = (Utc::now() - ChronoDuration::days(days)).to_rfc3339();
    let rows = sqlx::query(
        "SELECT u.id, u.name, COUNT(m.id) AS message_count, \
         COALESCE(SUM(m.cost), 0) AS total_cost \
         FROM users u \
         LEFT JOIN contacts c ON c.owner_agent_id = u.id \
         LEFT JOIN messages m ON m.contact_id = c.id AND m.sender = 'company' \
         AND m.sent_at >= $1 \
         GROUP BY u.id, u.name \
         ORDER BY total_cost DESC",
    )
    .bind(&cutoff)
    .fetch_all(&state.db)
    .await
    .unwrap_or_default();
    let report = rows
        .into_iter()
        .map(|row| AgentCostReport {
            agent_id: row.get("id"),
            agent_name: row.get("name"),
            message_count: row.get("message_count"),
            total_cost: row.get("total_cost"),
        })
        .collect::<Vec<_>>();
    let total_cost = report.iter().map(|r| r.total_cost).sum::<f64>();
    (
        StatusCode::OK,
        Json(json!({
            "windowDays": days,
            "totalCost": total_cost,
            "agents": report
        })),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Bootstrap

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "ok": true })))
}

fn require_env(name: &str) -> String {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => value,
        _ => panic!("{name} must be set"),
    }
}

async fn seed_admin_user(db: &PgPool) {
    let user_count = sqlx::query_scalar::<_, i64>("SELECT COUNT(1) FROM users")
        .fetch_one(db)
        .await
        .unwrap_or(0);
    if user_count > 0 {
        return;
    }
    let email = env::var("ADMIN_EMAIL").unwrap_or_else(|_| "admin@example.com".to_string());
    let password = env::var("ADMIN_PASSWORD").unwrap_or_else(|_| "changeme".to_string());
    let password_hash = hash(&password, DEFAULT_COST).expect("failed to hash admin password");
    let now = now_iso();
    let _ = sqlx::query(
        "INSERT INTO users (id, name, email, password_hash, role, active, send_blocked, \
         created_at, updated_at) VALUES ($1,$2,$3,$4,'admin',TRUE,FALSE,$5,$5)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind("Administrator")
    .bind(normalize_email(&email))
    .bind(&password_hash)
    .bind(&now)
    .execute(db)
    .await;
    println!("seeded initial admin user {email}");
}

pub async fn run() {
    let _ = dotenvy::dotenv();

    let port = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(4000);
    let database_url = require_env("DATABASE_URL");
    let access_token = require_env("WHATSAPP_ACCESS_TOKEN");
    let phone_number_id = require_env("WHATSAPP_PHONE_NUMBER_ID");
    let api_base =
        env::var("WHATSAPP_API_BASE").unwrap_or_else(|_| DEFAULT_API_BASE.to_string());

    let db = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .expect("failed to connect to postgres (set DATABASE_URL)");

    sqlx::migrate!("./migrations")
        .run(&db)
        .await
        .expect("failed to run sqlx migrations");

    seed_admin_user(&db).await;

    let state = Arc::new(AppState {
        db,
        dispatcher: Dispatcher::new(
            reqwest::Client::new(),
            api_base,
            access_token,
            phone_number_id,
        ),
        queue_cache: TimedCache::new(QUEUE_CACHE_TTL),
        agents_cache: TimedCache::new(QUEUE_CACHE_TTL),
    });

    let app = Router::new()
        .route("/health", get(health))
        .route("/api/auth/login", post(login))
        .route("/api/auth/me", get(get_me))
        .route("/api/queue", get(get_queue))
        .route(
            "/api/contacts/{contact_id}",
            get(get_contact).patch(patch_contact),
        )
        .route("/api/contacts/{contact_id}/transfer", post(transfer_contact))
        .route("/api/contacts/{contact_id}/close", post(close_contact))
        .route(
            "/api/contacts/{contact_id}/messages",
            get(get_messages).post(post_message),
        )
        .route("/api/uploads/media", post(upload_media))
        .route("/api/media/{media_id}", get(get_media))
        .route("/api/broadcasts", post(post_broadcast))
        .route("/api/agents", get(get_agents))
        .route("/api/users", get(get_users).post(create_user))
        .route(
            "/api/users/{user_id}",
            patch(patch_user).delete(delete_user),
        )
        .route(
            "/api/quick-replies",
            get(get_quick_replies).post(create_quick_reply),
        )
        .route(
            "/api/quick-replies/{reply_id}",
            patch(patch_quick_reply).delete(delete_quick_reply),
        )
        .route("/api/templates", get(get_templates).post(create_template))
        .route(
            "/api/templates/{template_id}",
            patch(patch_template).delete(delete_template),
        )
        .route("/api/settings", get(get_settings))
        .route("/api/settings/welcome-message", put(put_welcome_message))
        .route("/api/reports/costs", get(get_cost_report))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind TCP listener");

    println!("crm server running at http://localhost:{port}");
    axum::serve(listener, app)
        .await
        .expect("server runtime failure");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact(id: &str, status: ContactStatus, owner: Option<&str>) -> Contact {
        Contact {
            id: id.to_string(),
            name: String::new(),
            phone: format!("55319{id}"),
            customer_code: String::new(),
            tax_id: String::new(),
            notes: String::new(),
            status,
            owner_agent_id: owner.map(str::to_string),
            last_interaction_at: String::new(),
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[test]
    fn agents_see_own_and_unowned_contacts_only() {
        let contacts = vec![
            contact("1", ContactStatus::Queued, None),
            contact("2", ContactStatus::InProgress, Some("agent-a")),
            contact("3", ContactStatus::InProgress, Some("agent-b")),
        ];
        let view = queue_view(&contacts, false, "agent-a");
        let ids = view.iter().map(|c| c.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["1", "2"]);
    }

    #[test]
    fn admins_see_every_open_contact() {
        let contacts = vec![
            contact("1", ContactStatus::Queued, None),
            contact("2", ContactStatus::InProgress, Some("agent-a")),
            contact("3", ContactStatus::InProgress, Some("agent-b")),
        ];
        let view = queue_view(&contacts, true, "agent-a");
        assert_eq!(view.len(), 3);
    }

    #[test]
    fn closed_contacts_never_appear_in_a_queue_view() {
        let contacts = vec![
            contact("1", ContactStatus::Closed, Some("agent-a")),
            contact("2", ContactStatus::InProgress, Some("agent-a")),
        ];
        let view = queue_view(&contacts, true, "agent-a");
        let ids = view.iter().map(|c| c.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["2"]);
    }

    #[test]
    fn queue_view_preserves_input_order() {
        let contacts = vec![
            contact("newest", ContactStatus::Queued, None),
            contact("older", ContactStatus::Queued, None),
        ];
        let view = queue_view(&contacts, false, "agent-a");
        let ids = view.iter().map(|c| c.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["newest", "older"]);
    }

    #[tokio::test]
    async fn cache_returns_values_within_ttl() {
        let cache = TimedCache::new(Duration::from_secs(60));
        assert!(cache.get().await.is_none());
        cache.set(vec![1, 2, 3]).await;
        assert_eq!(cache.get().await, Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn cache_invalidate_clears_the_slot() {
        let cache = TimedCache::new(Duration::from_secs(60));
        cache.set("queue".to_string()).await;
        cache.invalidate().await;
        assert!(cache.get().await.is_none());
    }

    #[tokio::test]
    async fn cache_expires_after_ttl() {
        let cache = TimedCache::new(Duration::ZERO);
        cache.set(42u32).await;
        assert!(cache.get().await.is_none());
    }

    #[test]
    fn role_sanitizing_only_admits_known_roles() {
        assert_eq!(sanitize_role(Some("admin")), "admin");
        assert_eq!(sanitize_role(Some("superuser")), "agent");
        assert_eq!(sanitize_role(None), "agent");
    }
}
