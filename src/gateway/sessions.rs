//! Session routes.

use super::server::AppState;
use super::types::{
    CheckNumbersBody, CreateSessionBody, DeletedResponse, PairResponse, PresenceBody,
    SendMessageBody, TypingBody, UpdateSessionBody,
};
use crate::error::{Result, WamuxError};
use crate::session::send::SendReceipt;
use crate::session::{CreateSessionRequest, SessionView, UserCtx};
use crate::wa::{ChatInfo, GroupInfo, NumberStatus};
use axum::extract::{Path, State};
use axum::Json;
use base64::Engine as _;

pub async fn create_session(
    State(state): State<AppState>,
    caller: UserCtx,
    Json(body): Json<CreateSessionBody>,
) -> Result<Json<SessionView>> {
    let req = CreateSessionRequest {
        phone: body.phone,
        name: body.name,
        position: body.position,
        webhook_url: body.webhook_url,
        auto_reply_text: body.auto_reply_text,
        proxy: body.proxy,
    };
    Ok(Json(state.manager.create(req, &caller).await?))
}

pub async fn list_sessions(
    State(state): State<AppState>,
    caller: UserCtx,
) -> Json<Vec<SessionView>> {
    Json(state.manager.list(&caller).await)
}

pub async fn get_session(
    State(state): State<AppState>,
    caller: UserCtx,
    Path(id): Path<String>,
) -> Result<Json<SessionView>> {
    Ok(Json(state.manager.get(&id, &caller).await?))
}

pub async fn delete_session(
    State(state): State<AppState>,
    caller: UserCtx,
    Path(id): Path<String>,
) -> Result<Json<DeletedResponse>> {
    state.manager.delete(&id, &caller).await?;
    Ok(Json(DeletedResponse { deleted: true }))
}

pub async fn connect_session(
    State(state): State<AppState>,
    caller: UserCtx,
    Path(id): Path<String>,
) -> Result<Json<SessionView>> {
    Ok(Json(state.manager.connect(&id, &caller).await?))
}

pub async fn disconnect_session(
    State(state): State<AppState>,
    caller: UserCtx,
    Path(id): Path<String>,
) -> Result<Json<SessionView>> {
    state.manager.disconnect(&id, &caller).await?;
    Ok(Json(state.manager.get(&id, &caller).await?))
}

pub async fn logout_session(
    State(state): State<AppState>,
    caller: UserCtx,
    Path(id): Path<String>,
) -> Result<Json<SessionView>> {
    state.manager.logout(&id, &caller).await?;
    Ok(Json(state.manager.get(&id, &caller).await?))
}

pub async fn pair_session(
    State(state): State<AppState>,
    caller: UserCtx,
    Path(id): Path<String>,
) -> Result<Json<PairResponse>> {
    let code = state.manager.request_pairing_code(&id, &caller).await?;
    Ok(Json(PairResponse { code }))
}

pub async fn update_session(
    State(state): State<AppState>,
    caller: UserCtx,
    Path(id): Path<String>,
    Json(body): Json<UpdateSessionBody>,
) -> Result<Json<SessionView>> {
    if body.name.is_some() || body.position.is_some() {
        state
            .manager
            .update_metadata(&id, &caller, body.name, body.position)
            .await?;
    }
    if let Some(webhook_url) = body.webhook_url {
        state
            .manager
            .update_webhook(&id, &caller, Some(webhook_url))
            .await?;
    }
    if let Some(text) = body.auto_reply_text {
        state
            .manager
            .update_auto_reply_text(&id, &caller, Some(text))
            .await?;
    }
    if let Some(enabled) = body.enabled {
        state.manager.set_enabled(&id, &caller, enabled).await?;
    }
    Ok(Json(state.manager.get(&id, &caller).await?))
}

pub async fn send_message(
    State(state): State<AppState>,
    caller: UserCtx,
    Path(id): Path<String>,
    Json(body): Json<SendMessageBody>,
) -> Result<Json<SendReceipt>> {
    let manager = &state.manager;
    let receipt = match body.message_type.as_str() {
        "text" => {
            let message = required(body.message, "message")?;
            manager.send_text(&id, &caller, &body.to, &message).await?
        }
        "reply" => {
            let message = required(body.message, "message")?;
            let quoted = required(body.quoted_message_id, "quoted_message_id")?;
            manager
                .reply(&id, &caller, &body.to, &message, &quoted)
                .await?
        }
        "image" => {
            let bytes = decode_media(body.media_base64)?;
            let mimetype = body.mimetype.unwrap_or_else(|| "image/jpeg".to_string());
            manager
                .send_image(&id, &caller, &body.to, bytes, &mimetype, body.caption)
                .await?
        }
        "document" => {
            let bytes = decode_media(body.media_base64)?;
            let mimetype = body
                .mimetype
                .unwrap_or_else(|| "application/octet-stream".to_string());
            let filename = body.filename.unwrap_or_else(|| "file".to_string());
            manager
                .send_attachment(
                    &id, &caller, &body.to, bytes, &mimetype, &filename, body.caption,
                )
                .await?
        }
        "url" => {
            let url = required(body.url, "url")?;
            manager
                .send_file_from_url(&id, &caller, &body.to, &url, body.caption)
                .await?
        }
        "location" => {
            let latitude = body
                .latitude
                .ok_or_else(|| WamuxError::BadRequest("latitude is required".to_string()))?;
            let longitude = body
                .longitude
                .ok_or_else(|| WamuxError::BadRequest("longitude is required".to_string()))?;
            manager
                .send_location(
                    &id,
                    &caller,
                    &body.to,
                    latitude,
                    longitude,
                    body.location_name,
                    body.address,
                )
                .await?
        }
        "forward" => {
            let source_chat = required(body.source_chat, "source_chat")?;
            let message_id = required(body.message_id, "message_id")?;
            manager
                .forward(&id, &caller, &body.to, &source_chat, &message_id)
                .await?
        }
        other => {
            return Err(WamuxError::BadRequest(format!(
                "unknown message_type {other:?}"
            )));
        }
    };
    Ok(Json(receipt))
}

pub async fn send_typing(
    State(state): State<AppState>,
    caller: UserCtx,
    Path(id): Path<String>,
    Json(body): Json<TypingBody>,
) -> Result<Json<serde_json::Value>> {
    state
        .manager
        .send_typing(&id, &caller, &body.to, body.state)
        .await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

pub async fn set_presence(
    State(state): State<AppState>,
    caller: UserCtx,
    Path(id): Path<String>,
    Json(body): Json<PresenceBody>,
) -> Result<Json<serde_json::Value>> {
    state.manager.set_presence(&id, &caller, body.presence).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

pub async fn check_numbers(
    State(state): State<AppState>,
    caller: UserCtx,
    Path(id): Path<String>,
    Json(body): Json<CheckNumbersBody>,
) -> Result<Json<Vec<NumberStatus>>> {
    Ok(Json(
        state.manager.check_numbers(&id, &caller, &body.numbers).await?,
    ))
}

pub async fn list_groups(
    State(state): State<AppState>,
    caller: UserCtx,
    Path(id): Path<String>,
) -> Result<Json<Vec<GroupInfo>>> {
    Ok(Json(state.manager.list_groups(&id, &caller).await?))
}

pub async fn list_conversations(
    State(state): State<AppState>,
    caller: UserCtx,
    Path(id): Path<String>,
) -> Result<Json<Vec<ChatInfo>>> {
    Ok(Json(state.manager.list_conversations(&id, &caller).await?))
}

fn required(value: Option<String>, field: &str) -> Result<String> {
    value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| WamuxError::BadRequest(format!("{field} is required")))
}

fn decode_media(media_base64: Option<String>) -> Result<Vec<u8>> {
    let encoded = required(media_base64, "media_base64")?;
    base64::engine::general_purpose::STANDARD
        .decode(encoded.as_bytes())
        .map_err(|e| WamuxError::BadRequest(format!("invalid base64 media: {e}")))
}
