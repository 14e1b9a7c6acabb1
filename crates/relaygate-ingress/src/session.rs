//! Session fingerprinting for sticky routing
//!
//! Priority:
//! 1. `x-session-id` header supplied by the client
//! 2. session part of `metadata.user_id` (`..._session_<id>`)
//! 3. SHA-256 of the cacheable system prompt (blocks carrying `cache_control`)
//! 4. SHA-256 of the first user message's text (any first message if none is
//!    from the user)
//!
//! Hashes are truncated to the first 32 hex characters.

use axum::http::HeaderMap;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

pub const SESSION_HEADER: &str = "x-session-id";

const MAX_SESSION_ID_LEN: usize = 255;
const HASH_LEN: usize = 32;

/// Derive the affinity key for a request, if it carries anything stable
pub fn derive_session_hash(headers: &HeaderMap, body: &Value) -> Option<String> {
    if let Some(explicit) = headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|id| is_valid_session_id(id))
    {
        debug!(session_id = explicit, "Using explicit session id");
        return Some(explicit.to_string());
    }

    if let Some(session) = metadata_session(body) {
        return Some(session);
    }

    if let Some(system) = cacheable_system_text(body) {
        return Some(hash_text(&system));
    }

    first_message_text(body).map(|text| hash_text(&text))
}

fn is_valid_session_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_SESSION_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn metadata_session(body: &Value) -> Option<String> {
    let user_id = body.get("metadata")?.get("user_id")?.as_str()?;
    let (_, session) = user_id.split_once("_session_")?;
    let session = session.trim();
    is_valid_session_id(session).then(|| session.to_string())
}

/// Concatenated text of system blocks marked for prompt caching
fn cacheable_system_text(body: &Value) -> Option<String> {
    let blocks = body.get("system")?.as_array()?;
    let text: String = blocks
        .iter()
        .filter(|block| block.get("cache_control").is_some())
        .filter_map(|block| block.get("text").and_then(Value::as_str))
        .collect();
    (!text.is_empty()).then_some(text)
}

fn first_message_text(body: &Value) -> Option<String> {
    let messages = body.get("messages")?.as_array()?;
    // A leading OpenAI-style system message is shared across conversations.
    let first = messages
        .iter()
        .find(|m| m.get("role").and_then(Value::as_str) == Some("user"))
        .or_else(|| messages.first())?;
    let text = match first.get("content")? {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(""),
        _ => return None,
    };
    (!text.trim().is_empty()).then_some(text)
}

fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..HASH_LEN].to_string()
}
