//! src/api/data.rs
//!
//! The client data plane: write a value under a key with a TTL, read it back
//! with its TTL metadata, and page through live keys.

use crate::{
    api::{ApiError, AppState},
    coordinator::WriteOutcome,
    error::Error,
};
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const DEFAULT_PAGE_LIMIT: usize = 100;
const MAX_PAGE_LIMIT: usize = 1000;

#[derive(Debug, Deserialize)]
pub struct PutQuery {
    pub ttl: Option<u64>,
}

/// The TTL comes from `?ttl=` or the `X-TTL` header; a write without one is
/// rejected, since every entry must expire.
fn resolve_ttl(query: &PutQuery, headers: &HeaderMap) -> Result<u64, Error> {
    if let Some(ttl) = query.ttl {
        return Ok(ttl);
    }
    if let Some(raw) = headers.get("x-ttl") {
        return raw
            .to_str()
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| Error::InvalidRequest("X-TTL must be an integer".to_string()));
    }
    Err(Error::InvalidRequest(
        "TTL required via ?ttl= or X-TTL".to_string(),
    ))
}

/// `PUT /v1/data/{key}` — 201 once quorum confirms, 202 on deadline.
pub async fn put_value(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(query): Query<PutQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    if body.len() > state.config.max_value_bytes {
        return Err(Error::Oversized.into());
    }
    let ttl = state.config.clamp_ttl(resolve_ttl(&query, &headers)?);

    let outcome = state.coordinator.put(&key, &body, ttl).await?;
    Ok(match outcome {
        WriteOutcome::Replicated => StatusCode::CREATED,
        WriteOutcome::Accepted => StatusCode::ACCEPTED,
    })
}

/// `GET /v1/data/{key}` — raw bytes plus TTL metadata headers. Axum serves
/// HEAD from this handler with the body stripped.
pub async fn get_value(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Response, ApiError> {
    let meta = state
        .store
        .get_with_metadata(&key)
        .ok_or(Error::NotFound)?;

    let created: DateTime<Utc> = meta.created_at.into();
    let headers = [
        ("x-created-at", created.to_rfc3339()),
        ("x-original-ttl", meta.ttl_seconds.to_string()),
        ("x-remaining-ttl", meta.remaining_ttl_seconds.to_string()),
        ("content-type", "application/octet-stream".to_string()),
    ];
    Ok((headers, meta.value).into_response())
}

#[derive(Debug, Deserialize)]
pub struct KeysQuery {
    pub prefix: Option<String>,
    pub cursor: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct KeysResponse {
    pub keys: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// `GET /v1/keys?prefix=&cursor=&limit=` — sorted page of live keys. The
/// cursor is the last key of the previous page; pagination resumes strictly
/// after it.
pub async fn list_keys(
    State(state): State<AppState>,
    Query(query): Query<KeysQuery>,
) -> Json<KeysResponse> {
    let mut keys = state.store.scan(query.prefix.as_deref());
    keys.sort();
    let limit = query
        .limit
        .unwrap_or(DEFAULT_PAGE_LIMIT)
        .clamp(1, MAX_PAGE_LIMIT);
    Json(paginate(keys, query.cursor.as_deref(), limit))
}

fn paginate(sorted_keys: Vec<String>, cursor: Option<&str>, limit: usize) -> KeysResponse {
    let remaining: Vec<String> = sorted_keys
        .into_iter()
        .filter(|key| cursor.map_or(true, |c| key.as_str() > c))
        .collect();

    let has_more = remaining.len() > limit;
    let keys: Vec<String> = remaining.into_iter().take(limit).collect();
    let next_cursor = if has_more {
        keys.last().cloned()
    } else {
        None
    };
    KeysResponse { keys, next_cursor }
}
