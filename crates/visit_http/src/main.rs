//! HTTP surface for the identification engine.
//!
//! Thin by design: JSON in, JSON out. Everything interesting happens in
//! `match_engine`; this binary extracts transport metadata (client IP,
//! user agent, referer, optional proxy-supplied TLS fingerprints) and maps
//! engine errors onto status codes. Store internals stay opaque to clients.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use match_engine::{EngineConfig, EngineError, MatchEngine};
use visit_models::{DailyStatsRow, MatchResponse, RequestMeta, Submission, TrustLevel};
use visitor_db::VisitorDb;

#[derive(Clone)]
struct AppState {
    engine: Arc<MatchEngine>,
    db: Arc<VisitorDb>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Deserialize)]
struct DailyStatsQuery {
    #[serde(default = "default_days")]
    days: usize,
}

fn default_days() -> usize {
    30
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VisitorDetailResponse {
    visitor_id: Uuid,
    first_seen: i64,
    visit_count: u64,
    last_visit: Option<i64>,
    trust_level: TrustLevel,
    crowd_score: f64,
    recent_visits: Vec<visit_models::RecentVisit>,
}

/// Client IP: first segment of the forwarded-for header when a fronting
/// proxy supplies one, else the peer address.
fn client_ip(headers: &HeaderMap, peer: &SocketAddr) -> Option<String> {
    if let Some(xff) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = xff.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return Some(first.to_string());
            }
        }
    }
    Some(peer.ip().to_string())
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn request_meta(headers: &HeaderMap, peer: &SocketAddr) -> RequestMeta {
    RequestMeta {
        ip_address: client_ip(headers, peer),
        user_agent: header_string(headers, "user-agent"),
        referer: header_string(headers, "referer"),
        tls_ja4: header_string(headers, "x-tls-ja4"),
        tls_ja3: header_string(headers, "x-tls-ja3"),
        header_order_hash: header_string(headers, "x-header-order-hash"),
    }
}

fn map_engine_error(err: EngineError) -> (StatusCode, String) {
    match err {
        EngineError::InvalidSubmission { field } => (
            StatusCode::BAD_REQUEST,
            format!("invalid submission: {field}"),
        ),
        EngineError::Timeout(_) => {
            tracing::error!("store deadline exceeded");
            (StatusCode::GATEWAY_TIMEOUT, "store timeout".to_string())
        }
        other => {
            // Store details never reach the client.
            tracing::error!("identify failed: {other}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal error".to_string(),
            )
        }
    }
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn identify(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(submission): Json<Submission>,
) -> Result<Json<MatchResponse>, (StatusCode, String)> {
    let meta = request_meta(&headers, &peer);
    let response = state
        .engine
        .identify(submission, meta)
        .await
        .map_err(map_engine_error)?;
    Ok(Json(response))
}

async fn daily_stats(
    State(state): State<AppState>,
    Query(q): Query<DailyStatsQuery>,
) -> Result<Json<Vec<DailyStatsRow>>, (StatusCode, String)> {
    let rows = state.db.daily_stats(q.days.min(365)).map_err(|e| {
        tracing::error!("daily stats read failed: {e}");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal error".to_string(),
        )
    })?;
    Ok(Json(rows))
}

async fn visitor_detail(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<VisitorDetailResponse>, (StatusCode, String)> {
    let view = state
        .db
        .visitor_with_recent(&id, 10)
        .map_err(|e| {
            tracing::error!("visitor read failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal error".to_string(),
            )
        })?
        .ok_or((StatusCode::NOT_FOUND, "unknown visitor".to_string()))?;

    Ok(Json(VisitorDetailResponse {
        visitor_id: view.visitor.id,
        first_seen: view.visitor.created_at,
        visit_count: view.visit_count,
        last_visit: view.last_visit,
        trust_level: view.visitor.trust_level,
        crowd_score: view.visitor.crowd_score,
        recent_visits: view
            .recent
            .iter()
            .map(|s| visit_models::RecentVisit {
                timestamp: s.first_seen,
                ip_address: s.ip_address.clone(),
                browser: s
                    .user_agent
                    .as_deref()
                    .and_then(visit_models::browser_from_user_agent)
                    .map(str::to_string),
            })
            .collect(),
    }))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = EngineConfig::from_env()?;
    let db_path = std::env::var("VISITD_DB_PATH").unwrap_or_else(|_| "./visitors.db".to_string());
    let db = Arc::new(VisitorDb::open(&db_path)?);
    let engine = Arc::new(MatchEngine::new(Arc::clone(&db), config));
    let state = AppState { engine, db };

    let app = Router::new()
        .route("/health", get(health))
        .route("/identify", post(identify))
        .route("/stats/daily", get(daily_stats))
        .route("/visitors/:id", get(visitor_detail))
        .with_state(state);

    let addr: SocketAddr = std::env::var("VISITD_HTTP_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:8090".to_string())
        .parse()?;

    tracing::info!("visit_http listening on {addr}, store at {db_path}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "192.0.2.7:55555".parse().unwrap()
    }

    #[test]
    fn forwarded_for_takes_the_first_segment() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.4, 10.0.0.1".parse().unwrap());
        assert_eq!(client_ip(&headers, &peer()).as_deref(), Some("203.0.113.4"));
    }

    #[test]
    fn missing_forwarded_for_falls_back_to_peer() {
        let headers = HeaderMap::new();
        assert_eq!(client_ip(&headers, &peer()).as_deref(), Some("192.0.2.7"));
    }

    #[test]
    fn blank_forwarded_for_falls_back_to_peer() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "  ".parse().unwrap());
        assert_eq!(client_ip(&headers, &peer()).as_deref(), Some("192.0.2.7"));
    }
}
