//! Shared data model for the returning-visitor identification engine.
//!
//! Everything wire-facing lives here: the per-request submission, the
//! persisted visitor/fingerprint/session records, the match classification
//! enums and the response payloads. The `hashes` module holds the digest and
//! distance primitives the match layers are built on.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod hashes;

pub use hashes::{hamming, hmac_sha256_hex, sha256_hex, similarity, HashError};

/// Fixed width of every hash field in the system (hex characters).
pub const HEX_HASH_WIDTH: usize = 64;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("field {0} is not a {HEX_HASH_WIDTH}-char hex string")]
    InvalidHex(&'static str),
}

/// True when `s` is exactly 64 ASCII hex digits.
pub fn is_hex64(s: &str) -> bool {
    s.len() == HEX_HASH_WIDTH && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Lowercase and validate a required hash field.
pub fn normalize_hex64(field: &'static str, value: &str) -> Result<String, ModelError> {
    let lower = value.to_ascii_lowercase();
    if is_hex64(&lower) {
        Ok(lower)
    } else {
        Err(ModelError::InvalidHex(field))
    }
}

/// Lowercase and validate an optional hash field.
///
/// The empty string is the null sentinel some collectors emit for an
/// unreliable hash; it reads back as `None` and never participates in a
/// match.
pub fn normalize_opt_hex64(
    field: &'static str,
    value: Option<&str>,
) -> Result<Option<String>, ModelError> {
    match value {
        None => Ok(None),
        Some(s) if s.is_empty() => Ok(None),
        Some(s) => normalize_hex64(field, s).map(Some),
    }
}

// ===== Match classification =====

/// Which layer of the state machine resolved the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchType {
    Exact,
    Stable,
    Gpu,
    FuzzyStable,
    Fuzzy,
    New,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Stable => "stable",
            Self::Gpu => "gpu",
            Self::FuzzyStable => "fuzzy-stable",
            Self::Fuzzy => "fuzzy",
            Self::New => "new",
        }
    }
}

/// Coarsened crowd-blending score, cached on the visitor row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrustLevel {
    New,
    Returning,
    Trusted,
    Verified,
}

impl TrustLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Returning => "RETURNING",
            Self::Trusted => "TRUSTED",
            Self::Verified => "VERIFIED",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "RETURNING" => Self::Returning,
            "TRUSTED" => Self::Trusted,
            "VERIFIED" => Self::Verified,
            _ => Self::New,
        }
    }
}

// ===== Submission (client -> engine) =====

/// Validity metadata for the GPU-timing signal. Privacy-mode timer
/// throttling collapses distinct devices onto a trivial timing vector, so
/// the raw hash is only usable when the client reports a healthy score.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuTimingMeta {
    pub supported: bool,
    #[serde(default)]
    pub gpu_score: f64,
}

/// One fingerprint submission, as posted by the collector. Transient.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub fingerprint: String,
    pub fuzzy_hash: String,
    #[serde(default)]
    pub stable_hash: Option<String>,
    #[serde(default)]
    pub gpu_timing_hash: Option<String>,
    #[serde(default)]
    pub gpu_timing: Option<GpuTimingMeta>,
    /// Opaque per-module raw data, retained verbatim for later analysis.
    #[serde(default)]
    pub components: serde_json::Value,
    #[serde(default)]
    pub entropy: Option<f64>,
    #[serde(default)]
    pub detected_browser: Option<String>,
    /// Signed identity token `"{visitor_id}.{sig16}.{created_at_ms}"`.
    #[serde(default)]
    pub persistent_id: Option<String>,
    /// Privacy-tool perturbation detected client-side.
    #[serde(default)]
    pub is_farbled: bool,
    /// Client clock, ms since epoch. Informational only.
    #[serde(default)]
    pub timestamp: Option<i64>,
}

/// Transport-level request metadata. None of these fields participate in
/// matching; they are persisted to the session row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMeta {
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub referer: Option<String>,
    #[serde(default)]
    pub tls_ja4: Option<String>,
    #[serde(default)]
    pub tls_ja3: Option<String>,
    #[serde(default)]
    pub header_order_hash: Option<String>,
}

// ===== Persisted records =====

/// Visitor row, including the derived trust cache. The cache may lag
/// reality; the crowd scorer is the authority and can always be rerun.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisitorRecord {
    pub id: Uuid,
    pub created_at: i64,
    pub updated_at: i64,
    pub trust_level: TrustLevel,
    pub crowd_score: f64,
    pub unique_ips: u32,
    pub visit_count: u32,
    pub last_score_update: Option<i64>,
}

/// Fingerprint row. Immutable once written; `confidence` is the value at
/// write time, never updated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FingerprintRecord {
    pub id: Uuid,
    pub visitor_id: Uuid,
    pub fingerprint_hash: String,
    pub fuzzy_hash: String,
    pub stable_hash: Option<String>,
    pub gpu_timing_hash: Option<String>,
    pub components: serde_json::Value,
    pub entropy: Option<f64>,
    pub confidence: f64,
    pub is_farbled: bool,
    pub created_at: i64,
}

/// Fields of a fingerprint row the engine supplies; the store assigns the
/// id and the write timestamp.
#[derive(Debug, Clone)]
pub struct NewFingerprint {
    pub fingerprint_hash: String,
    pub fuzzy_hash: String,
    pub stable_hash: Option<String>,
    pub gpu_timing_hash: Option<String>,
    pub components: serde_json::Value,
    pub entropy: Option<f64>,
    pub confidence: f64,
    pub is_farbled: bool,
}

/// Session row. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: Uuid,
    pub visitor_id: Uuid,
    pub fingerprint_id: Uuid,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub referer: Option<String>,
    pub tls_ja4: Option<String>,
    pub tls_ja3: Option<String>,
    pub header_order_hash: Option<String>,
    pub first_seen: i64,
    pub last_seen: i64,
}

/// The slice of a session the crowd scorer needs.
#[derive(Debug, Clone)]
pub struct SessionLite {
    pub ip_address: Option<String>,
    pub first_seen: i64,
}

/// One row of the daily rollup. `date` is a UTC calendar date.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyStatsRow {
    pub date: String,
    pub total: u64,
    pub unique_visitors: u64,
    pub exact: u64,
    pub stable: u64,
    pub gpu: u64,
    pub fuzzy_stable: u64,
    pub fuzzy: u64,
    pub new: u64,
    pub avg_entropy: f64,
}

// ===== Response (engine -> client) =====

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitorSummary {
    pub first_seen: i64,
    pub visit_count: u64,
    #[serde(default)]
    pub last_visit: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentVisit {
    pub timestamp: i64,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub browser: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEcho {
    pub timestamp: i64,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub browser: Option<String>,
}

/// Refresh hint for the signed identity. `signature` carries the full token
/// string the client should store when `should_update` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistentIdentityHint {
    pub should_update: bool,
    #[serde(default)]
    pub signature: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchResponse {
    pub visitor_id: Uuid,
    pub match_type: MatchType,
    pub confidence: f64,
    pub is_new_visitor: bool,
    pub fingerprint_id: Uuid,
    pub visitor: VisitorSummary,
    pub request: RequestEcho,
    pub recent_visits: Vec<RecentVisit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_identity: Option<PersistentIdentityHint>,
}

/// Coarse browser family from a user-agent string. Fills the response's
/// `request.browser` field when the collector did not report one; never used
/// for matching.
pub fn browser_from_user_agent(ua: &str) -> Option<&'static str> {
    // Order matters: Edge and Brave carry the Chrome token, Chrome carries
    // the Safari token.
    if ua.contains("Edg/") || ua.contains("Edge/") {
        Some("Edge")
    } else if ua.contains("Brave") {
        Some("Brave")
    } else if ua.contains("Firefox/") {
        Some("Firefox")
    } else if ua.contains("Chrome/") || ua.contains("Chromium/") {
        Some("Chrome")
    } else if ua.contains("Safari/") {
        Some("Safari")
    } else {
        None
    }
}
