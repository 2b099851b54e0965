//! The layered matching engine.
//!
//! One entry point, [`MatchEngine::identify`]: a submission comes in, the
//! store is consulted in a fixed order of indexed and scanned lookups
//! (exact -> stable -> GPU -> fuzzy-stable -> fuzzy -> new), the crowd
//! scorer gates or boosts the confidence, exactly one fingerprint decision
//! and one session row are persisted per request, and the daily rollup and
//! visitor trust cache are refreshed off the critical path.
//!
//! Layers exist to short-circuit; their lookups are serialized within one
//! request. There is no cross-request state here beyond the store handle.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

use crowd_trust::{confidence_boost, score_sessions, should_trust, TrustResult};
use identity_token::IdentitySigner;
use visit_models::{
    hamming, is_hex64, normalize_hex64, normalize_opt_hex64, MatchResponse, MatchType, ModelError,
    NewFingerprint, PersistentIdentityHint, RecentVisit, RequestEcho, RequestMeta, Submission,
    VisitorSummary,
};
use visitor_db::{DbError, HashCandidate, TrustCacheUpdate, VisitorDb};

mod config;

pub use config::{ConfigError, EngineConfig};

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// How many recent visits the response echoes back.
const RECENT_VISITS_IN_RESPONSE: usize = 10;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid submission: {field}")]
    InvalidSubmission { field: &'static str },
    #[error("store operation exceeded its {0:?} deadline")]
    Timeout(Duration),
    #[error("store error: {0}")]
    Store(#[from] DbError),
    #[error("store worker failed")]
    StoreWorker,
}

impl From<ModelError> for EngineError {
    fn from(e: ModelError) -> Self {
        let ModelError::InvalidHex(field) = e;
        EngineError::InvalidSubmission { field }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Submission hashes after validation and normalization. GPU and stable
/// hashes that failed their gates are already `None` here.
struct NormalizedHashes {
    exact: String,
    fuzzy: String,
    stable: Option<String>,
    gpu: Option<String>,
}

/// A layer-1..5 hit before trust adjustment.
struct LayerHit {
    match_type: MatchType,
    base_confidence: f64,
    visitor_id: Uuid,
    fp_id: Uuid,
}

pub struct MatchEngine {
    db: Arc<VisitorDb>,
    signer: IdentitySigner,
    config: EngineConfig,
}

impl MatchEngine {
    pub fn new(db: Arc<VisitorDb>, config: EngineConfig) -> Self {
        let signer = IdentitySigner::new(config.server_secret.clone(), config.identity_max_age_ms);
        Self { db, signer, config }
    }

    pub fn signer(&self) -> &IdentitySigner {
        &self.signer
    }

    /// Run one store operation on the blocking pool under the per-operation
    /// deadline. Expiry is surfaced as [`EngineError::Timeout`], no retry.
    async fn with_store<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&VisitorDb) -> visitor_db::Result<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        let task = tokio::task::spawn_blocking(move || op(&db));
        match tokio::time::timeout(self.config.store_op_timeout, task).await {
            Ok(Ok(result)) => result.map_err(EngineError::from),
            Ok(Err(join_err)) => {
                tracing::error!("store worker panicked or was cancelled: {join_err}");
                Err(EngineError::StoreWorker)
            }
            Err(_) => Err(EngineError::Timeout(self.config.store_op_timeout)),
        }
    }

    /// Identify one submission: classify, persist, respond.
    pub async fn identify(&self, submission: Submission, meta: RequestMeta) -> Result<MatchResponse> {
        let hashes = self.validate(&submission)?;

        // A valid, non-expired token names the authoritative visitor for
        // this request; invalid or expired tokens are treated as absent.
        let token = submission
            .persistent_id
            .as_deref()
            .map(|t| self.signer.validate(t))
            .unwrap_or_default();
        let token_visitor = token.visitor_id;

        let hit = self.run_layers(&hashes).await?;

        let (match_type, visitor_id, fp_id, confidence) = match hit {
            Some(hit) => {
                let visitor_id = token_visitor.unwrap_or(hit.visitor_id);
                let trust = self.trust_for(&visitor_id).await?;
                let confidence = adjusted_confidence(&trust, hit.match_type, hit.base_confidence);

                let fp_id = if hit.match_type == MatchType::Exact
                    && token_visitor.map_or(true, |v| v == hit.visitor_id)
                {
                    // Exact repeat of a known row: reuse it, session only.
                    self.with_store({
                        let (v, f, m) = (visitor_id, hit.fp_id, meta.clone());
                        move |db| db.record_visit_existing_fp(&v, &f, &m)
                    })
                    .await?;
                    hit.fp_id
                } else {
                    // Layers 2-5, or an exact hit re-homed onto the token's
                    // visitor: a fresh row is written under the chosen
                    // visitor so sessions never cross visitor boundaries.
                    let record = new_fingerprint(&submission, &hashes, confidence);
                    if token_visitor.is_some() {
                        // The token may re-introduce an id with no row.
                        let (_, fp_id, _) = self
                            .with_store({
                                let (v, m) = (visitor_id, meta.clone());
                                move |db| db.record_visit_new_visitor(Some(v), &record, &m)
                            })
                            .await?;
                        fp_id
                    } else {
                        let (fp_id, _) = self
                            .with_store({
                                let (v, m) = (visitor_id, meta.clone());
                                move |db| db.record_visit_new_fp(&v, &record, &m)
                            })
                            .await?;
                        fp_id
                    }
                };
                (hit.match_type, visitor_id, fp_id, confidence)
            }
            None => {
                // New terminal. A valid token suppresses visitor creation
                // by re-introducing its id.
                let record = new_fingerprint(&submission, &hashes, 1.0);
                let (visitor_id, fp_id, _) = self
                    .with_store({
                        let m = meta.clone();
                        move |db| db.record_visit_new_visitor(token_visitor, &record, &m)
                    })
                    .await?;
                (MatchType::New, visitor_id, fp_id, 1.0)
            }
        };

        let is_new_visitor = match_type == MatchType::New && token_visitor.is_none();

        self.spawn_side_effects(visitor_id, match_type, submission.entropy);

        let response = self
            .build_response(
                &submission,
                &meta,
                match_type,
                visitor_id,
                fp_id,
                confidence,
                is_new_visitor,
                &token,
            )
            .await?;
        Ok(response)
    }

    /// Pre-validation: required hashes must be 64 hex chars; the GPU hash
    /// only survives when its validity metadata clears the throttle gate.
    fn validate(&self, submission: &Submission) -> Result<NormalizedHashes> {
        let exact = normalize_hex64("fingerprint", &submission.fingerprint)?;
        let fuzzy = normalize_hex64("fuzzyHash", &submission.fuzzy_hash)?;
        let stable = normalize_opt_hex64("stableHash", submission.stable_hash.as_deref())?;

        let gpu_usable = submission
            .gpu_timing
            .map(|m| m.supported && m.gpu_score > self.config.gpu_score_min)
            .unwrap_or(false);
        let gpu = if gpu_usable {
            submission
                .gpu_timing_hash
                .as_deref()
                .map(str::to_ascii_lowercase)
                .filter(|h| is_hex64(h))
        } else {
            None
        };

        Ok(NormalizedHashes {
            exact,
            fuzzy,
            stable,
            gpu,
        })
    }

    /// Evaluate the layers strictly in order; first hit wins.
    async fn run_layers(&self, hashes: &NormalizedHashes) -> Result<Option<LayerHit>> {
        // 1. Exact.
        let exact = hashes.exact.clone();
        if let Some(row) = self.with_store(move |db| db.find_fp_by_exact_hash(&exact)).await? {
            return Ok(Some(LayerHit {
                match_type: MatchType::Exact,
                base_confidence: 1.0,
                visitor_id: row.visitor_id,
                fp_id: row.id,
            }));
        }

        // 2. Stable: cross-browser recognition on the hardware digest.
        if let Some(stable) = hashes.stable.clone() {
            if let Some(row) = self
                .with_store(move |db| db.find_fp_by_stable_hash(&stable))
                .await?
            {
                return Ok(Some(LayerHit {
                    match_type: MatchType::Stable,
                    base_confidence: 0.95,
                    visitor_id: row.visitor_id,
                    fp_id: row.id,
                }));
            }
        }

        // 3. GPU timing.
        if let Some(gpu) = hashes.gpu.clone() {
            if let Some(row) = self
                .with_store(move |db| db.find_fp_by_gpu_timing_hash(&gpu))
                .await?
            {
                return Ok(Some(LayerHit {
                    match_type: MatchType::Gpu,
                    base_confidence: 0.92,
                    visitor_id: row.visitor_id,
                    fp_id: row.id,
                }));
            }
        }

        // 4. Fuzzy-stable: windowed scan over recent stable hashes.
        if let Some(stable) = hashes.stable.as_deref() {
            let limit = self.config.stable_scan_limit;
            let candidates = self
                .with_store(move |db| db.scan_recent_stable_hashes(limit))
                .await?;
            if let Some((d, cand)) =
                closest_candidate(&candidates, stable, self.config.stable_fuzzy_threshold)
            {
                return Ok(Some(LayerHit {
                    match_type: MatchType::FuzzyStable,
                    base_confidence: 1.0 - d as f64 / 64.0,
                    visitor_id: cand.visitor_id,
                    fp_id: cand.fp_id,
                }));
            }
        }

        // 5. Fuzzy: browser-specific drift on the binned digest.
        let limit = self.config.fuzzy_scan_limit;
        let candidates = self
            .with_store(move |db| db.scan_recent_fuzzy_hashes(limit))
            .await?;
        if let Some((d, cand)) =
            closest_candidate(&candidates, &hashes.fuzzy, self.config.fuzzy_threshold)
        {
            return Ok(Some(LayerHit {
                match_type: MatchType::Fuzzy,
                base_confidence: 1.0 - d as f64 / 64.0,
                visitor_id: cand.visitor_id,
                fp_id: cand.fp_id,
            }));
        }

        Ok(None)
    }

    /// Crowd score over the visitor's sessions inside the trust window.
    async fn trust_for(&self, visitor_id: &Uuid) -> Result<TrustResult> {
        let since = Utc::now().timestamp_millis() - self.config.trust_window_days * DAY_MS;
        let vid = *visitor_id;
        let sessions = self
            .with_store(move |db| db.recent_sessions(&vid, since))
            .await?;
        Ok(score_sessions(&sessions))
    }

    /// Daily-stats upsert and trust-cache refresh, off the critical path.
    /// Failures are logged with context and swallowed; they never fail the
    /// request.
    fn spawn_side_effects(&self, visitor_id: Uuid, match_type: MatchType, entropy: Option<f64>) {
        let db = Arc::clone(&self.db);
        let trust_window_days = self.config.trust_window_days;
        tokio::task::spawn_blocking(move || {
            let date = Utc::now().format("%Y-%m-%d").to_string();
            if let Err(e) = db.upsert_daily_stats(&date, match_type, entropy) {
                tracing::warn!(
                    %visitor_id,
                    %date,
                    stage = "daily_stats",
                    "rollup update failed: {e}"
                );
            }

            let since = Utc::now().timestamp_millis() - trust_window_days * DAY_MS;
            let refreshed = db.recent_sessions(&visitor_id, since).map(|sessions| {
                let trust = score_sessions(&sessions);
                db.update_visitor_trust(
                    &visitor_id,
                    &TrustCacheUpdate {
                        trust_level: trust.trust_level,
                        crowd_score: trust.score,
                        unique_ips: trust.unique_ips,
                        visit_count: trust.visit_count,
                        last_score_update: Utc::now().timestamp_millis(),
                    },
                )
            });
            if let Err(e) = refreshed.and_then(|r| r) {
                tracing::warn!(
                    %visitor_id,
                    stage = "trust_cache",
                    "trust cache update failed: {e}"
                );
            }
        });
    }

    #[allow(clippy::too_many_arguments)]
    async fn build_response(
        &self,
        submission: &Submission,
        meta: &RequestMeta,
        match_type: MatchType,
        visitor_id: Uuid,
        fp_id: Uuid,
        confidence: f64,
        is_new_visitor: bool,
        token: &identity_token::TokenValidation,
    ) -> Result<MatchResponse> {
        let vid = visitor_id;
        let view = self
            .with_store(move |db| db.visitor_with_recent(&vid, RECENT_VISITS_IN_RESPONSE))
            .await?
            .ok_or(DbError::UnknownVisitor(visitor_id))?;

        let browser = submission.detected_browser.clone().or_else(|| {
            meta.user_agent
                .as_deref()
                .and_then(visit_models::browser_from_user_agent)
                .map(str::to_string)
        });

        let recent_visits = view
            .recent
            .iter()
            .map(|s| RecentVisit {
                timestamp: s.first_seen,
                ip_address: s.ip_address.clone(),
                browser: s
                    .user_agent
                    .as_deref()
                    .and_then(visit_models::browser_from_user_agent)
                    .map(str::to_string),
            })
            .collect();

        let persistent_identity = if token.valid {
            Some(PersistentIdentityHint {
                should_update: token.needs_refresh,
                signature: token.refreshed_token.clone(),
            })
        } else {
            // No usable token came in: offer a freshly signed one so the
            // client converges onto the signed path.
            Some(PersistentIdentityHint {
                should_update: true,
                signature: Some(self.signer.sign(&visitor_id)),
            })
        };

        Ok(MatchResponse {
            visitor_id,
            match_type,
            confidence,
            is_new_visitor,
            fingerprint_id: fp_id,
            visitor: VisitorSummary {
                first_seen: view.visitor.created_at,
                visit_count: view.visit_count,
                last_visit: view.last_visit,
            },
            request: RequestEcho {
                timestamp: Utc::now().timestamp_millis(),
                ip_address: meta.ip_address.clone(),
                browser,
            },
            recent_visits,
            persistent_identity,
        })
    }
}

/// Minimum-distance candidate within the threshold. The scan is already
/// recency-ordered, so keeping the first minimum breaks distance ties in
/// favor of the most recently created row. Candidates with a mismatched
/// hash length are skipped.
fn closest_candidate<'a>(
    candidates: &'a [HashCandidate],
    needle: &str,
    max_distance: usize,
) -> Option<(usize, &'a HashCandidate)> {
    let mut best: Option<(usize, &HashCandidate)> = None;
    for cand in candidates {
        let d = match hamming(needle, &cand.hash) {
            Ok(d) => d,
            Err(_) => {
                tracing::debug!(fp_id = %cand.fp_id, "skipping candidate with mismatched hash length");
                continue;
            }
        };
        if d > max_distance {
            continue;
        }
        if best.map_or(true, |(bd, _)| d < bd) {
            best = Some((d, cand));
        }
        if d == 0 {
            break;
        }
    }
    best
}

/// Trust gate and boost over a layer's base confidence, to 3 decimals.
fn adjusted_confidence(trust: &TrustResult, match_type: MatchType, base: f64) -> f64 {
    let adjusted = if should_trust(trust, match_type) {
        (base + confidence_boost(trust, match_type)).min(1.0)
    } else {
        0.7 * base
    };
    round3(adjusted)
}

fn round3(x: f64) -> f64 {
    (x * 1000.0).round() / 1000.0
}

fn new_fingerprint(
    submission: &Submission,
    hashes: &NormalizedHashes,
    confidence: f64,
) -> NewFingerprint {
    NewFingerprint {
        fingerprint_hash: hashes.exact.clone(),
        fuzzy_hash: hashes.fuzzy.clone(),
        stable_hash: hashes.stable.clone(),
        gpu_timing_hash: hashes.gpu.clone(),
        components: submission.components.clone(),
        entropy: submission.entropy,
        confidence,
        is_farbled: submission.is_farbled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(hash: &str) -> HashCandidate {
        HashCandidate {
            fp_id: Uuid::new_v4(),
            visitor_id: Uuid::new_v4(),
            hash: hash.to_string(),
        }
    }

    #[test]
    fn closest_candidate_picks_min_distance_then_recency() {
        let a = candidate(&format!("{}bb", "a".repeat(62))); // d=2
        let b = candidate(&format!("{}b", "a".repeat(63))); // d=1
        let c = candidate(&format!("{}b", "a".repeat(63))); // d=1, older
        let needle = "a".repeat(64);
        let candidates = [a, b.clone(), c];
        let picked = closest_candidate(&candidates, &needle, 8).expect("hit");
        assert_eq!(picked.0, 1);
        // First minimum wins: `b` precedes `c` in the recency-ordered scan.
        assert_eq!(picked.1.fp_id, b.fp_id);
    }

    #[test]
    fn closest_candidate_respects_threshold_and_skips_corrupt_rows() {
        let too_far = candidate(&format!("{}{}", "b".repeat(9), "a".repeat(55))); // d=9
        let corrupt = candidate("ab"); // wrong width
        let needle = "a".repeat(64);
        assert!(closest_candidate(&[too_far, corrupt], &needle, 8).is_none());
    }

    #[test]
    fn gate_failure_multiplies_base_by_point_seven() {
        let distrusted = TrustResult {
            visit_count: 9,
            score: 0.1,
            ..TrustResult::empty()
        };
        let c = adjusted_confidence(&distrusted, MatchType::Fuzzy, 0.9219);
        assert!((c - round3(0.7 * 0.9219)).abs() < 1e-9);
    }

    #[test]
    fn boost_is_clamped_to_one() {
        let trusted = TrustResult {
            score: 1.0,
            visit_count: 3,
            unique_ips: 2,
            ..TrustResult::empty()
        };
        assert_eq!(adjusted_confidence(&trusted, MatchType::Exact, 1.0), 1.0);
        // Stable 0.95 + 0.10*1.0 = 1.05 clamps.
        assert_eq!(adjusted_confidence(&trusted, MatchType::Stable, 0.95), 1.0);
    }
}
