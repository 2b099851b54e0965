use std::sync::Arc;
use std::time::Duration;

use match_engine::{EngineConfig, EngineError, MatchEngine};
use serde_json::json;
use visit_models::{GpuTimingMeta, MatchType, RequestMeta, Submission};
use visitor_db::VisitorDb;

fn engine() -> (MatchEngine, Arc<VisitorDb>) {
    let db = Arc::new(VisitorDb::open_in_memory().expect("open"));
    let engine = MatchEngine::new(Arc::clone(&db), EngineConfig::with_secret(b"test-secret".to_vec()));
    (engine, db)
}

fn submission(exact: &str, fuzzy: &str, stable: Option<&str>) -> Submission {
    Submission {
        fingerprint: exact.to_string(),
        fuzzy_hash: fuzzy.to_string(),
        stable_hash: stable.map(str::to_string),
        gpu_timing_hash: None,
        gpu_timing: None,
        components: json!({"canvas": {"winding": true}}),
        entropy: Some(19.5),
        detected_browser: Some("Chrome".to_string()),
        persistent_id: None,
        is_farbled: false,
        timestamp: None,
    }
}

fn meta(ip: &str) -> RequestMeta {
    RequestMeta {
        ip_address: Some(ip.to_string()),
        user_agent: Some("Mozilla/5.0 Chrome/120.0 Safari/537.36".to_string()),
        ..RequestMeta::default()
    }
}

/// Change the first `k` characters of a 64-char hash to a different hex digit.
fn drift(hash: &str, k: usize) -> String {
    let mut chars: Vec<char> = hash.chars().collect();
    for c in chars.iter_mut().take(k) {
        *c = if *c == 'f' { '0' } else { 'f' };
    }
    chars.into_iter().collect()
}

/// The rollup is written off the critical path; poll it briefly.
async fn wait_for_daily(db: &VisitorDb, check: impl Fn(&visit_models::DailyStatsRow) -> bool) {
    for _ in 0..100 {
        if let Some(row) = db.daily_stats(1).expect("stats").into_iter().next() {
            if check(&row) {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("daily stats never reached the expected state");
}

#[tokio::test(flavor = "multi_thread")]
async fn first_visit_creates_visitor_fingerprint_session_and_stats() {
    let (engine, db) = engine();
    let sub = submission(&"a".repeat(64), &"b".repeat(64), Some(&"c".repeat(64)));

    let res = engine.identify(sub, meta("10.0.0.1")).await.expect("identify");

    assert_eq!(res.match_type, MatchType::New);
    assert!(res.is_new_visitor);
    assert_eq!(res.confidence, 1.0);
    assert_eq!(res.visitor.visit_count, 1);
    assert_eq!(res.recent_visits.len(), 1);
    assert_eq!(res.recent_visits[0].ip_address.as_deref(), Some("10.0.0.1"));

    // A fresh token is offered to a client that arrived without one.
    let hint = res.persistent_identity.expect("identity hint");
    assert!(hint.should_update);
    let token = hint.signature.expect("fresh token");
    assert_eq!(
        identity_token::parse(&token).expect("token parses").visitor_id,
        res.visitor_id
    );

    let fp = db
        .get_fingerprint(&res.fingerprint_id)
        .expect("lookup")
        .expect("fingerprint persisted");
    assert_eq!(fp.visitor_id, res.visitor_id);
    assert_eq!(fp.confidence, 1.0);

    wait_for_daily(&db, |row| row.total == 1 && row.new == 1 && row.unique_visitors == 1).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn exact_repeat_is_idempotent_and_reuses_the_row() {
    let (engine, db) = engine();
    let sub = submission(&"a".repeat(64), &"b".repeat(64), Some(&"c".repeat(64)));

    let first = engine.identify(sub.clone(), meta("10.0.0.1")).await.expect("first");
    let second = engine.identify(sub, meta("10.0.0.1")).await.expect("second");

    assert_eq!(second.match_type, MatchType::Exact);
    assert_eq!(second.visitor_id, first.visitor_id);
    assert!(!second.is_new_visitor);
    // Base 1.0; any trust boost clamps back to 1.0.
    assert_eq!(second.confidence, 1.0);
    // Layer 1 reuses the existing fingerprint row.
    assert_eq!(second.fingerprint_id, first.fingerprint_id);
    // Exactly one session per request.
    assert_eq!(second.visitor.visit_count, 2);

    wait_for_daily(&db, |row| row.total == 2 && row.exact == 1 && row.new == 1).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn same_stable_hash_links_across_browsers() {
    let (engine, _db) = engine();
    let chrome = submission(&"a".repeat(64), &"b".repeat(64), Some(&"c".repeat(64)));
    let first = engine.identify(chrome, meta("10.0.0.1")).await.expect("first");

    // Different exact and fuzzy hashes, same hardware digest.
    let firefox = submission(&"d".repeat(64), &"e".repeat(64), Some(&"c".repeat(64)));
    let second = engine.identify(firefox, meta("10.0.0.1")).await.expect("second");

    assert_eq!(second.match_type, MatchType::Stable);
    assert_eq!(second.visitor_id, first.visitor_id);
    assert!(!second.is_new_visitor);
    // Base 0.95; a single prior visit carries no crowd signal, so no boost.
    assert!((second.confidence - 0.95).abs() < 1e-9);
    // A new fingerprint row is written under the matched visitor.
    assert_ne!(second.fingerprint_id, first.fingerprint_id);
}

#[tokio::test(flavor = "multi_thread")]
async fn fuzzy_drift_within_threshold_matches() {
    let (engine, _db) = engine();
    let seeded = submission(&"a".repeat(64), &"b".repeat(64), None);
    let first = engine.identify(seeded, meta("10.0.0.1")).await.expect("seed");

    // Novel exact hash, fuzzy hash five positions off, no stable/GPU.
    let drifted = submission(&"9".repeat(64), &drift(&"b".repeat(64), 5), None);
    let second = engine.identify(drifted, meta("10.0.0.2")).await.expect("drift");

    assert_eq!(second.match_type, MatchType::Fuzzy);
    assert_eq!(second.visitor_id, first.visitor_id);
    // 1 - 5/64 = 0.921875, rounded to 3 decimals; single prior visit
    // passes the gate with no boost.
    assert!((second.confidence - 0.922).abs() < 1e-9);
}

#[tokio::test(flavor = "multi_thread")]
async fn fuzzy_drift_of_exactly_eight_matches() {
    let (engine, _db) = engine();
    let seeded = submission(&"a".repeat(64), &"b".repeat(64), None);
    let first = engine.identify(seeded, meta("10.0.0.1")).await.expect("seed");

    let at_limit = submission(&"8".repeat(64), &drift(&"b".repeat(64), 8), None);
    let hit = engine.identify(at_limit, meta("10.0.0.2")).await.expect("at limit");
    assert_eq!(hit.match_type, MatchType::Fuzzy);
    assert_eq!(hit.visitor_id, first.visitor_id);
}

#[tokio::test(flavor = "multi_thread")]
async fn fuzzy_drift_of_nine_creates_a_new_visitor() {
    let (engine, _db) = engine();
    let seeded = submission(&"a".repeat(64), &"b".repeat(64), None);
    let first = engine.identify(seeded, meta("10.0.0.1")).await.expect("seed");

    let over = submission(&"9".repeat(64), &drift(&"b".repeat(64), 9), None);
    let miss = engine.identify(over, meta("10.0.0.3")).await.expect("over limit");
    assert_eq!(miss.match_type, MatchType::New);
    assert_ne!(miss.visitor_id, first.visitor_id);
    assert!(miss.is_new_visitor);
}

#[tokio::test(flavor = "multi_thread")]
async fn gpu_timing_links_only_when_signal_is_healthy() {
    let (engine, _db) = engine();

    let mut seeded = submission(&"a".repeat(64), &"b".repeat(64), None);
    seeded.gpu_timing_hash = Some("1".repeat(64));
    seeded.gpu_timing = Some(GpuTimingMeta {
        supported: true,
        gpu_score: 0.5,
    });
    let first = engine.identify(seeded, meta("10.0.0.1")).await.expect("seed");

    // Everything novel except the GPU timing digest.
    let mut linked = submission(&"2".repeat(64), &"3".repeat(64), None);
    linked.gpu_timing_hash = Some("1".repeat(64));
    linked.gpu_timing = Some(GpuTimingMeta {
        supported: true,
        gpu_score: 0.5,
    });
    let second = engine.identify(linked, meta("10.0.0.2")).await.expect("link");
    assert_eq!(second.match_type, MatchType::Gpu);
    assert_eq!(second.visitor_id, first.visitor_id);
    assert!((second.confidence - 0.92).abs() < 1e-9);

    // A throttled score collapses the signal; the request falls through to
    // the new terminal.
    let mut throttled = submission(&"4".repeat(64), &"5".repeat(64), None);
    throttled.gpu_timing_hash = Some("1".repeat(64));
    throttled.gpu_timing = Some(GpuTimingMeta {
        supported: true,
        gpu_score: 0.05,
    });
    let third = engine.identify(throttled, meta("10.0.0.3")).await.expect("throttled");
    assert_eq!(third.match_type, MatchType::New);
    assert_ne!(third.visitor_id, first.visitor_id);
}

#[tokio::test(flavor = "multi_thread")]
async fn valid_token_overrides_visitor_assignment() {
    let (engine, _db) = engine();
    let first = engine
        .identify(
            submission(&"a".repeat(64), &"b".repeat(64), None),
            meta("10.0.0.1"),
        )
        .await
        .expect("first");
    let token = first
        .persistent_identity
        .and_then(|h| h.signature)
        .expect("fresh token");

    // Completely unrelated hashes, but the signed token names the visitor.
    let mut returning = submission(&"7".repeat(64), &"8".repeat(64), None);
    returning.persistent_id = Some(token);
    let second = engine.identify(returning, meta("10.0.0.9")).await.expect("second");

    assert_eq!(second.match_type, MatchType::New);
    assert_eq!(second.visitor_id, first.visitor_id);
    // The identity precedes the request: not a new visitor.
    assert!(!second.is_new_visitor);
    assert_eq!(second.visitor.visit_count, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn garbage_token_is_treated_as_absent() {
    let (engine, _db) = engine();
    let mut sub = submission(&"a".repeat(64), &"b".repeat(64), None);
    sub.persistent_id = Some("not.a-valid.token".to_string());
    let res = engine.identify(sub, meta("10.0.0.1")).await.expect("identify");
    assert_eq!(res.match_type, MatchType::New);
    assert!(res.is_new_visitor);
    // And a replacement token is offered.
    assert!(res.persistent_identity.expect("hint").should_update);
}

#[tokio::test(flavor = "multi_thread")]
async fn aging_token_gets_refreshed() {
    let (engine, _db) = engine();
    let first = engine
        .identify(
            submission(&"a".repeat(64), &"b".repeat(64), None),
            meta("10.0.0.1"),
        )
        .await
        .expect("first");

    // Re-sign the visitor id with a stamp deep past half the max age.
    let old_ms = chrono::Utc::now().timestamp_millis() - 200 * 24 * 60 * 60 * 1000;
    let stale = engine.signer().sign_at(&first.visitor_id, old_ms);

    let mut sub = submission(&"a".repeat(64), &"b".repeat(64), None);
    sub.persistent_id = Some(stale);
    let res = engine.identify(sub, meta("10.0.0.1")).await.expect("identify");

    assert_eq!(res.visitor_id, first.visitor_id);
    let hint = res.persistent_identity.expect("hint");
    assert!(hint.should_update);
    let refreshed = hint.signature.expect("refreshed token");
    let parsed = identity_token::parse(&refreshed).expect("parses");
    assert_eq!(parsed.visitor_id, first.visitor_id);
    assert!(parsed.created_at_ms > old_ms);
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_hashes_are_rejected_with_the_field_name() {
    let (engine, _db) = engine();

    let short = submission("abc", &"b".repeat(64), None);
    let err = engine.identify(short, meta("10.0.0.1")).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidSubmission { field: "fingerprint" }
    ));

    let bad_stable = submission(&"a".repeat(64), &"b".repeat(64), Some("zz"));
    let err = engine.identify(bad_stable, meta("10.0.0.1")).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidSubmission { field: "stableHash" }
    ));

    let non_hex = submission(&"g".repeat(64), &"b".repeat(64), None);
    let err = engine.identify(non_hex, meta("10.0.0.1")).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidSubmission { field: "fingerprint" }
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_stable_hash_never_matches() {
    let (engine, _db) = engine();
    let mut seeded = submission(&"a".repeat(64), &"b".repeat(64), None);
    seeded.stable_hash = Some(String::new());
    let first = engine.identify(seeded, meta("10.0.0.1")).await.expect("seed");

    let mut probe = submission(&"c".repeat(64), &drift(&"b".repeat(64), 20), None);
    probe.stable_hash = Some(String::new());
    let second = engine.identify(probe, meta("10.0.0.2")).await.expect("probe");

    // Two unreliable stable hashes must not link the visitors.
    assert_eq!(second.match_type, MatchType::New);
    assert_ne!(second.visitor_id, first.visitor_id);
}

#[tokio::test(flavor = "multi_thread")]
async fn trust_cache_lands_on_the_visitor_row() {
    let (engine, db) = engine();
    let sub = submission(&"a".repeat(64), &"b".repeat(64), None);
    let first = engine.identify(sub.clone(), meta("10.0.0.1")).await.expect("first");
    engine.identify(sub.clone(), meta("10.0.0.2")).await.expect("second");
    engine.identify(sub, meta("10.0.0.3")).await.expect("third");

    // The spawned refresh is eventually consistent.
    for _ in 0..100 {
        let v = db.get_visitor(&first.visitor_id).expect("get").expect("row");
        if v.visit_count == 3 {
            assert_eq!(v.unique_ips, 3);
            assert!(v.crowd_score > 0.0);
            assert!(v.last_score_update.is_some());
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("trust cache never reflected the three visits");
}
