//! Crowd-blending trust scorer.
//!
//! Derives a per-visitor trust score in [0, 1] from recent session history:
//! visit volume, IP diversity and temporal spread. The score gates weak
//! match types and boosts confidence on corroborated ones. The scorer is
//! read-only; callers cut the history window (store query) and cache the
//! result on the visitor row.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use visit_models::{MatchType, SessionLite, TrustLevel};

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustResult {
    pub score: f64,
    pub unique_ips: u32,
    pub visit_count: u32,
    pub day_span: u32,
    pub is_trusted: bool,
    pub trust_level: TrustLevel,
}

impl TrustResult {
    pub fn empty() -> Self {
        Self {
            score: 0.0,
            unique_ips: 0,
            visit_count: 0,
            day_span: 0,
            is_trusted: false,
            trust_level: TrustLevel::New,
        }
    }
}

/// Score a visitor's recent sessions (already cut to the trust window).
pub fn score_sessions(sessions: &[SessionLite]) -> TrustResult {
    if sessions.is_empty() {
        return TrustResult::empty();
    }

    let visits = sessions.len() as u32;
    let unique_ips = sessions
        .iter()
        .filter_map(|s| s.ip_address.as_deref())
        .collect::<HashSet<_>>()
        .len() as u32;

    let earliest = sessions.iter().map(|s| s.first_seen).min().unwrap_or(0);
    let latest = sessions.iter().map(|s| s.first_seen).max().unwrap_or(0);
    let span_ms = (latest - earliest).max(0);
    let day_span = ((span_ms + DAY_MS - 1) / DAY_MS) as u32;

    let visit_factor = match visits {
        v if v >= 10 => 0.4,
        v if v >= 5 => 0.3,
        v if v >= 3 => 0.2,
        v if v >= 2 => 0.1,
        _ => 0.0,
    };
    let ip_factor = match unique_ips {
        n if n >= 3 => 0.4,
        n if n >= 2 => 0.3,
        // A single IP only counts once there is enough volume behind it.
        1 if visits >= 3 => 0.1,
        _ => 0.0,
    };
    let time_factor = match day_span {
        d if d >= 5 => 0.2,
        d if d >= 3 => 0.15,
        d if d >= 1 => 0.1,
        _ => 0.0,
    };

    let score = round2(visit_factor + ip_factor + time_factor);
    let is_trusted = visits >= 3 && unique_ips >= 2;
    let trust_level = if score >= 0.7 {
        TrustLevel::Verified
    } else if is_trusted {
        TrustLevel::Trusted
    } else if visits >= 2 {
        TrustLevel::Returning
    } else {
        TrustLevel::New
    };

    TrustResult {
        score,
        unique_ips,
        visit_count: visits,
        day_span,
        is_trusted,
        trust_level,
    }
}

/// Gate decision per match type.
///
/// Hardware-grade layers and the trivially-true `new` terminal always pass.
/// A fuzzy match is suspect only when the visitor has accumulated enough
/// history that we should have seen IP diversity by now.
pub fn should_trust(result: &TrustResult, match_type: MatchType) -> bool {
    match match_type {
        MatchType::Exact
        | MatchType::Stable
        | MatchType::Gpu
        | MatchType::FuzzyStable
        | MatchType::New => true,
        MatchType::Fuzzy => result.visit_count <= 5 || result.score >= 0.2,
    }
}

/// Confidence boost per match type. Weaker signals benefit most from
/// corroborating history.
pub fn confidence_boost(result: &TrustResult, match_type: MatchType) -> f64 {
    let factor = match match_type {
        MatchType::New => 0.0,
        MatchType::Exact => 0.05,
        MatchType::Stable => 0.10,
        MatchType::Gpu => 0.08,
        MatchType::FuzzyStable => 0.15,
        MatchType::Fuzzy => 0.20,
    };
    factor * result.score
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}
