//! Relevance scoring
//!
//! `score = clamp(0, 100, (base + ln(usage + 1) * 10 + success_rate * 20) * multiplier)`

use super::Strategy;

/// Confidence multiplier per strategy
pub fn strategy_multiplier(strategy: Strategy) -> f64 {
    match strategy {
        Strategy::Exact => 1.5,
        Strategy::Fts => 1.0,
        Strategy::Fuzzy => 0.8,
        Strategy::Category => 1.2,
        Strategy::Tag => 1.1,
        Strategy::Hybrid => 1.3,
    }
}

/// Final relevance in [0, 100]. Total: NaN or infinite inputs clamp too.
pub fn score(base_score: f64, usage_count: u64, success_rate: f64, strategy: Strategy) -> f64 {
    let usage_boost = (usage_count as f64 + 1.0).ln() * 10.0;
    let success_boost = success_rate.clamp(0.0, 1.0) * 20.0;
    let raw = (base_score + usage_boost + success_boost) * strategy_multiplier(strategy);
    if raw.is_nan() {
        return 0.0;
    }
    raw.clamp(0.0, 100.0)
}
