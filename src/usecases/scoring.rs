//! Declarative score composition.
//!
//! Each rule document carries `outputs.score` with a base value and a
//! weight per metric name. The predicate supplies the metrics; the score
//! is the weighted sum clamped to [0, 100]. This is the back-compat rank;
//! `edge_score` is the primary ordering key.

use std::collections::HashMap;

use crate::domain::rule::ScoreSpec;

/// `base + Σ weight · metric`, clamped to [0, 100], rounded to 2 dp.
pub fn compute_score(spec: &ScoreSpec, metrics: &HashMap<&'static str, f64>) -> f64 {
    let mut score = spec.base;
    for (key, weight) in &spec.weights {
        let value = metrics.get(key.as_str()).copied().unwrap_or(0.0);
        score += weight * value;
    }
    (score.clamp(0.0, 100.0) * 100.0).round() / 100.0
}
