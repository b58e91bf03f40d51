// src/core/quality.rs — Stop/continue decision over reviewer feedback

use super::types::Feedback;

/// Decide whether a draft is good enough to stop iterating.
///
/// Rule order is load-bearing: a score above 0.9 passes even when the
/// reviewer attached more than five suggestions.
pub fn meets_criteria(feedback: &Feedback) -> (bool, &'static str) {
    if feedback.score > 0.9 {
        return (true, "high quality score");
    }
    if feedback.score > 0.8 && feedback.suggestions.len() <= 1 {
        return (true, "good quality, minimal suggestions");
    }
    if feedback.suggestions.len() > 5 {
        return (false, "too many improvement suggestions");
    }
    (false, "quality threshold not met")
}
