// src/core/feedback.rs — Parse reviewer replies into structured Feedback
//
// Reviewers are asked for a bare JSON object but routinely wrap it in
// Markdown fences or surrounding prose. Parsing is forgiving about the
// wrapping and strict about the payload: a score outside [0, 1] is a
// parse error, not a silently clamped value.

use super::types::Feedback;
use crate::infra::errors::RedraftError;

pub fn parse_feedback(raw: &str) -> Result<Feedback, RedraftError> {
    let candidate = extract_json(raw);
    let feedback: Feedback = serde_json::from_str(candidate)
        .map_err(|e| RedraftError::FeedbackParse(e.to_string()))?;

    if !(0.0..=1.0).contains(&feedback.score) {
        return Err(RedraftError::FeedbackParse(format!(
            "score {} out of range [0, 1]",
            feedback.score
        )));
    }

    Ok(feedback)
}

/// Strip Markdown fences and surrounding prose down to the outermost
/// JSON object.
fn extract_json(raw: &str) -> &str {
    let trimmed = raw.trim();

    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed);

    match (unfenced.find('{'), unfenced.rfind('}')) {
        (Some(start), Some(end)) if start < end => &unfenced[start..=end],
        _ => unfenced,
    }
}
