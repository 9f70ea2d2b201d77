//! Rule-Based Local Responder
//!
//! The terminal fallback of every chain. It never leaves the process and
//! builds its answer from the query and the assembled context alone, so it
//! cannot fail on any input.

use async_trait::async_trait;

use super::traits::{Answer, AnswerBackend, AnswerRequest};
use crate::error::BackendError;

/// Reserved backend id of the local responder
pub const LOCAL_BACKEND_ID: &str = "local";

/// Context keywords and the summary line each topic contributes
const TOPICS: &[(&[&str], &str)] = &[
    (
        &["omx", "finansiell", "financial"],
        "- Financial data from OMX Stockholm shows current exchange activity.",
    ),
    (
        &["scb", "statistik", "statistics"],
        "- Statistics from SCB give official Swedish figures.",
    ),
    (
        &["smhi", "väder", "weather"],
        "- Weather data from SMHI gives forecasts for Sweden.",
    ),
    (&["nyheter", "news"], "- Current news from Swedish media."),
];

/// Terminal fallback answering without external calls
#[derive(Clone, Debug, Default)]
pub struct LocalResponder;

impl LocalResponder {
    /// Create the responder
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Build the rule-based answer text
    ///
    /// Known topics mentioned in the context get a summary line; other
    /// context sections are listed by name.
    #[must_use]
    pub fn compose(query: &str, context: Option<&str>) -> String {
        let context = context.unwrap_or_default();
        let mut lines = vec![format!(
            "Based on your question '{query}' and the available sources:"
        )];

        let lowered = context.to_lowercase();
        let topics: Vec<&str> = TOPICS
            .iter()
            .filter(|(keywords, _)| keywords.iter().any(|k| lowered.contains(k)))
            .map(|(_, line)| *line)
            .collect();
        let sections: Vec<&str> = context.lines().filter_map(section_name).collect();

        if !topics.is_empty() {
            lines.extend(topics.into_iter().map(str::to_string));
        } else if !sections.is_empty() {
            for section in sections {
                lines.push(format!("- Data from {section} is available."));
            }
        } else {
            lines.push("- No source data was available for this question.".to_string());
        }

        lines.push(String::new());
        lines.push("NOTE: This is a local rule-based answer.".to_string());
        lines.push(
            "For a detailed analysis, retry when an external answer backend is available."
                .to_string(),
        );
        lines.join("\n")
    }
}

/// Extract `NAME` from a `=== NAME ===` context header
fn section_name(line: &str) -> Option<&str> {
    let name = line
        .trim()
        .strip_prefix("===")?
        .strip_suffix("===")?
        .trim();
    // Headers may carry a "(cached)" marker
    let name = name.strip_suffix("(cached)").map_or(name, str::trim);
    (!name.is_empty()).then_some(name)
}

#[async_trait]
impl AnswerBackend for LocalResponder {
    fn id(&self) -> &str {
        LOCAL_BACKEND_ID
    }

    async fn generate(&self, request: &AnswerRequest) -> Result<Answer, BackendError> {
        tracing::debug!(request_id = %request.request_id, "Using local rule-based responder");

        let text = Self::compose(&request.query, request.context.as_deref());
        // ~4 characters per token
        let tokens_used = u32::try_from(text.chars().count() / 4).unwrap_or(u32::MAX);

        Ok(Answer {
            text,
            model: Some(LOCAL_BACKEND_ID.to_string()),
            tokens_used: Some(tokens_used),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_answers_from_context_sections() {
        let responder = LocalResponder::new();
        let request = AnswerRequest::new("how is the market")
            .with_context("\n=== OMX ===\nindex 2400\n\n=== NEWS (cached) ===\n- headline");

        let answer = responder.generate(&request).await.unwrap();

        assert!(answer.text.starts_with("Based on your question 'how is the market'"));
        assert!(answer.text.contains("OMX Stockholm shows current exchange activity"));
        assert!(answer.text.contains("- Current news from Swedish media."));
        assert!(!answer.text.contains("SMHI"));
        assert!(answer.text.contains("local rule-based answer"));
        assert_eq!(answer.model.as_deref(), Some("local"));
        assert!(answer.tokens_used.unwrap() > 0);
    }

    #[test]
    fn test_topic_lines_follow_context_keywords() {
        let text = LocalResponder::compose("q", Some("=== SCB ===\nBefolkning 10.5M\nväder: sol"));
        let scb = text.find("Statistics from SCB").unwrap();
        let smhi = text.find("Weather data from SMHI").unwrap();
        assert!(scb < smhi);
        assert!(!text.contains("OMX"));
        assert!(!text.contains("Data from SCB is available"));
    }

    #[test]
    fn test_unknown_sections_listed_by_name() {
        let text = LocalResponder::compose("rates", Some("\n=== RIKSBANK ===\nrepo 4.0"));
        assert!(text.contains("- Data from RIKSBANK is available."));
        assert!(!text.contains("No source data"));
    }

    #[tokio::test]
    async fn test_handles_empty_input() {
        let answer = LocalResponder::new()
            .generate(&AnswerRequest::new(""))
            .await
            .unwrap();
        assert!(answer.text.contains("No source data was available"));
    }

    #[test]
    fn test_section_name_parsing() {
        assert_eq!(section_name("=== SCB ==="), Some("SCB"));
        assert_eq!(section_name("  === SMHI (cached) ===  "), Some("SMHI"));
        assert_eq!(section_name("======"), None);
        assert_eq!(section_name("plain text"), None);
    }
}
