//! LLM-backed evaluator
//!
//! Sends the transcript to Claude through the Anthropic Messages API and
//! asks for a JSON evaluation. The reply is parsed leniently: any prose or
//! code fences around the first JSON object are ignored.

use super::Evaluator;
use crate::config::LlmConfig;
use crate::error::{ConvaiError, Result};
use crate::types::{Evaluation, EvaluationContext, SpeakerRole, TranscriptMessage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// LLM evaluator using Claude
pub struct LlmEvaluator {
    config: LlmConfig,
    client: reqwest::Client,
}

/// Anthropic API message format
#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: usize,
    temperature: f32,
    messages: Vec<Message>,
}

#[derive(Debug, Serialize)]
struct Message {
    role: String,
    content: String,
}

/// Anthropic API response format
#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    text: String,
}

impl LlmEvaluator {
    pub fn new(config: LlmConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(ConvaiError::Config(config::ConfigError::Message(
                "ANTHROPIC_API_KEY not set".to_string(),
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ConvaiError::Network(e.to_string()))?;

        Ok(Self { config, client })
    }

    fn messages_url(&self) -> String {
        format!("{}/messages", self.config.base_url.trim_end_matches('/'))
    }

    async fn call_api(&self, prompt: &str) -> Result<String> {
        debug!("Calling Anthropic API ({})", self.config.model);

        let request = AnthropicRequest {
            model: self.config.model.clone(),
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            messages: vec![Message {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
        };

        let response = self
            .client
            .post(self.messages_url())
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| ConvaiError::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(ConvaiError::RemoteApi {
                status: status.as_u16(),
                message: format!("Anthropic request failed: {}", error_text),
            });
        }

        let api_response: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| ConvaiError::Evaluation(format!("Failed to parse response: {}", e)))?;

        api_response
            .content
            .into_iter()
            .map(|c| c.text)
            .find(|text| !text.trim().is_empty())
            .ok_or_else(|| ConvaiError::Evaluation("Empty response from API".to_string()))
    }
}

/// Render the evaluation prompt for one conversation
pub fn build_prompt(transcript: &[TranscriptMessage], context: &EvaluationContext) -> String {
    let lines: Vec<String> = transcript
        .iter()
        .map(|m| {
            let speaker = match m.role {
                SpeakerRole::User => "USER",
                SpeakerRole::Agent => "AGENT",
            };
            format!("[{:>6.1}s] {}: {}", m.time_in_call_secs, speaker, m.message)
        })
        .collect();

    format!(
        r#"You are reviewing a phone conversation handled by a voice AI agent.

Agent: {agent}
Duration: {duration}s
Provider outcome: {outcome}

Transcript:
{transcript}

Evaluate the agent's performance. Respond with ONLY a JSON object of this shape:
{{
  "score": <number 0-100>,
  "summary": "<one or two sentences>",
  "strengths": ["<strength>", ...],
  "improvements": ["<improvement>", ...],
  "sentiment": "positive" | "neutral" | "negative",
  "key_topics": ["<topic>", ...],
  "agent_performance": {{"responsiveness": <0-10>, "accuracy": <0-10>, "helpfulness": <0-10>}}
}}
"#,
        agent = context.agent_name,
        duration = context.duration_secs,
        outcome = context.call_successful,
        transcript = lines.join("\n"),
    )
}

/// Extract and decode the evaluation object from a model reply
pub fn parse_evaluation(reply: &str) -> Result<Evaluation> {
    let start = reply.find('{');
    let end = reply.rfind('}');

    let json = match (start, end) {
        (Some(s), Some(e)) if s < e => &reply[s..=e],
        _ => {
            return Err(ConvaiError::Evaluation(
                "No JSON object in evaluator reply".to_string(),
            ))
        }
    };

    serde_json::from_str(json)
        .map_err(|e| ConvaiError::Evaluation(format!("Invalid evaluation JSON: {}", e)))
}

#[async_trait]
impl Evaluator for LlmEvaluator {
    fn name(&self) -> &str {
        "llm"
    }

    async fn evaluate(
        &self,
        transcript: &[TranscriptMessage],
        context: &EvaluationContext,
    ) -> Result<Evaluation> {
        let prompt = build_prompt(transcript, context);
        let reply = self.call_api(&prompt).await?;
        parse_evaluation(&reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CallOutcome, Sentiment};

    const REPLY: &str = r#"Here is my assessment:
```json
{
  "score": 82,
  "summary": "Agent resolved the billing issue quickly.",
  "strengths": ["Clear explanation"],
  "improvements": [],
  "sentiment": "positive",
  "key_topics": ["billing", "refund"],
  "agent_performance": {"responsiveness": 9, "accuracy": 8, "helpfulness": 9}
}
```"#;

    #[test]
    fn test_parse_evaluation_ignores_surrounding_text() {
        let evaluation = parse_evaluation(REPLY).unwrap();
        assert_eq!(evaluation.score, 82.0);
        assert_eq!(evaluation.sentiment, Sentiment::Positive);
        assert_eq!(evaluation.key_topics, vec!["billing", "refund"]);
        assert_eq!(evaluation.agent_performance.accuracy, 8);
    }

    #[test]
    fn test_parse_evaluation_accepts_fractional_ratings() {
        let reply = r#"{"score": 64.5, "summary": "Mostly fine", "sentiment": "neutral",
            "agent_performance": {"responsiveness": 6.4, "accuracy": 7.5, "helpfulness": 10.2}}"#;

        let evaluation = parse_evaluation(reply).unwrap();
        assert_eq!(evaluation.agent_performance.responsiveness, 6);
        assert_eq!(evaluation.agent_performance.accuracy, 8);
        assert_eq!(evaluation.agent_performance.helpfulness, 10);
        assert!(crate::evaluator::validate_evaluation(&evaluation).is_ok());
    }

    #[test]
    fn test_parse_evaluation_rejects_garbage() {
        assert!(matches!(
            parse_evaluation("I cannot evaluate this."),
            Err(ConvaiError::Evaluation(_))
        ));
        assert!(matches!(
            parse_evaluation(r#"{"score": "high"}"#),
            Err(ConvaiError::Evaluation(_))
        ));
    }

    #[test]
    fn test_prompt_includes_transcript_and_context() {
        let transcript = vec![
            TranscriptMessage {
                role: SpeakerRole::Agent,
                time_in_call_secs: 0.0,
                message: "Hi, how can I help?".to_string(),
            },
            TranscriptMessage {
                role: SpeakerRole::User,
                time_in_call_secs: 2.5,
                message: "Cancel my order".to_string(),
            },
        ];
        let context = EvaluationContext {
            conversation_id: "abc123".to_string(),
            agent_name: "Orders Bot".to_string(),
            duration_secs: 95,
            call_successful: CallOutcome::Success,
            message_count: 2,
        };

        let prompt = build_prompt(&transcript, &context);
        assert!(prompt.contains("Agent: Orders Bot"));
        assert!(prompt.contains("Duration: 95s"));
        assert!(prompt.contains("Provider outcome: success"));
        assert!(prompt.contains("AGENT: Hi, how can I help?"));
        assert!(prompt.contains("USER: Cancel my order"));
    }

    #[test]
    fn test_messages_url_trims_slash() {
        let evaluator = LlmEvaluator::new(LlmConfig {
            api_key: "sk-test".to_string(),
            base_url: "http://localhost:4000/v1/".to_string(),
            ..LlmConfig::default()
        })
        .unwrap();
        assert_eq!(evaluator.messages_url(), "http://localhost:4000/v1/messages");
    }
}
