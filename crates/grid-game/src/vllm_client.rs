//! vLLM client for OpenAI-compatible chat completions API.
//!
//! Drives the game participants and the final report. Requests are retried
//! with a short backoff inside an overall wait budget; a request that still
//! fails surfaces as an error, which the scheduler degrades to an empty turn.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use quorum_kernel::{Collaborator, TurnContext};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::conversation::{PromptTemplates, GAME_SYSTEM_PROMPT};
use crate::report::{ReportWriter, REPORT_SYSTEM_PROMPT};

/// Transport settings shared by every request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Base URL of the vLLM server (e.g., "http://localhost:8000")
    pub base_url: String,
    /// Sent as a bearer token when present
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    pub request_timeout: Duration,
    /// Retries after the first attempt
    pub max_retries: usize,
    /// Sleep before retry `i`; the last entry repeats
    pub backoffs: Vec<Duration>,
    /// No retry is started once this much time has passed
    pub max_wait: Duration,
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            api_key: None,
            request_timeout: Duration::from_secs(30),
            max_retries: 2,
            backoffs: vec![Duration::from_millis(500), Duration::from_millis(1000)],
            max_wait: Duration::from_secs(12),
            temperature: 0.7,
            top_p: 0.95,
            max_tokens: 256,
        }
    }
}

/// vLLM client for chat completions.
#[derive(Clone)]
pub struct VllmClient {
    client: reqwest::Client,
    config: ClientConfig,
}

/// A chat message with role and content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
}

/// Request body for /v1/chat/completions.
#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
    top_p: f32,
}

/// Response from /v1/chat/completions.
#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

/// A single choice in the response.
#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

impl VllmClient {
    /// Create a new vLLM client.
    pub fn new(mut config: ClientConfig) -> Result<Self> {
        config.base_url = config.base_url.trim_end_matches('/').to_string();
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client, config })
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    fn backoff(&self, attempt: usize) -> Duration {
        self.config
            .backoffs
            .get(attempt)
            .or_else(|| self.config.backoffs.last())
            .copied()
            .unwrap_or_default()
    }

    /// Generate a response with a system prompt, retrying transient failures.
    pub async fn generate_with_system(
        &self,
        model: &str,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<String> {
        let start = Instant::now();
        let mut attempt = 0;
        loop {
            match self.request(model, system_prompt, user_prompt).await {
                Ok(content) => return Ok(content),
                Err(e) if attempt < self.config.max_retries => {
                    warn!(model = model, attempt = attempt + 1, error = %e, "vLLM request failed");
                    if start.elapsed() > self.config.max_wait {
                        return Err(e.context("vLLM wait budget exhausted"));
                    }
                    tokio::time::sleep(self.backoff(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn request(&self, model: &str, system_prompt: &str, user_prompt: &str) -> Result<String> {
        let request = ChatRequest {
            model,
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: Some(system_prompt.to_string()),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: Some(user_prompt.to_string()),
                },
            ],
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            top_p: self.config.top_p,
        };

        let url = format!("{}/v1/chat/completions", self.config.base_url);
        let mut builder = self.client.post(&url).json(&request);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .context("Failed to send request to vLLM server")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("vLLM request failed with status {}: {}", status, body);
        }

        let chat_response: ChatResponse = response
            .json()
            .await
            .context("Failed to parse vLLM response")?;

        chat_response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .context("No content in vLLM response")
    }

    /// Check if the vLLM server is healthy.
    pub async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/health", self.config.base_url);
        match self.client.get(&url).send().await {
            Ok(response) => Ok(response.status().is_success()),
            Err(_) => Ok(false),
        }
    }
}

/// Drives every participant through one [`VllmClient`], one model per
/// participant.
pub struct VllmCollaborator {
    client: VllmClient,
    models: HashMap<String, String>,
    default_model: String,
    n_participants: usize,
    prepare_marker: String,
    proposal_marker: String,
}

impl VllmCollaborator {
    /// # Arguments
    /// * `participant_ids` - Seat order; `models[i]` drives seat `i`
    /// * `models` - Cycled if shorter than the participant list; must be non-empty
    pub fn new(
        client: VllmClient,
        participant_ids: &[String],
        models: &[String],
        prepare_marker: &str,
        proposal_marker: &str,
    ) -> Result<Self> {
        let Some(default_model) = models.first().cloned() else {
            bail!("At least one model is required");
        };
        let models = participant_ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), models[i % models.len()].clone()))
            .collect();
        Ok(Self {
            client,
            models,
            default_model,
            n_participants: participant_ids.len(),
            prepare_marker: prepare_marker.to_string(),
            proposal_marker: proposal_marker.to_string(),
        })
    }

    pub fn model_for(&self, participant_id: &str) -> &str {
        self.models
            .get(participant_id)
            .map_or(self.default_model.as_str(), String::as_str)
    }
}

#[async_trait]
impl Collaborator for VllmCollaborator {
    async fn generate(&self, participant_id: &str, context: &TurnContext) -> Result<String> {
        let prompt = PromptTemplates::turn_prompt(
            context,
            self.n_participants,
            &self.prepare_marker,
            &self.proposal_marker,
        );
        let model = self.model_for(participant_id);
        debug!(participant = participant_id, model = model, turn = context.turn, "Requesting utterance");
        self.client
            .generate_with_system(model, GAME_SYSTEM_PROMPT, &prompt)
            .await
    }
}

/// Writes the final report with a fixed model.
pub struct VllmReportWriter {
    pub client: VllmClient,
    pub model: String,
}

#[async_trait]
impl ReportWriter for VllmReportWriter {
    async fn summarize(&self, synthesis_input: &str) -> Result<String> {
        self.client
            .generate_with_system(&self.model, REPORT_SYSTEM_PROMPT, synthesis_input)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base_url: &str) -> VllmClient {
        VllmClient::new(ClientConfig {
            base_url: base_url.to_string(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_client_creation() {
        assert_eq!(client("http://localhost:8000").base_url(), "http://localhost:8000");
        // Trailing slash removal
        assert_eq!(client("http://localhost:8000/").base_url(), "http://localhost:8000");
    }

    #[test]
    fn test_backoff_schedule() {
        let c = client("http://localhost:8000");
        assert_eq!(c.backoff(0), Duration::from_millis(500));
        assert_eq!(c.backoff(1), Duration::from_millis(1000));
        assert_eq!(c.backoff(5), Duration::from_millis(1000));
    }

    #[test]
    fn test_models_cycle_over_participants() {
        let ids: Vec<String> = (1..=4).map(|i| format!("Agent{}", i)).collect();
        let models = vec!["m1".to_string(), "m2".to_string()];
        let collab =
            VllmCollaborator::new(client("http://x"), &ids, &models, "PREPARE=", "PROPOSE=").unwrap();
        assert_eq!(collab.model_for("Agent1"), "m1");
        assert_eq!(collab.model_for("Agent2"), "m2");
        assert_eq!(collab.model_for("Agent3"), "m1");
        assert_eq!(collab.model_for("Nobody"), "m1");

        assert!(VllmCollaborator::new(client("http://x"), &ids, &[], "PREPARE=", "PROPOSE=").is_err());
    }

    #[tokio::test]
    async fn test_unreachable_server_fails_after_retries() {
        let c = VllmClient::new(ClientConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            request_timeout: Duration::from_millis(200),
            backoffs: vec![Duration::from_millis(1)],
            ..Default::default()
        })
        .unwrap();
        assert!(c.generate_with_system("m", "sys", "hi").await.is_err());
        assert!(!c.health_check().await.unwrap());
    }

    #[test]
    fn test_missing_content_is_tolerated_by_deserializer() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":null}}]}"#;
        let parsed: ChatResponse = serde_json::from_str(body).unwrap();
        assert!(parsed.choices[0].message.content.is_none());
    }
}
