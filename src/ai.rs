use anyhow::{anyhow, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::env;
use tracing::{debug, warn};

use crate::models::{ClassifiedEvent, Status};
use crate::pacing::{RetryPolicy, Sleeper};

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("{provider} API request failed with status {status}: {body}")]
    Http {
        provider: &'static str,
        status: u16,
        body: String,
    },

    #[error("failed to reach {provider} API: {source}")]
    Transport {
        provider: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("unreadable {provider} API response: {message}")]
    Response {
        provider: &'static str,
        message: String,
    },
}

impl ProviderError {
    /// Rate limiting, server-side failures and dropped connections are worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Http { status, .. } => *status == 429 || *status >= 500,
            ProviderError::Transport { .. } => true,
            ProviderError::Response { .. } => false,
        }
    }
}

// --- Provider trait ---

pub trait AIProvider {
    fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String, ProviderError>;
    fn model_name(&self) -> &str;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderKind {
    Gemini,
    Anthropic,
    OpenAI,
}

#[derive(Debug, Clone)]
pub struct ModelSpec {
    pub provider: ProviderKind,
    pub model_id: String,
}

pub fn resolve_model(name: &str) -> Result<ModelSpec> {
    let (provider, model_id) = match name {
        // Google Gemini (requires GEMINI_API_KEY)
        "gemini" | "gemini-pro" => (ProviderKind::Gemini, "gemini-pro-latest"),
        "gemini-flash" => (ProviderKind::Gemini, "gemini-flash-latest"),
        // Anthropic (requires ANTHROPIC_API_KEY)
        "api-sonnet" | "sonnet" => (ProviderKind::Anthropic, "claude-sonnet-4-5-20250929"),
        "api-haiku" | "haiku" => (ProviderKind::Anthropic, "claude-haiku-4-5-20251001"),
        // OpenAI (requires OPENAI_API_KEY)
        "gpt-5.2" | "gpt5" => (ProviderKind::OpenAI, "gpt-5.2"),
        "gpt-4o" => (ProviderKind::OpenAI, "gpt-4o"),
        _ => {
            return Err(anyhow!(
                "Unknown model '{}'. Available: gemini (default), gemini-flash, api-sonnet, \
                 api-haiku, gpt-5.2, gpt-4o",
                name
            ))
        }
    };
    Ok(ModelSpec {
        provider,
        model_id: model_id.to_string(),
    })
}

pub fn create_provider(spec: &ModelSpec) -> Result<Box<dyn AIProvider>> {
    match spec.provider {
        ProviderKind::Gemini => Ok(Box::new(GeminiProvider::new(spec.model_id.clone())?)),
        ProviderKind::Anthropic => Ok(Box::new(AnthropicProvider::new(spec.model_id.clone())?)),
        ProviderKind::OpenAI => Ok(Box::new(OpenAIProvider::new(spec.model_id.clone())?)),
    }
}

fn read_api_key(var: &str) -> Result<String> {
    env::var(var).with_context(|| {
        format!(
            "{} environment variable not set. Set it with: export {}=your-key-here",
            var, var
        )
    })
}

fn send_json<T: Serialize>(
    provider: &'static str,
    request: reqwest::blocking::RequestBuilder,
    body: &T,
) -> Result<reqwest::blocking::Response, ProviderError> {
    let response = request
        .json(body)
        .send()
        .map_err(|source| ProviderError::Transport { provider, source })?;

    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response.text().unwrap_or_default();
        return Err(ProviderError::Http {
            provider,
            status,
            body,
        });
    }
    Ok(response)
}

fn response_error(provider: &'static str, message: impl Into<String>) -> ProviderError {
    ProviderError::Response {
        provider,
        message: message.into(),
    }
}

// --- Gemini provider ---

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";

#[derive(Debug, Serialize, Deserialize)]
struct GeminiPart {
    text: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    max_output_tokens: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    generation_config: GeminiGenerationConfig,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: GeminiContent,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug)]
pub struct GeminiProvider {
    api_key: String,
    model_id: String,
    client: reqwest::blocking::Client,
}

impl GeminiProvider {
    pub fn new(model_id: String) -> Result<Self> {
        let api_key = read_api_key("GEMINI_API_KEY")?;
        let client = reqwest::blocking::Client::new();
        Ok(Self { api_key, model_id, client })
    }
}

impl AIProvider for GeminiProvider {
    fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String, ProviderError> {
        const PROVIDER: &str = "Gemini";
        let request = GeminiRequest {
            contents: vec![GeminiContent {
                parts: vec![GeminiPart {
                    text: prompt.to_string(),
                }],
            }],
            generation_config: GeminiGenerationConfig {
                max_output_tokens: max_tokens,
            },
        };

        let url = format!("{}/{}:generateContent", GEMINI_API_BASE, self.model_id);
        let response = send_json(
            PROVIDER,
            self.client.post(url).header("x-goog-api-key", &self.api_key),
            &request,
        )?;

        let api_response: GeminiResponse = response
            .json()
            .map_err(|e| response_error(PROVIDER, e.to_string()))?;

        api_response
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content.parts.into_iter().next())
            .map(|part| part.text)
            .ok_or_else(|| response_error(PROVIDER, "no candidates in response"))
    }

    fn model_name(&self) -> &str {
        &self.model_id
    }
}

// --- Anthropic provider ---

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

impl ChatMessage {
    fn user(content: &str) -> Self {
        Self {
            role: "user".to_string(),
            content: content.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct AnthropicContentBlock {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
}

#[derive(Debug)]
pub struct AnthropicProvider {
    api_key: String,
    model_id: String,
    client: reqwest::blocking::Client,
}

impl AnthropicProvider {
    pub fn new(model_id: String) -> Result<Self> {
        let api_key = read_api_key("ANTHROPIC_API_KEY")?;
        let client = reqwest::blocking::Client::new();
        Ok(Self { api_key, model_id, client })
    }
}

impl AIProvider for AnthropicProvider {
    fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String, ProviderError> {
        const PROVIDER: &str = "Anthropic";
        let request = ChatRequest {
            model: self.model_id.clone(),
            max_tokens,
            messages: vec![ChatMessage::user(prompt)],
        };

        let response = send_json(
            PROVIDER,
            self.client
                .post(ANTHROPIC_API_URL)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", "2023-06-01"),
            &request,
        )?;

        let api_response: AnthropicResponse = response
            .json()
            .map_err(|e| response_error(PROVIDER, e.to_string()))?;

        api_response
            .content
            .into_iter()
            .next()
            .map(|block| block.text)
            .ok_or_else(|| response_error(PROVIDER, "no content in response"))
    }

    fn model_name(&self) -> &str {
        &self.model_id
    }
}

// --- OpenAI provider ---

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

#[derive(Debug, Deserialize)]
struct OpenAIResponseMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIResponseMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
}

#[derive(Debug)]
pub struct OpenAIProvider {
    api_key: String,
    model_id: String,
    client: reqwest::blocking::Client,
}

impl OpenAIProvider {
    pub fn new(model_id: String) -> Result<Self> {
        let api_key = read_api_key("OPENAI_API_KEY")?;
        let client = reqwest::blocking::Client::new();
        Ok(Self { api_key, model_id, client })
    }
}

impl AIProvider for OpenAIProvider {
    fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String, ProviderError> {
        const PROVIDER: &str = "OpenAI";
        let request = ChatRequest {
            model: self.model_id.clone(),
            max_tokens,
            messages: vec![ChatMessage::user(prompt)],
        };

        let response = send_json(
            PROVIDER,
            self.client
                .post(OPENAI_API_URL)
                .header("Authorization", format!("Bearer {}", self.api_key)),
            &request,
        )?;

        let api_response: OpenAIResponse = response
            .json()
            .map_err(|e| response_error(PROVIDER, e.to_string()))?;

        api_response
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| response_error(PROVIDER, "no choices in response"))
    }

    fn model_name(&self) -> &str {
        &self.model_id
    }
}

// --- Classification ---

pub trait Classifier {
    /// Never fails: anything unusable comes back as `ClassifiedEvent::unknown()`.
    fn classify(&self, text: &str) -> ClassifiedEvent;
}

const CLASSIFY_MAX_TOKENS: u32 = 512;

pub struct LlmClassifier<'a> {
    provider: Box<dyn AIProvider>,
    retry: RetryPolicy,
    sleeper: &'a dyn Sleeper,
}

impl<'a> LlmClassifier<'a> {
    pub fn new(provider: Box<dyn AIProvider>, retry: RetryPolicy, sleeper: &'a dyn Sleeper) -> Self {
        Self {
            provider,
            retry,
            sleeper,
        }
    }

    fn complete_with_retry(&self, prompt: &str) -> Option<String> {
        for attempt in 1..=self.retry.attempts {
            match self.provider.complete(prompt, CLASSIFY_MAX_TOKENS) {
                Ok(text) => return Some(text),
                Err(e) if e.is_transient() && attempt < self.retry.attempts => {
                    warn!(
                        attempt,
                        max = self.retry.attempts,
                        "Transient error from {}, retrying: {}",
                        self.provider.model_name(),
                        e
                    );
                    self.sleeper.sleep(self.retry.delay);
                }
                Err(e) => {
                    warn!("Classification with {} failed: {}", self.provider.model_name(), e);
                    return None;
                }
            }
        }
        None
    }
}

impl Classifier for LlmClassifier<'_> {
    fn classify(&self, text: &str) -> ClassifiedEvent {
        let prompt = classification_prompt(text);
        let Some(response) = self.complete_with_retry(&prompt) else {
            return ClassifiedEvent::unknown();
        };

        match parse_classification(&response) {
            Ok(event) => {
                debug!(?event, "Classified message");
                event
            }
            Err(e) => {
                warn!("Could not parse classifier response: {}", e);
                ClassifiedEvent::unknown()
            }
        }
    }
}

fn classification_prompt(email_text: &str) -> String {
    format!(
        "Analyze the following email text from a job seeker's mailbox.\n\
        Extract three pieces of information:\n\
        1. The name of the company involved.\n\
        2. The specific job role or title (e.g. \"Software Engineer\", \"Data Scientist\").\n\
        3. The status of the application.\n\
        The status must be one of: \"Applied\", \"Interviewing\", \"Rejected\", \"Offer\", \"Unknown\".\n\
        Return strict JSON with exactly the keys company_name, role and status. \
        Use \"Unknown\" for any value that cannot be found.\n\
        Example: {{\"company_name\": \"Google\", \"role\": \"Software Engineer\", \"status\": \"Interviewing\"}}\n\n\
        Email text:\n---\n{}\n---",
        email_text
    )
}

#[derive(Debug, Deserialize)]
struct RawClassification {
    #[serde(default)]
    company_name: Option<String>,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

fn parse_classification(response: &str) -> Result<ClassifiedEvent> {
    let cleaned = response.replace("```json", "").replace("```", "");
    let re = Regex::new(r"(?s)\{.*\}")?;
    let json = re
        .find(&cleaned)
        .map(|m| m.as_str())
        .ok_or_else(|| anyhow!("no JSON object in response"))?;

    let raw: RawClassification =
        serde_json::from_str(json).context("Failed to parse classification JSON")?;

    Ok(ClassifiedEvent {
        company: known(raw.company_name),
        role: known(raw.role),
        status: known(raw.status).and_then(|s| s.parse::<Status>().ok()),
    })
}

fn known(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty() && !v.eq_ignore_ascii_case("unknown"))
}
