//! Chat-completion client for OpenAI-compatible endpoints (OpenRouter by default).

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::chatbot::message::{window, Message};
use crate::config::{Config, DEFAULT_API_URL, DEFAULT_HISTORY_LIMIT};

const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(500);

pub struct CompletionClient {
    http: reqwest::Client,
    api_key: String,
    api_url: String,
    model: String,
    history_limit: usize,
    max_retries: u32,
    retry_backoff: Duration,
    referer: Option<String>,
    title: Option<String>,
}

#[derive(Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    messages: Vec<ApiMessage<'a>>,
}

#[derive(Serialize)]
struct ApiMessage<'a> {
    role: &'static str,
    content: &'a str,
}

// Every field is optional so an unexpected shape becomes an error, not a panic.
#[derive(Deserialize, Debug)]
struct ApiResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    error: Option<ApiError>,
}

#[derive(Deserialize, Debug)]
struct Choice {
    message: Option<ChoiceMessage>,
}

#[derive(Deserialize, Debug)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ApiError {
    #[serde(default)]
    message: String,
}

impl CompletionClient {
    pub fn new(api_key: String, model: String, timeout: Duration) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;

        Ok(Self {
            http,
            api_key,
            api_url: DEFAULT_API_URL.to_string(),
            model,
            history_limit: DEFAULT_HISTORY_LIMIT,
            max_retries: 0,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            referer: None,
            title: None,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, Error> {
        Ok(Self::new(config.openrouter_api_key.clone(), config.model.clone(), config.request_timeout)?
            .with_api_url(config.api_url.clone())
            .with_history_limit(config.history_limit)
            .with_retries(config.max_retries, DEFAULT_RETRY_BACKOFF)
            .with_attribution(config.app_referer.clone(), config.app_title.clone()))
    }

    pub fn with_api_url(mut self, api_url: String) -> Self {
        self.api_url = api_url;
        self
    }

    pub fn with_history_limit(mut self, history_limit: usize) -> Self {
        self.history_limit = history_limit;
        self
    }

    /// Retry transient failures up to `max_retries` times, doubling `backoff` each time.
    pub fn with_retries(mut self, max_retries: u32, backoff: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_backoff = backoff;
        self
    }

    /// OpenRouter app attribution (`HTTP-Referer` / `X-Title`).
    pub fn with_attribution(mut self, referer: Option<String>, title: Option<String>) -> Self {
        self.referer = referer;
        self.title = title;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Ask the model for the next assistant turn.
    ///
    /// Sends the system prompt followed by the trailing history window and
    /// returns `choices[0].message.content`.
    pub async fn complete(&self, system_prompt: &str, history: &[Message]) -> Result<String, Error> {
        let mut messages = vec![ApiMessage { role: "system", content: system_prompt }];
        messages.extend(window(history, self.history_limit).iter().map(|m| ApiMessage {
            role: m.role.as_str(),
            content: &m.content,
        }));

        let request = ApiRequest {
            model: &self.model,
            messages,
        };

        let mut attempt = 0;
        loop {
            match self.send(&request).await {
                Ok(reply) => return Ok(reply),
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    let delay = self.retry_backoff.saturating_mul(2u32.saturating_pow(attempt));
                    attempt += 1;
                    warn!("Completion attempt {attempt} failed: {e}; retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send(&self, request: &ApiRequest<'_>) -> Result<String, Error> {
        debug!("POST {} ({} messages, model {})", self.api_url, request.messages.len(), request.model);

        let mut builder = self
            .http
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .json(request);
        if let Some(ref referer) = self.referer {
            builder = builder.header("HTTP-Referer", referer);
        }
        if let Some(ref title) = self.title {
            builder = builder.header("X-Title", title);
        }

        let response = builder.send().await.map_err(Error::from_reqwest)?;

        let status = response.status();
        let body = response.text().await.map_err(Error::from_reqwest)?;

        if !status.is_success() {
            return Err(Error::Status { status: status.as_u16(), body });
        }

        let parsed: ApiResponse = serde_json::from_str(&body).map_err(|e| Error::Parse(e.to_string()))?;

        if let Some(error) = parsed.error {
            return Err(Error::Api(error.message));
        }

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .and_then(|m| m.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or(Error::Empty)
    }
}

#[derive(Debug)]
pub enum Error {
    Http(String),
    Timeout,
    Status { status: u16, body: String },
    Api(String),
    Parse(String),
    Empty,
}

impl Error {
    fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout
        } else {
            Error::Http(e.to_string())
        }
    }

    /// Whether another attempt might succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Http(_) | Error::Timeout => true,
            Error::Status { status, .. } => *status == 429 || *status >= 500,
            Error::Api(_) | Error::Parse(_) | Error::Empty => false,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Http(e) => write!(f, "HTTP error: {e}"),
            Error::Timeout => write!(f, "Request timed out"),
            Error::Status { status, body } => write!(f, "API error {status}: {body}"),
            Error::Api(e) => write!(f, "API error: {e}"),
            Error::Parse(e) => write!(f, "Parse error: {e}"),
            Error::Empty => write!(f, "Empty response"),
        }
    }
}

impl std::error::Error for Error {}
