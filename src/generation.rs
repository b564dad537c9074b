//! Answer generation over retrieved chunks.
//!
//! [`build_prompt`] turns a query and its ranked chunks into a single
//! prompt, [`ChatClient`] sends it to an OpenAI-compatible chat completions
//! endpoint, and [`generate_answer`] ties the two together, degrading to a
//! fixed apology when the model cannot be reached.

use std::{future::Future, time::Duration};

use reqwest::{
    Client,
    StatusCode,
    header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue},
};
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    retry::RetryPolicy,
    search::ScoredChunk,
    settings::Settings,
};

/// Returned by [`generate_answer`] when the language model call fails.
pub const APOLOGY: &str = "Sorry, I couldn't generate a response due to an error.";

const SYSTEM_MESSAGE: &str = "You are a helpful assistant.";
const TEMPERATURE: f32 = 0.3;
const MAX_TOKENS: u32 = 300;

const PREAMBLE: &str = "You are an assistant that summarizes and extracts insights from corporate email threads.\n\
Given a user query and the relevant email thread excerpts, answer the question concisely and accurately.\n\n";

const FEW_SHOT_EXAMPLE: &str = "Example:\n\
Query: What was the decision on the marketing budget for Q2?\n\
Context:\n\
- The marketing team proposed a 20% increase for digital campaigns.\n\
- Finance approved a 10% increase after negotiation.\n\
Answer: A 10% increase in the Q2 marketing budget was approved after negotiation.\n\n";

/// Build the prompt sent to the language model.
///
/// Chunks are listed in the order given, one `- ` bullet each.
///
/// # Examples
///
/// ```
/// use threadsearch::generation::build_prompt;
///
/// let prompt = build_prompt("Who approved it?", &[], false);
/// assert!(prompt.ends_with("Query: Who approved it?\nContext:\n\nAnswer:"));
/// ```
pub fn build_prompt(query: &str, chunks: &[ScoredChunk], few_shot: bool) -> String {
    let mut prompt = String::from(PREAMBLE);
    if few_shot {
        prompt.push_str(FEW_SHOT_EXAMPLE);
    }

    prompt.push_str(&format!("Query: {query}\nContext:\n"));
    for chunk in chunks {
        prompt.push_str(&format!("- {}\n", chunk.chunk));
    }
    prompt.push_str("\nAnswer:");
    prompt
}

/// A text completion backend.
pub trait LanguageModel: Send + Sync {
    fn complete(&self, prompt: &str) -> impl Future<Output = Result<String>> + Send;
}

/// Client for an OpenAI-compatible `/chat/completions` endpoint.
#[derive(Clone)]
pub struct ChatClient {
    client: Client,
    endpoint: String,
    model: String,
    retry: RetryPolicy,
}

impl std::fmt::Debug for ChatClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatClient")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl ChatClient {
    pub fn new(
        api_key: &str,
        base_url: &str,
        model: &str,
        timeout: Duration,
    ) -> Result<Self> {
        if api_key.trim().is_empty() {
            return Err(Error::Config("missing language model API key".into()));
        }
        if model.trim().is_empty() {
            return Err(Error::Config("missing language model name".into()));
        }

        let mut headers = HeaderMap::new();
        let auth = HeaderValue::from_str(&format!("Bearer {}", api_key.trim()))
            .map_err(|_| Error::Config("API key is not a valid header value".into()))?;
        headers.insert(AUTHORIZATION, auth);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            model: model.to_string(),
            retry: RetryPolicy::default(),
        })
    }

    /// Build a client from resolved settings.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let key = settings.api_key.as_deref().ok_or_else(|| {
            Error::Config(
                "no API key: set THREADSEARCH_API_KEY or OPENAI_API_KEY".into(),
            )
        })?;
        Self::new(
            key,
            &settings.llm_base_url,
            &settings.llm_model,
            settings.request_timeout,
        )
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn send(&self, prompt: &str) -> Result<String> {
        let request = ChatRequest {
            model: &self.model,
            messages: [
                Message {
                    role: "system",
                    content: SYSTEM_MESSAGE,
                },
                Message {
                    role: "user",
                    content: prompt,
                },
            ],
            temperature: TEMPERATURE,
            max_tokens: MAX_TOKENS,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Generation(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(if should_retry(status) {
                Error::Generation(format!("{status}: {body}"))
            } else {
                Error::Rejected {
                    status: status.as_u16(),
                    body,
                }
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| Error::Generation(format!("malformed response: {e}")))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| Error::Generation("response contained no choices".into()))
    }
}

fn should_retry(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

impl LanguageModel for ChatClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        self.retry
            .run_async("generate", || self.send(prompt))
            .await
    }
}

/// Answer `query` from the given chunks.
///
/// Uses the few-shot prompt. Any failure is logged and replaced by
/// [`APOLOGY`].
pub async fn generate_answer<M: LanguageModel>(
    model: &M,
    query: &str,
    chunks: &[ScoredChunk],
) -> String {
    let prompt = build_prompt(query, chunks, true);
    match model.complete(&prompt).await {
        Ok(answer) => answer.trim().to_string(),
        Err(e) => {
            tracing::warn!(error = %e, "language model call failed");
            APOLOGY.to_string()
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [Message<'a>; 2],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}
