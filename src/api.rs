//! LLM transport.
//!
//! The factory depends on exactly one capability: given a prompt, return a
//! completion, possibly failing. That seam is the [`LlmClient`] trait; the
//! production implementation speaks the OpenAI-compatible chat completions
//! protocol over blocking HTTP with bounded retry for transient failures.

use std::{thread, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
   config::FactoryConfig,
   error::{ForemanError, Result},
   style,
};

/// The single capability the factory needs from an LLM.
pub trait LlmClient {
   /// One completion for one prompt. Errors are lifted into
   /// `FailureBrief(stage=exception)` by the proposer.
   fn complete(&self, prompt: &str) -> Result<String>;
}

#[derive(Debug, Serialize)]
struct ChatMessage {
   role:    String,
   content: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
   model:       String,
   temperature: f32,
   messages:    Vec<ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
   #[serde(default)]
   content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
   message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
   choices: Vec<ChatChoice>,
}

fn response_snippet(body: &str, limit: usize) -> String {
   if body.is_empty() {
      return "<empty response body>".to_string();
   }
   let mut snippet = body.trim().to_string();
   if snippet.len() > limit {
      snippet.truncate(limit);
      snippet.push_str("...");
   }
   snippet
}

fn chat_completions_url(base_url: &str) -> String {
   let trimmed = base_url.trim_end_matches('/');
   if trimmed.ends_with("/v1") {
      format!("{trimmed}/chat/completions")
   } else {
      format!("{trimmed}/v1/chat/completions")
   }
}

/// Whether an HTTP status is worth retrying.
const fn retryable_status(status: u16) -> bool {
   status == 429 || status >= 500
}

/// Blocking HTTP client against an OpenAI-compatible endpoint.
pub struct HttpLlmClient {
   client:             reqwest::blocking::Client,
   base_url:           String,
   api_key:            Option<String>,
   model:              String,
   temperature:        f32,
   max_retries:        u32,
   initial_backoff_ms: u64,
}

impl HttpLlmClient {
   pub fn new(config: &FactoryConfig) -> Self {
      let client = reqwest::blocking::Client::builder()
         .timeout(Duration::from_secs(config.request_timeout_secs))
         .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
         .build()
         .expect("Failed to build HTTP client");

      Self {
         client,
         base_url: config.api_base_url.clone(),
         api_key: config.api_key.clone(),
         model: config.llm_model.clone(),
         temperature: config.temperature,
         max_retries: config.max_retries,
         initial_backoff_ms: config.initial_backoff_ms,
      }
   }

   fn complete_once(&self, prompt: &str) -> Result<String> {
      let request = ChatRequest {
         model:       self.model.clone(),
         temperature: self.temperature,
         messages:    vec![ChatMessage { role: "user".to_string(), content: prompt.to_string() }],
      };

      let mut builder = self.client.post(chat_completions_url(&self.base_url)).json(&request);
      if let Some(ref key) = self.api_key {
         builder = builder.header("Authorization", format!("Bearer {key}"));
      }

      let response = builder.send()?;
      let status = response.status().as_u16();
      let body = response.text()?;

      if status != 200 {
         return Err(ForemanError::ApiError { status, body: response_snippet(&body, 500) });
      }

      let parsed: ChatResponse = serde_json::from_str(&body).map_err(|e| {
         ForemanError::Other(format!(
            "Failed to parse completion response: {e}. Body: {}",
            response_snippet(&body, 500)
         ))
      })?;

      parsed
         .choices
         .into_iter()
         .next()
         .and_then(|c| c.message.content)
         .ok_or_else(|| ForemanError::Other("Completion response had no content".to_string()))
   }
}

impl LlmClient for HttpLlmClient {
   fn complete(&self, prompt: &str) -> Result<String> {
      let mut attempt = 0u32;
      loop {
         attempt += 1;
         match self.complete_once(prompt) {
            Ok(text) => return Ok(text),
            Err(e) => {
               let transient = match &e {
                  ForemanError::ApiError { status, .. } => retryable_status(*status),
                  ForemanError::HttpError(_) => true,
                  _ => false,
               };
               if !transient || attempt >= self.max_retries {
                  if transient {
                     return Err(ForemanError::ApiRetryExhausted {
                        retries: self.max_retries,
                        source:  Box::new(e),
                     });
                  }
                  return Err(e);
               }
               let backoff_ms = self.initial_backoff_ms * (1 << (attempt - 1));
               style::warn(&format!(
                  "LLM call failed ({e}), retry {attempt}/{} after {backoff_ms}ms",
                  self.max_retries
               ));
               thread::sleep(Duration::from_millis(backoff_ms));
            },
         }
      }
   }
}
