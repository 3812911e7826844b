use std::time::Duration;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use reqwest::StatusCode;
use log::{debug, trace, error};
use crate::config::RunConfig;
use crate::error::Error;
use crate::request::{GenerationRequest, GenerationResponse};

pub const OPENAI_API_BASE: &str
  = "https://api.openai.com/v1";

pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

// ===== Wire Types =====

#[derive(Debug, Clone, Serialize)]
pub struct CompletionRequest
{   pub model: String
  , pub prompt: Vec<String>
  , pub temperature: f32
  , #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<usize>
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompletionResponse
{   pub choices: Vec<CompletionChoice>
  , #[serde(default)]
    pub model: Option<String>
  , #[serde(default)]
    pub usage: Option<Usage>
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompletionChoice
{   pub text: String
  , pub index: usize
  , #[serde(default)]
    pub finish_reason: Option<String>
}

#[derive(Debug, Clone, Deserialize)]
pub struct Usage
{   pub total_tokens: usize
}

#[derive(Debug, Clone, Deserialize)]
struct ApiErrorEnvelope
{   error: ApiErrorBody
}

#[derive(Debug, Clone, Deserialize)]
struct ApiErrorBody
{   message: String
}

impl From<&GenerationRequest> for CompletionRequest
{   fn from(request: &GenerationRequest) -> Self
    {   CompletionRequest
        {   model: request.model.clone()
          , prompt: request.prompts.clone()
          , temperature: request.temperature
          , max_tokens: request.max_tokens
        }
    }
}

// ===== Client =====

/// Client for OpenAI-compatible `/completions` endpoints.
///
/// One batch is one HTTP request: the endpoint takes an array of
/// prompts and answers with choices tagged by prompt index.
#[derive(Debug, Clone)]
pub struct OpenAiClient
{   http_client: reqwest::Client
  , max_tokens: Option<usize>
}

impl OpenAiClient
{   pub fn new() -> Result<Self, Error>
    {   OpenAiClient::with_timeout(
          Duration::from_secs(DEFAULT_TIMEOUT_SECS)
        )
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, Error>
    {   debug!("Creating OpenAiClient, timeout {:?}", timeout);
        let http_client = reqwest::Client::builder()
          .timeout(timeout)
          .build()
          .map_err(|e| {
            error!("Failed to build HTTP client: {}", e);
            Error::Other(e.to_string())
          })?;
        Ok(OpenAiClient
        {   http_client
          , max_tokens: None
        })
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self
    {   self.max_tokens = Some(max_tokens);
        self
    }

    fn endpoint(base_url: Option<&str>) -> String
    {   let base = base_url
          .map(str::trim)
          .filter(|url| !url.is_empty())
          .unwrap_or(OPENAI_API_BASE)
          .trim_end_matches('/');
        format!("{}/completions", base)
    }

    /// Send one request and map every failure to its error kind
    pub async fn complete(
      &self
    , request: &GenerationRequest
    , credential: &str
    , base_url: Option<&str>
    ) -> Result<GenerationResponse, Error>
    {   if credential.trim().is_empty()
        {   return Err(Error::Authentication(
              "no credential configured".to_string()
            ));
        }

        let url = OpenAiClient::endpoint(base_url);
        let body = CompletionRequest::from(request);
        debug!(
          "POST {} with {} prompts for {}",
          url, body.prompt.len(), body.model
        );
        trace!("Completion request: {:?}", body);

        let response = self.http_client
          .post(&url)
          .header("Authorization", format!("Bearer {}", credential))
          .header("Content-Type", "application/json")
          .json(&body)
          .send()
          .await
          .map_err(|e| {
            error!("HTTP error: {}", e);
            transport_error(&e)
          })?;

        let status = response.status();
        trace!("Completion response status: {}", status);

        let text = response.text().await.map_err(|e| {
          error!("Failed to read response body: {}", e);
          transport_error(&e)
        })?;

        if !status.is_success()
        {   let err = status_error(status, &text);
            error!("Completion request failed: {}", err);
            return Err(err);
        }

        let parsed: CompletionResponse = serde_json::from_str(&text)
          .map_err(|e| {
            error!("Parse error: {}", e);
            Error::Provider(format!("unparseable response: {}", e))
          })?;

        let model = parsed.model
          .clone()
          .unwrap_or_else(|| request.model.clone());
        let tokens_used = parsed.usage
          .as_ref()
          .map(|u| u.total_tokens);
        let texts = order_choices(parsed.choices, request.prompts.len())?;

        debug!("Received {} completions", texts.len());
        Ok(GenerationResponse
        {   texts
          , model
          , tokens_used
        })
    }
}

#[async_trait]
impl super::GenerationClient for OpenAiClient
{   fn name(&self) -> &'static str
    {   "openai"
    }

    async fn generate(
      &self
    , batch: &[String]
    , config: &RunConfig
    ) -> Result<Vec<String>, Error>
    {   let mut request = GenerationRequest::new(batch, config);
        if let Some(max_tokens) = self.max_tokens
        {   request = request.with_max_tokens(max_tokens);
        }
        let response = self
          .complete(
            &request,
            &config.endpoint_credential,
            config.base_url.as_deref()
          )
          .await?;
        Ok(response.texts)
    }
}

fn transport_error(e: &reqwest::Error) -> Error
{   if e.is_timeout()
    {   Error::Transport(format!("request timed out: {}", e))
    } else
    {   Error::Transport(e.to_string())
    }
}

/// Map a non-success status to an error kind
fn status_error(status: StatusCode, body: &str) -> Error
{   let message = serde_json::from_str::<ApiErrorEnvelope>(body)
      .map(|envelope| envelope.error.message)
      .unwrap_or_else(|_| {
        if body.trim().is_empty()
        {   status.to_string()
        } else
        {   body.trim().to_string()
        }
      });

    match status
    {   StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
          Error::Authentication(message)
        }
      , StatusCode::TOO_MANY_REQUESTS => {
          Error::RateLimit(message)
        }
      , StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
          Error::Transport(message)
        }
      , _ => {
          Error::Provider(format!("{}: {}", status, message))
        }
    }
}

/// Put choices back in prompt order; every index in
/// `0..expected` must appear exactly once
fn order_choices(
  choices: Vec<CompletionChoice>
, expected: usize
) -> Result<Vec<String>, Error>
{   if choices.len() != expected
    {   return Err(Error::Provider(format!(
          "expected {} choices, got {}",
          expected, choices.len()
        )));
    }

    let mut slots: Vec<Option<String>> = vec![None; expected];
    for choice in choices
    {   let slot = slots.get_mut(choice.index).ok_or_else(|| {
          Error::Provider(format!(
            "choice index {} out of range", choice.index
          ))
        })?;
        if slot.is_some()
        {   return Err(Error::Provider(format!(
              "duplicate choice index {}", choice.index
            )));
        }
        *slot = Some(choice.text);
    }

    slots.into_iter()
      .enumerate()
      .map(|(index, slot)| slot.ok_or_else(|| {
        Error::Provider(format!("missing choice index {}", index))
      }))
      .collect()
}
