//! Provider-neutral request and response types

use serde::{Deserialize, Serialize};
use crate::config::RunConfig;

/// One remote call: a batch of prompts and the sampling settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest
{   /// Model name
    pub model: String
  , /// Prompts in batch order
    pub prompts: Vec<String>
  , /// Temperature for sampling
    pub temperature: f32
  , /// Max tokens to generate per prompt
    pub max_tokens: Option<usize>
}

impl GenerationRequest
{   pub fn new(batch: &[String], config: &RunConfig) -> Self
    {   GenerationRequest
        {   model: config.model_id.clone()
          , prompts: batch.to_vec()
          , temperature: config.temperature
          , max_tokens: None
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self
    {   self.max_tokens = Some(max_tokens);
        self
    }
}

/// Responses for one remote call, in request order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResponse
{   /// Generated texts
    pub texts: Vec<String>
  , /// Model that generated them
    pub model: String
  , /// Tokens used
    pub tokens_used: Option<usize>
}
