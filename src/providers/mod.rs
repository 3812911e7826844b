//! Generation client abstraction and implementations

pub mod fake;
pub mod openai;

use async_trait::async_trait;
use crate::config::RunConfig;
use crate::error::Error;

// Re-export for convenience
pub use fake::FakeClient;
pub use openai::OpenAiClient;

/// Sends one batch of prompts to a text-generation backend.
///
/// Implementations return exactly one response per prompt, in
/// batch order, and report the first unrecoverable condition
/// without retrying.
#[async_trait]
pub trait GenerationClient: Send + Sync
{   /// Name used in logs
    fn name(&self) -> &'static str;

    async fn generate(
      &self
    , batch: &[String]
    , config: &RunConfig
    ) -> Result<Vec<String>, Error>;
}
