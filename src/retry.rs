//! Caller-level retry around a generation client

use std::time::Duration;
use async_trait::async_trait;
use log::{debug, warn};
use crate::config::RunConfig;
use crate::error::Error;
use crate::providers::GenerationClient;

/// Retry policy for failed batches
#[derive(Debug, Clone)]
pub struct RetryPolicy
{   pub max_retries: usize
  , pub backoff_multiplier: f32
  , pub initial_backoff: Duration
}

impl RetryPolicy
{   /// Create a new retry policy
    pub fn new(
      max_retries: usize
    , backoff_multiplier: f32
    , initial_backoff_ms: u64
    ) -> Self
    {   RetryPolicy
        {   max_retries
          , backoff_multiplier
          , initial_backoff: Duration::from_millis(
              initial_backoff_ms
            )
        }
    }

    /// A policy that never retries
    pub fn none() -> Self
    {   RetryPolicy::new(0, 1.0, 0)
    }

    /// Calculate backoff duration for attempt number
    pub fn backoff_for_attempt(
      &self
    , attempt: usize
    ) -> Duration
    {   let multiplier
          = self.backoff_multiplier.powi(attempt as i32);
        Duration::from_millis(
          (self.initial_backoff.as_millis() as f32
            * multiplier) as u64
        )
    }
}

impl Default for RetryPolicy
{   fn default() -> Self
    {   RetryPolicy::new(3, 2.0, 100)
    }
}

/// Wraps a client and retries rate-limit and transport failures
/// with exponential backoff. Other kinds are returned at once.
pub struct RetryingClient<C>
{   inner: C
  , policy: RetryPolicy
}

impl<C> RetryingClient<C>
where
  C: GenerationClient
{   pub fn new(inner: C, policy: RetryPolicy) -> Self
    {   debug!(
          "Wrapping {} with up to {} retries",
          inner.name(), policy.max_retries
        );
        RetryingClient { inner, policy }
    }

    pub fn inner(&self) -> &C
    {   &self.inner
    }
}

#[async_trait]
impl<C> GenerationClient for RetryingClient<C>
where
  C: GenerationClient
{   fn name(&self) -> &'static str
    {   self.inner.name()
    }

    async fn generate(
      &self
    , batch: &[String]
    , config: &RunConfig
    ) -> Result<Vec<String>, Error>
    {   let mut attempt = 0;
        loop
        {   match self.inner.generate(batch, config).await
            {   Ok(responses) => return Ok(responses)
              , Err(e) if e.is_retryable()
                  && attempt < self.policy.max_retries => {
                  let backoff = self.policy.backoff_for_attempt(attempt);
                  warn!(
                    "Attempt {} failed ({}), retrying in {:?}",
                    attempt + 1, e, backoff
                  );
                  tokio::time::sleep(backoff).await;
                  attempt += 1;
                }
              , Err(e) => return Err(e)
            }
        }
    }
}
