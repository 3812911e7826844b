use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use async_trait::async_trait;
use log::debug;
use crate::config::RunConfig;
use crate::error::Error;

/// Deterministic in-process client.
///
/// Answers each prompt with `prefix + prompt` and can be scripted
/// to fail on one batch (0-based call number).
#[derive(Debug)]
pub struct FakeClient
{   prefix: String
  , fail_on: Option<(usize, Error)>
  , delay: Option<Duration>
  , calls: AtomicUsize
  , seen: Mutex<Vec<Vec<String>>>
}

impl FakeClient
{   pub fn new(prefix: impl Into<String>) -> Self
    {   FakeClient
        {   prefix: prefix.into()
          , fail_on: None
          , delay: None
          , calls: AtomicUsize::new(0)
          , seen: Mutex::new(Vec::new())
        }
    }

    /// Echo client answering `"R:" + prompt`
    pub fn echo() -> Self
    {   FakeClient::new("R:")
    }

    pub fn failing_on(mut self, batch_index: usize, error: Error) -> Self
    {   self.fail_on = Some((batch_index, error));
        self
    }

    /// Sleep before answering, to mimic a remote round trip
    pub fn with_delay(mut self, delay: Duration) -> Self
    {   self.delay = Some(delay);
        self
    }

    /// Number of `generate` calls so far
    pub fn calls(&self) -> usize
    {   self.calls.load(Ordering::SeqCst)
    }

    /// Batches received so far, in call order
    pub fn batches(&self) -> Vec<Vec<String>>
    {   self.seen.lock()
          .map(|seen| seen.clone())
          .unwrap_or_default()
    }
}

#[async_trait]
impl super::GenerationClient for FakeClient
{   fn name(&self) -> &'static str
    {   "fake"
    }

    async fn generate(
      &self
    , batch: &[String]
    , _config: &RunConfig
    ) -> Result<Vec<String>, Error>
    {   let call = self.calls.fetch_add(1, Ordering::SeqCst);
        debug!("Fake client call {} with {} prompts", call, batch.len());
        if let Ok(mut seen) = self.seen.lock()
        {   seen.push(batch.to_vec());
        }

        if let Some(delay) = self.delay
        {   tokio::time::sleep(delay).await;
        }

        match &self.fail_on
        {   Some((index, error)) if *index == call => {
              Err(error.clone())
            }
          , _ => Ok(batch.iter()
              .map(|prompt| format!("{}{}", self.prefix, prompt))
              .collect())
        }
    }
}
