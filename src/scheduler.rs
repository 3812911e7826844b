//! Sequential batch execution with progress and partial results

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use log::{debug, trace, info, warn, error};
use crate::config::RunConfig;
use crate::error::Error;
use crate::providers::GenerationClient;
use crate::{Progress, RunState};

pub type ProgressSender = mpsc::UnboundedSender<Progress>;
pub type ProgressReceiver = mpsc::UnboundedReceiver<Progress>;

/// Cooperative cancellation flag, checked between batches
#[derive(Debug, Clone, Default)]
pub struct CancelToken
{   flag: Arc<AtomicBool>
}

impl CancelToken
{   pub fn new() -> Self
    {   CancelToken::default()
    }

    pub fn cancel(&self)
    {   debug!("Cancellation requested");
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool
    {   self.flag.load(Ordering::SeqCst)
    }
}

/// Split `prompts` into consecutive slices of at most
/// `batch_size` (treated as 1 when 0)
pub fn partition(prompts: &[String], batch_size: usize) -> Vec<&[String]>
{   prompts.chunks(batch_size.max(1)).collect()
}

/// `completed / total`, clamped to 1.0; an empty run counts as done
pub fn progress_fraction(completed: usize, total: usize) -> f64
{   if total == 0
    {   return 1.0;
    }
    (completed as f64 / total as f64).min(1.0)
}

/// Runs one prompt list at a time and publishes its `RunState`
#[derive(Debug)]
pub struct BatchScheduler
{   state: Arc<watch::Sender<RunState>>
}

impl Default for BatchScheduler
{   fn default() -> Self
    {   BatchScheduler::new()
    }
}

impl BatchScheduler
{   pub fn new() -> Self
    {   debug!("Creating BatchScheduler");
        let (state, _) = watch::channel(RunState::Idle);
        BatchScheduler
        {   state: Arc::new(state)
        }
    }

    /// Snapshot of the current state
    pub fn state(&self) -> RunState
    {   self.state.borrow().clone()
    }

    pub fn is_running(&self) -> bool
    {   self.state.borrow().is_running()
    }

    /// Receiver that sees every state change from now on
    pub fn subscribe(&self) -> watch::Receiver<RunState>
    {   self.state.subscribe()
    }

    /// Drop the last terminal state
    pub fn reset(&self) -> Result<(), Error>
    {   let reset = self.state.send_if_modified(|state| {
          if state.is_running()
          {   false
          } else
          {   *state = RunState::Idle;
              true
          }
        });
        if reset
        {   trace!("Scheduler reset to Idle");
            Ok(())
        } else
        {   Err(Error::ConcurrentRun)
        }
    }

    /// Validate `config` and claim the engine for a new run.
    ///
    /// Fails with `Configuration` on an invalid config and with
    /// `ConcurrentRun` while another run is active; in both cases
    /// the current state is left untouched.
    pub fn start(
      &self
    , prompts: Vec<String>
    , config: RunConfig
    ) -> Result<ActiveRun, Error>
    {   config.validate().map_err(|e| {
          error!("Refusing to start run: {}", e);
          e
        })?;

        let total = prompts.len();
        let claimed = self.state.send_if_modified(|state| {
          if state.is_running()
          {   false
          } else
          {   *state = RunState::Running
              {   progress: 0.0
                , completed: 0
                , total
              };
              true
          }
        });

        if !claimed
        {   warn!("Rejecting run of {} prompts: engine busy", total);
            return Err(Error::ConcurrentRun);
        }

        Ok(ActiveRun
        {   state: Arc::clone(&self.state)
          , result: vec![String::new(); total]
          , prompts
          , config
          , finished: false
        })
    }

    /// Run `prompts` to a terminal state
    pub async fn run<C>(
      &self
    , prompts: &[String]
    , config: &RunConfig
    , client: &C
    ) -> Result<RunState, Error>
    where
      C: GenerationClient + ?Sized
    {   self.run_with(prompts, config, client, None, &CancelToken::new())
          .await
    }

    /// `run` with a progress sink and a cancellation token
    pub async fn run_with<C>(
      &self
    , prompts: &[String]
    , config: &RunConfig
    , client: &C
    , progress: Option<ProgressSender>
    , cancel: &CancelToken
    ) -> Result<RunState, Error>
    where
      C: GenerationClient + ?Sized
    {   let active = self.start(prompts.to_vec(), config.clone())?;
        Ok(active.execute(client, progress, cancel).await)
    }
}

/// A claimed run. Dropping it before `execute` finishes records
/// `Failed(Cancelled)` with the responses gathered so far.
#[derive(Debug)]
pub struct ActiveRun
{   state: Arc<watch::Sender<RunState>>
  , prompts: Vec<String>
  , config: RunConfig
  , result: Vec<String>
  , finished: bool
}

impl ActiveRun
{   pub fn total(&self) -> usize
    {   self.prompts.len()
    }

    /// Dispatch every batch in order and return the terminal state
    pub async fn execute<C>(
      mut self
    , client: &C
    , progress: Option<ProgressSender>
    , cancel: &CancelToken
    ) -> RunState
    where
      C: GenerationClient + ?Sized
    {   let total = self.prompts.len();
        let batch_size = self.config.batch_size.max(1);
        let batch_count = total.div_ceil(batch_size);
        info!(
          "Starting run: {} prompts in {} batches via {}",
          total, batch_count, client.name()
        );

        let prompts = std::mem::take(&mut self.prompts);
        let mut offset = 0;
        for (batch_index, batch) in partition(&prompts, batch_size)
          .into_iter()
          .enumerate()
        {   if cancel.is_cancelled()
            {   info!(
                  "Run cancelled before batch {}/{}",
                  batch_index + 1, batch_count
                );
                return self.fail(Error::Cancelled);
            }

            debug!(
              "Dispatching batch {}/{} ({} prompts)",
              batch_index + 1, batch_count, batch.len()
            );

            let outcome = client.generate(batch, &self.config).await;
            let responses = match outcome
            {   Ok(responses) => responses
              , Err(e) => {
                  error!(
                    "Batch {}/{} failed ({}): {}",
                    batch_index + 1, batch_count, e.kind(), e
                  );
                  return self.fail(e);
                }
            };

            if responses.len() != batch.len()
            {   let e = Error::Provider(format!(
                  "batch {} returned {} responses for {} prompts",
                  batch_index + 1, responses.len(), batch.len()
                ));
                error!("{}", e);
                return self.fail(e);
            }

            let end = offset + batch.len();
            for (slot, response) in self.result[offset..end]
              .iter_mut()
              .zip(responses)
            {   *slot = response;
            }

            let fraction = progress_fraction(end, total);
            self.state.send_replace(RunState::Running
            {   progress: fraction
              , completed: end
              , total
            });
            if let Some(tx) = &progress
            {   let _ = tx.send(Progress
                {   completed: end
                  , total
                  , fraction
                });
            }
            trace!("Progress {}/{} ({:.3})", end, total, fraction);

            offset = end;
        }

        info!("Run completed: {} responses", total);
        let result = std::mem::take(&mut self.result);
        self.finish(RunState::Completed(result))
    }

    fn fail(&mut self, error: Error) -> RunState
    {   let partial = std::mem::take(&mut self.result);
        self.finish(RunState::Failed { error, partial })
    }

    fn finish(&mut self, terminal: RunState) -> RunState
    {   self.finished = true;
        self.state.send_replace(terminal.clone());
        terminal
    }
}

impl Drop for ActiveRun
{   fn drop(&mut self)
    {   if !self.finished
        {   warn!("Run dropped before completion, marking cancelled");
            self.fail(Error::Cancelled);
        }
    }
}
