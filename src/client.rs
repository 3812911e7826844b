use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use log::{debug, error, info, warn};
use crate::config::{ConfigStore, RunConfig};
use crate::kv::KeyValueStore;
use crate::providers::GenerationClient;
use crate::scheduler::{BatchScheduler, CancelToken, ProgressSender};
use crate::{BulkGenFoot, RunState};

/// Backend state owned by the event loop
pub struct BulkGenBackendState
{   pub config_store: ConfigStore
  , pub config: RunConfig
  , pub scheduler: Arc<BatchScheduler>
  , pub client: Arc<dyn GenerationClient>
  , pub cancel: Option<CancelToken>
  , pub last_prompts: Vec<String>
}

impl BulkGenBackendState
{   /// Load the persisted configuration, falling back to defaults
    /// when the medium cannot be read
    pub fn new(
      config_store: ConfigStore
    , scheduler: Arc<BatchScheduler>
    , client: Arc<dyn GenerationClient>
    ) -> Self
    {   debug!("Initializing BulkGenBackendState");
        let config = config_store.load().unwrap_or_else(|e| {
          error!("Failed to load configuration, using defaults: {}", e);
          RunConfig::default()
        });
        BulkGenBackendState
        {   config_store
          , config
          , scheduler
          , client
          , cancel: None
          , last_prompts: vec![]
        }
    }

    fn handle_generate(
      &mut self
    , raw_text: String
    , progress: Option<ProgressSender>
    , reply: crate::GenerateReplySender
    )
    {   let prompts = crate::prompt::parse(&raw_text);
        debug!("Generate requested for {} prompts", prompts.len());

        let active = match self.scheduler
          .start(prompts.clone(), self.config.clone())
        {   Ok(active) => active
          , Err(e) => {
              warn!("Generate rejected: {}", e);
              let _ = reply.send(Err(e));
              return;
            }
        };

        let cancel = CancelToken::new();
        self.cancel = Some(cancel.clone());
        self.last_prompts = prompts;
        let client = Arc::clone(&self.client);

        tokio::spawn(async move {
          let terminal = active
            .execute(&*client, progress, &cancel)
            .await;
          let _ = reply.send(Ok(terminal));
        });
    }

    fn handle_cancel(&mut self) -> bool
    {   match &self.cancel
        {   Some(cancel) if self.scheduler.is_running() => {
              cancel.cancel();
              true
            }
          , _ => false
        }
    }

    fn handle_save_config(&mut self, config: RunConfig)
      -> Result<(), crate::error::Error>
    {   self.config_store.save(&config)?;
        self.config = config;
        Ok(())
    }

    fn handle_export(&self) -> crate::ExportReply
    {   let state = self.scheduler.state();
        crate::export::records_for_state(&self.last_prompts, &state)
          .ok_or_else(|| crate::error::Error::Other(
            "no finished run to export".to_string()
          ))
    }
}

/// Public API for the bulkgen backend - owns the task
pub struct BulkGenBackend
{   hand: crate::BulkGenHand
  , scheduler: Arc<BatchScheduler>
  , _task_handle: tokio::task::JoinHandle<()>
}

impl BulkGenBackend
{   /// Create and spawn a new backend
    /// Returns immediately - spawns background task
    pub fn new(
      store: Box<dyn KeyValueStore>
    , client: Arc<dyn GenerationClient>
    ) -> Self
    {   debug!("Creating BulkGenBackend with task ownership");

        let (generate_tx, generate_rx)
          = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx)
          = mpsc::unbounded_channel();
        let (load_config_tx, load_config_rx)
          = mpsc::unbounded_channel();
        let (save_config_tx, save_config_rx)
          = mpsc::unbounded_channel();
        let (export_tx, export_rx)
          = mpsc::unbounded_channel();
        let (kill_process_tx, kill_process_rx)
          = mpsc::unbounded_channel();

        let hand = crate::BulkGenHand
        {   generate_tx
          , cancel_tx
          , load_config_tx
          , save_config_tx
          , export_tx
          , kill_process_tx
        };

        let foot = crate::BulkGenFoot
        {   generate_rx
          , cancel_rx
          , load_config_rx
          , save_config_rx
          , export_rx
          , kill_process_rx
        };

        let scheduler = Arc::new(BatchScheduler::new());
        let state = BulkGenBackendState::new(
          ConfigStore::new(store),
          Arc::clone(&scheduler),
          client
        );

        let _task_handle = tokio::spawn(async move {
          run_backend_loop(foot, state).await
        });

        BulkGenBackend
        {   hand
          , scheduler
          , _task_handle
        }
    }

    /// Watch run state changes
    pub fn subscribe(&self) -> watch::Receiver<RunState>
    {   self.scheduler.subscribe()
    }

    /// Snapshot of the current run state
    pub fn state(&self) -> RunState
    {   self.scheduler.state()
    }

    /// Start a run over `raw_text` - returns almost immediately.
    /// The reply carries the terminal state once the run ends.
    pub async fn generate(
      &self
    , raw_text: String
    , progress: Option<ProgressSender>
    ) -> Result<
        mpsc::UnboundedReceiver<crate::GenerateReply>,
        crate::error::Error
      >
    {   debug!("generate queuing {} bytes of prompts", raw_text.len());
        let (reply_tx, reply_rx)
          = mpsc::unbounded_channel();

        let cmd = crate::GenerateArgs
        {   raw_text
          , progress
          , reply: reply_tx
        };

        self.hand.generate_tx
          .send(cmd)
          .map_err(|_| disconnected())?;

        Ok(reply_rx)
    }

    /// Ask the active run to stop after its current batch
    pub async fn cancel(
      &self
    ) -> Result<
        mpsc::UnboundedReceiver<crate::CancelReply>,
        crate::error::Error
      >
    {   debug!("cancel queuing command");
        let (reply_tx, reply_rx)
          = mpsc::unbounded_channel();

        self.hand.cancel_tx
          .send(crate::CancelArgs { reply: reply_tx })
          .map_err(|_| disconnected())?;

        Ok(reply_rx)
    }

    /// Current configuration - returns almost immediately
    pub async fn load_config(
      &self
    ) -> Result<
        mpsc::UnboundedReceiver<crate::LoadConfigReply>,
        crate::error::Error
      >
    {   debug!("load_config queuing command");
        let (reply_tx, reply_rx)
          = mpsc::unbounded_channel();

        self.hand.load_config_tx
          .send(crate::LoadConfigArgs { reply: reply_tx })
          .map_err(|_| disconnected())?;

        Ok(reply_rx)
    }

    /// Persist and adopt `config` - returns almost immediately
    pub async fn save_config(
      &self
    , config: RunConfig
    ) -> Result<
        mpsc::UnboundedReceiver<crate::SaveConfigReply>,
        crate::error::Error
      >
    {   debug!("save_config queuing command");
        let (reply_tx, reply_rx)
          = mpsc::unbounded_channel();

        let cmd = crate::SaveConfigArgs
        {   config
          , reply: reply_tx
        };

        self.hand.save_config_tx
          .send(cmd)
          .map_err(|_| disconnected())?;

        Ok(reply_rx)
    }

    /// Records of the last finished run
    pub async fn export(
      &self
    ) -> Result<
        mpsc::UnboundedReceiver<crate::ExportReply>,
        crate::error::Error
      >
    {   debug!("export queuing command");
        let (reply_tx, reply_rx)
          = mpsc::unbounded_channel();

        self.hand.export_tx
          .send(crate::ExportArgs { reply: reply_tx })
          .map_err(|_| disconnected())?;

        Ok(reply_rx)
    }

    /// Gracefully shutdown the backend, cancelling any active run
    pub async fn shutdown(self)
      -> Result<(), crate::error::Error>
    {   debug!("Shutting down BulkGenBackend");
        let (reply_tx, mut reply_rx)
          = mpsc::unbounded_channel();

        let cmd = crate::KillProcessArgs
        {   reply: reply_tx
        };

        self.hand.kill_process_tx
          .send(cmd)
          .map_err(|_| {
            error!("Backend channel already closed");
            crate::error::Error::Other(
              "Backend already shutdown".to_string()
            )
          })?;

        // Wait for shutdown confirmation
        if let Some(result) = reply_rx.recv().await
        {   debug!("Backend shutdown confirmed");
            result
        } else
        {   error!("Backend dropped shutdown reply");
            Err(crate::error::Error::Other(
              "Backend disconnected".to_string()
            ))
        }
    }
}

fn disconnected() -> crate::error::Error
{   error!("Backend channel closed");
    crate::error::Error::Other(
      "Backend disconnected".to_string()
    )
}

/// Main backend event loop
///
/// Each select arm handles its command without waiting on a run:
/// generation is claimed synchronously, then executed on its own
/// task so cancel and status commands stay responsive.
async fn run_backend_loop(
  foot: BulkGenFoot
, mut state: BulkGenBackendState
)
{   debug!("Starting BulkGenBackend event loop");
    let BulkGenFoot
    {   mut generate_rx
      , mut cancel_rx
      , mut load_config_rx
      , mut save_config_rx
      , mut export_rx
      , mut kill_process_rx
    } = foot;

    loop
    { tokio::select!
      { Some(cmd) = generate_rx.recv() => {
          let crate::GenerateArgs { raw_text, progress, reply } = cmd;
          state.handle_generate(raw_text, progress, reply);
        }
      , Some(cmd) = cancel_rx.recv() => {
          debug!("Received Cancel");
          let signalled = state.handle_cancel();
          let _ = cmd.reply.send(Ok(signalled));
        }
      , Some(cmd) = load_config_rx.recv() => {
          debug!("Received LoadConfig");
          let _ = cmd.reply.send(Ok(state.config.clone()));
        }
      , Some(cmd) = save_config_rx.recv() => {
          debug!("Received SaveConfig");
          let result = state.handle_save_config(cmd.config);
          let _ = cmd.reply.send(result);
        }
      , Some(cmd) = export_rx.recv() => {
          debug!("Received Export");
          let _ = cmd.reply.send(state.handle_export());
        }
      , Some(cmd) = kill_process_rx.recv() => {
          debug!("Received KillProcess");
          state.handle_cancel();
          let _ = cmd.reply.send(Ok(()));
          info!("BulkGenBackend shutting down");
          break;
        }
      , else => {
          debug!("All command channels closed");
          break;
        }
      }
    }
}
