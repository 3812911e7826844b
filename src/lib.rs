pub mod error;
pub mod kv;
pub mod config;
pub mod prompt;
pub mod request;
pub mod providers;
pub mod retry;
pub mod scheduler;
pub mod export;
pub mod client;

pub use client::BulkGenBackend;
pub use config::{ConfigStore, RunConfig};
pub use error::Error;
pub use export::ExportRecord;
pub use providers::GenerationClient;
pub use scheduler::{BatchScheduler, CancelToken};

/*

bulkgen turns a list of prompts into a list of responses by
sending them, a batch at a time, to a text-generation API.

bulkgen/
├── Cargo.toml
├── src/
│   ├── lib.rs          # Backend command API and run state
│   ├── error.rs        # Error taxonomy
│   ├── kv.rs           # Key-value media (memory, json file)
│   ├── config.rs       # RunConfig and its persistent store
│   ├── prompt.rs       # Raw text -> prompt list
│   ├── request.rs      # Provider-neutral request/response
│   ├── providers/      # GenerationClient trait + clients
│   ├── retry.rs        # Caller-level retry wrapper
│   ├── scheduler.rs    # Sequential batch engine
│   ├── export.rs       # Prompt/response records, JSON export
│   ├── client.rs       # Backend task owning store + engine
│   └── bin/bulkgen.rs  # Command-line front end
└── tests/

*/

/// BULKGEN BACKEND INTERFACE:

// ===== Generate =====

pub type GenerateReply = Result<RunState, crate::error::Error>;
pub type GenerateReplySender
  = tokio::sync::mpsc::UnboundedSender<GenerateReply>;

pub struct GenerateArgs
{   pub raw_text: String
  , pub progress: Option<crate::scheduler::ProgressSender>
  , pub reply: GenerateReplySender
}

// ===== Cancel =====

/// `Ok(true)` when an active run was signalled
pub type CancelReply = Result<bool, crate::error::Error>;
pub type CancelReplySender
  = tokio::sync::mpsc::UnboundedSender<CancelReply>;

pub struct CancelArgs
{   pub reply: CancelReplySender
}

// ===== LoadConfig =====

pub type LoadConfigReply
  = Result<crate::config::RunConfig, crate::error::Error>;
pub type LoadConfigReplySender
  = tokio::sync::mpsc::UnboundedSender<LoadConfigReply>;

pub struct LoadConfigArgs
{   pub reply: LoadConfigReplySender
}

// ===== SaveConfig =====

pub type SaveConfigReply = Result<(), crate::error::Error>;
pub type SaveConfigReplySender
  = tokio::sync::mpsc::UnboundedSender<SaveConfigReply>;

pub struct SaveConfigArgs
{   pub config: crate::config::RunConfig
  , pub reply: SaveConfigReplySender
}

// ===== Export =====

pub type ExportReply
  = Result<Vec<crate::export::ExportRecord>, crate::error::Error>;
pub type ExportReplySender
  = tokio::sync::mpsc::UnboundedSender<ExportReply>;

pub struct ExportArgs
{   pub reply: ExportReplySender
}

// ===== KillProcess =====

pub type KillProcessReply = Result<(), crate::error::Error>;
pub type KillProcessReplySender
  = tokio::sync::mpsc::UnboundedSender<KillProcessReply>;

pub struct KillProcessArgs
{   pub reply: KillProcessReplySender
}

// ===== BulkGenHand (sender side) =====

pub struct BulkGenHand
{   pub generate_tx
      : tokio::sync::mpsc::UnboundedSender<GenerateArgs>
  , pub cancel_tx
      : tokio::sync::mpsc::UnboundedSender<CancelArgs>
  , pub load_config_tx
      : tokio::sync::mpsc::UnboundedSender<LoadConfigArgs>
  , pub save_config_tx
      : tokio::sync::mpsc::UnboundedSender<SaveConfigArgs>
  , pub export_tx
      : tokio::sync::mpsc::UnboundedSender<ExportArgs>
  , pub kill_process_tx
      : tokio::sync::mpsc::UnboundedSender<KillProcessArgs>
}

// ===== BulkGenFoot (receiver side) =====

pub struct BulkGenFoot
{   pub generate_rx
      : tokio::sync::mpsc::UnboundedReceiver<GenerateArgs>
  , pub cancel_rx
      : tokio::sync::mpsc::UnboundedReceiver<CancelArgs>
  , pub load_config_rx
      : tokio::sync::mpsc::UnboundedReceiver<LoadConfigArgs>
  , pub save_config_rx
      : tokio::sync::mpsc::UnboundedReceiver<SaveConfigArgs>
  , pub export_rx
      : tokio::sync::mpsc::UnboundedReceiver<ExportArgs>
  , pub kill_process_rx
      : tokio::sync::mpsc::UnboundedReceiver<KillProcessArgs>
}

/// BULKGEN STRUCTURES:

/// Execution status of the batch engine
#[derive(Debug, Clone, PartialEq)]
pub enum RunState
{   /// No run since creation or the last reset
    Idle
  , /// Batches are being dispatched
    Running
    {   /// `completed / total`, 0.0 to 1.0
        progress: f64
      , completed: usize
      , total: usize
    }
  , /// Every batch succeeded; one response per prompt
    Completed(Vec<String>)
  , /// Stopped early; unprocessed slots are empty strings
    Failed
    {   error: crate::error::Error
      , partial: Vec<String>
    }
}

impl RunState
{   pub fn is_running(&self) -> bool
    {   matches!(self, RunState::Running { .. })
    }

    pub fn is_terminal(&self) -> bool
    {   matches!(self, RunState::Completed(_) | RunState::Failed { .. })
    }

    /// Responses gathered by a finished run
    pub fn responses(&self) -> Option<&[String]>
    {   match self
        {   RunState::Completed(result) => Some(result)
          , RunState::Failed { partial, .. } => Some(partial)
          , _ => None
        }
    }

    pub fn error(&self) -> Option<&crate::error::Error>
    {   match self
        {   RunState::Failed { error, .. } => Some(error)
          , _ => None
        }
    }
}

/// One progress notification, sent after each finished batch
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress
{   pub completed: usize
  , pub total: usize
  , pub fraction: f64
}
