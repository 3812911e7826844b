use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use clap::Parser;
use log::{error, info, warn};
use tokio::sync::mpsc;
use bulkgen::config::ConfigStore;
use bulkgen::kv::{FileStore, KeyValueStore, MemoryStore};
use bulkgen::providers::OpenAiClient;
use bulkgen::retry::{RetryPolicy, RetryingClient};
use bulkgen::{BulkGenBackend, Error, GenerationClient, RunState};

#[derive(Parser, Debug)]
#[command(
  name = "bulkgen"
, version
, about = "Generate one model response per prompt, in batches"
, long_about = "Reads prompts (one per line), sends them in batches to an \
    OpenAI-compatible completions endpoint and writes a JSON array of \
    {prompt, response} records. Partial results are written when a run \
    fails or is interrupted with Ctrl-C."
)]
struct Cli
{   /// Prompt file, one prompt per line ("-" reads stdin)
    #[arg(short, long, value_name = "PATH")]
    prompts: PathBuf
  , /// JSON export destination
    #[arg(short, long, default_value = "generated-data.json", value_name = "PATH")]
    output: PathBuf
  , /// Persisted configuration file
    #[arg(
      long
    , default_value = "bulkgen-config.json"
    , env = "BULKGEN_CONFIG"
    , value_name = "PATH"
    )]
    config: PathBuf
  , /// API credential
    #[arg(long, env = "BULKGEN_API_KEY", hide_env_values = true)]
    api_key: Option<String>
  , /// API base URL override
    #[arg(long, value_name = "URL")]
    base_url: Option<String>
  , /// Model identifier
    #[arg(short, long)]
    model: Option<String>
  , /// Sampling temperature (0.0 to 2.0)
    #[arg(short, long)]
    temperature: Option<f32>
  , /// Prompts per request
    #[arg(short, long)]
    batch_size: Option<usize>
  , /// Save the overrides above to the configuration file
    #[arg(long)]
    save: bool
  , /// Retries per batch on rate-limit and transport errors
    #[arg(long, default_value_t = 0)]
    retries: usize
  , /// Token limit per response
    #[arg(long)]
    max_tokens: Option<usize>
  , /// Per-request timeout in seconds
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64
}

#[tokio::main]
async fn main() -> ExitCode
{   env_logger::init();
    let cli = Cli::parse();

    match run(cli).await
    {   Ok(code) => code
      , Err(e) => {
          error!("{}", e);
          eprintln!("bulkgen: {}", e);
          ExitCode::FAILURE
        }
    }
}

fn read_raw_prompts(path: &Path) -> Result<String, Error>
{   if path.as_os_str() == "-"
    {   let mut raw = String::new();
        std::io::stdin().read_to_string(&mut raw)?;
        return Ok(raw);
    }
    std::fs::read_to_string(path)
      .map_err(|e| Error::Storage(format!("{}: {}", path.display(), e)))
}

async fn run(cli: Cli) -> Result<ExitCode, Error>
{   let raw = read_raw_prompts(&cli.prompts)?;
    info!("Loaded {} prompts", bulkgen::prompt::count(&raw));

    let file_store = ConfigStore::new(Box::new(FileStore::new(&cli.config)));
    let mut config = file_store.load()?;
    if let Some(key) = cli.api_key
    {   config.endpoint_credential = key;
    }
    if let Some(url) = cli.base_url
    {   config.base_url = Some(url);
    }
    if let Some(model) = cli.model
    {   config.model_id = model;
    }
    if let Some(temperature) = cli.temperature
    {   config.temperature = temperature;
    }
    if let Some(batch_size) = cli.batch_size
    {   config.batch_size = batch_size;
    }

    // Without --save the overrides only live for this run.
    let store: Box<dyn KeyValueStore> = if cli.save
    {   config.validate()?;
        file_store.save(&config)?;
        info!("Configuration saved to {}", cli.config.display());
        file_store.into_inner()
    } else
    {   let seeded = ConfigStore::new(Box::new(MemoryStore::new()));
        seeded.save(&config)?;
        seeded.into_inner()
    };

    let mut http = OpenAiClient::with_timeout(
      Duration::from_secs(cli.timeout_secs)
    )?;
    if let Some(max_tokens) = cli.max_tokens
    {   http = http.with_max_tokens(max_tokens);
    }
    let client: Arc<dyn GenerationClient> = if cli.retries > 0
    {   let policy = RetryPolicy
        {   max_retries: cli.retries
          , ..RetryPolicy::default()
        };
        Arc::new(RetryingClient::new(http, policy))
    } else
    {   Arc::new(http)
    };

    let backend = BulkGenBackend::new(store, client);
    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
    let mut reply_rx = backend.generate(raw, Some(progress_tx)).await?;

    let reply = loop
    {   tokio::select!
        {   Some(progress) = progress_rx.recv() => {
              info!(
                "{}/{} prompts done ({:.0}%)",
                progress.completed,
                progress.total,
                progress.fraction * 100.0
              );
            }
            _ = tokio::signal::ctrl_c() => {
              warn!("Interrupted, stopping after the current batch");
              backend.cancel().await?;
            }
            reply = reply_rx.recv() => {
              break reply.ok_or_else(|| {
                Error::Other("backend dropped the run".to_string())
              })?;
            }
        }
    };
    let terminal = reply?;

    let mut export_rx = backend.export().await?;
    let records = export_rx
      .recv()
      .await
      .ok_or_else(|| Error::Other("backend dropped the export".to_string()))??;
    bulkgen::export::write_json_file(&cli.output, &records)?;

    let code = match &terminal
    {   RunState::Completed(result) => {
          info!("Wrote {} responses to {}", result.len(), cli.output.display());
          ExitCode::SUCCESS
        }
      , RunState::Failed { error, partial } => {
          let done = partial.iter().filter(|r| !r.is_empty()).count();
          warn!(
            "Run failed ({}); wrote partial results ({} of {}) to {}",
            error, done, partial.len(), cli.output.display()
          );
          eprintln!("bulkgen: {}", error);
          ExitCode::FAILURE
        }
      , other => {
          error!("Unexpected state after run: {:?}", other);
          ExitCode::FAILURE
        }
    };

    backend.shutdown().await?;
    Ok(code)
}
