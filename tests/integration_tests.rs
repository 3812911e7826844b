use std::sync::Arc;
use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};
use tokio_test::{assert_err, assert_ok};
use bulkgen::config::{ConfigStore, RunConfig};
use bulkgen::export::{self, ExportRecord};
use bulkgen::kv::{FileStore, KeyValueStore, MemoryStore};
use bulkgen::providers::{FakeClient, GenerationClient, OpenAiClient};
use bulkgen::retry::{RetryPolicy, RetryingClient};
use bulkgen::scheduler::{partition, BatchScheduler, CancelToken};
use bulkgen::{prompt, BulkGenBackend, Error, Progress, RunState};

fn strings(items: &[&str]) -> Vec<String>
{   items.iter().map(|s| s.to_string()).collect()
}

fn config(batch_size: usize) -> RunConfig
{   RunConfig
    {   endpoint_credential: "sk-test".to_string()
      , batch_size
      , ..RunConfig::default()
    }
}

/// Blocks every call until released, announcing entry first
struct GatedClient
{   entered: Notify
  , release: Notify
}

impl GatedClient
{   fn new() -> Self
    {   GatedClient
        {   entered: Notify::new()
          , release: Notify::new()
        }
    }
}

#[async_trait]
impl GenerationClient for GatedClient
{   fn name(&self) -> &'static str
    {   "gated"
    }

    async fn generate(
      &self
    , batch: &[String]
    , _config: &RunConfig
    ) -> Result<Vec<String>, Error>
    {   self.entered.notify_one();
        self.release.notified().await;
        Ok(batch.iter().map(|p| format!("R:{}", p)).collect())
    }
}

/// Requests cancellation while answering its first batch
struct CancellingClient
{   token: CancelToken
  , inner: FakeClient
}

#[async_trait]
impl GenerationClient for CancellingClient
{   fn name(&self) -> &'static str
    {   "cancelling"
    }

    async fn generate(
      &self
    , batch: &[String]
    , config: &RunConfig
    ) -> Result<Vec<String>, Error>
    {   self.token.cancel();
        self.inner.generate(batch, config).await
    }
}

/// Answers with one response too few
struct ShortClient;

#[async_trait]
impl GenerationClient for ShortClient
{   fn name(&self) -> &'static str
    {   "short"
    }

    async fn generate(
      &self
    , batch: &[String]
    , _config: &RunConfig
    ) -> Result<Vec<String>, Error>
    {   Ok(batch.iter().skip(1).cloned().collect())
    }
}

// ===== Prompt parsing =====

#[test]
fn test_parse_trims_and_drops_blank_lines()
{   let raw = "  first \n\n\t\nsecond\r\nthird\rfirst\n   ";
    assert_eq!(
      prompt::parse(raw),
      strings(&["first", "second", "third", "first"])
    );
    assert_eq!(prompt::count(raw), 4);
    assert!(prompt::parse("").is_empty());
    assert!(prompt::parse("\n \r\n\t").is_empty());
}

#[test]
fn test_parse_is_idempotent()
{   let inputs = [
      ""
    , "one"
    , "a\n\nb\n"
    , "\r\n  x  \r\n y\r\n\r\n"
    , "dup\ndup\n dup "
    ];
    for raw in inputs
    {   let once = prompt::parse(raw);
        for entry in &once
        {   assert!(!entry.trim().is_empty());
        }
        let again = prompt::parse(&prompt::join(&once));
        assert_eq!(once, again, "not a fixed point for {:?}", raw);
    }
}

#[test]
fn test_prompt_file_round_trip()
{   let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("prompts.txt");
    let prompts = strings(&["alpha", "beta", "gamma"]);

    assert_ok!(prompt::write_prompt_file(&path, &prompts));
    let read = assert_ok!(prompt::read_prompt_file(&path));
    assert_eq!(read, prompts);

    let missing = prompt::read_prompt_file(&dir.path().join("nope.txt"));
    assert!(matches!(missing, Err(Error::Storage(_))));
}

// ===== Partitioning =====

#[test]
fn test_partition_covers_prompts_exactly()
{   for n in 0usize..12
    {   let prompts: Vec<String>
          = (0..n).map(|i| format!("p{}", i)).collect();
        for batch_size in 1..7
        {   let batches = partition(&prompts, batch_size);
            assert_eq!(batches.len(), n.div_ceil(batch_size));

            let (last, init) = match batches.split_last()
            {   Some(split) => split
              , None => continue
            };
            for batch in init
            {   assert_eq!(batch.len(), batch_size);
            }
            assert!(!last.is_empty() && last.len() <= batch_size);

            let joined: Vec<String> = batches.concat();
            assert_eq!(joined, prompts);
        }
    }
}

// ===== Batch scheduler =====

#[tokio::test]
async fn test_run_completes_with_ordered_progress()
{   let scheduler = BatchScheduler::new();
    let client = FakeClient::echo();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let terminal = scheduler
      .run_with(
        &strings(&["a", "b", "c"]),
        &config(2),
        &client,
        Some(tx),
        &CancelToken::new()
      )
      .await;

    assert_eq!(
      terminal,
      Ok(RunState::Completed(strings(&["R:a", "R:b", "R:c"])))
    );
    assert_eq!(scheduler.state(), terminal.unwrap());
    assert_eq!(
      client.batches(),
      vec![strings(&["a", "b"]), strings(&["c"])]
    );

    let mut events = vec![];
    while let Some(event) = rx.recv().await
    {   events.push(event);
    }
    assert_eq!(
      events,
      vec![
        Progress { completed: 2, total: 3, fraction: 2.0 / 3.0 }
      , Progress { completed: 3, total: 3, fraction: 1.0 }
      ]
    );
}

#[tokio::test]
async fn test_client_receives_every_prompt_in_ceil_batches()
{   let scheduler = BatchScheduler::new();
    for n in 0usize..10
    {   let prompts: Vec<String>
          = (0..n).map(|i| format!("p{}", i)).collect();
        for batch_size in 1..6
        {   let client = FakeClient::echo();
            let terminal = assert_ok!(
              scheduler.run(&prompts, &config(batch_size), &client).await
            );
            assert!(matches!(terminal, RunState::Completed(_)));

            let batches = client.batches();
            assert_eq!(batches.len(), n.div_ceil(batch_size));
            assert!(batches.iter().all(|b| !b.is_empty() && b.len() <= batch_size));
            assert_eq!(batches.concat(), prompts);
        }
    }
}

#[tokio::test]
async fn test_failed_batch_keeps_partial_results()
{   let scheduler = BatchScheduler::new();
    let client = FakeClient::echo()
      .failing_on(1, Error::Transport("connection reset".to_string()));

    let terminal = scheduler
      .run(&strings(&["a", "b", "c", "d"]), &config(2), &client)
      .await;

    assert_eq!(
      terminal,
      Ok(RunState::Failed
      {   error: Error::Transport("connection reset".to_string())
        , partial: strings(&["R:a", "R:b", "", ""])
      })
    );
    assert_eq!(client.calls(), 2);
}

#[tokio::test]
async fn test_failure_on_later_batch_stops_immediately()
{   let scheduler = BatchScheduler::new();
    let client = FakeClient::echo()
      .failing_on(1, Error::RateLimit("slow down".to_string()));

    let terminal = assert_ok!(
      scheduler
        .run(&strings(&["a", "b", "c", "d", "e"]), &config(1), &client)
        .await
    );

    assert_eq!(client.calls(), 2);
    assert!(terminal.is_terminal());
    assert_eq!(
      terminal.responses(),
      Some(&strings(&["R:a", "", "", "", ""])[..])
    );
    assert!(terminal.error().is_some_and(Error::is_retryable));
}

#[tokio::test]
async fn test_batch_size_edges()
{   let scheduler = BatchScheduler::new();
    let prompts = strings(&["a", "b", "c"]);

    for batch_size in [3, 10]
    {   let client = FakeClient::echo();
        let terminal = scheduler
          .run(&prompts, &config(batch_size), &client)
          .await;
        assert_eq!(
          terminal,
          Ok(RunState::Completed(strings(&["R:a", "R:b", "R:c"])))
        );
        assert_eq!(client.calls(), 1);
    }
}

#[tokio::test]
async fn test_missing_credential_is_rejected_before_running()
{   let scheduler = BatchScheduler::new();
    let client = FakeClient::echo();
    let no_key = RunConfig::default();

    let result = scheduler
      .run(&strings(&["a"]), &no_key, &client)
      .await;

    assert!(matches!(result, Err(Error::Configuration(_))));
    assert_eq!(scheduler.state(), RunState::Idle);
    assert_eq!(client.calls(), 0);

    let zero_batch = scheduler
      .run(&strings(&["a"]), &config(0), &client)
      .await;
    assert!(matches!(zero_batch, Err(Error::Configuration(_))));
}

#[tokio::test]
async fn test_empty_prompt_list_completes_immediately()
{   let scheduler = BatchScheduler::new();
    let client = FakeClient::echo();

    let terminal = scheduler.run(&[], &config(5), &client).await;

    assert_eq!(terminal, Ok(RunState::Completed(vec![])));
    assert_eq!(client.calls(), 0);
}

#[tokio::test]
async fn test_second_run_while_running_is_rejected()
{   let scheduler = Arc::new(BatchScheduler::new());
    let gate = Arc::new(GatedClient::new());

    let first = {
      let scheduler = Arc::clone(&scheduler);
      let gate = Arc::clone(&gate);
      tokio::spawn(async move {
        scheduler
          .run(&strings(&["a", "b"]), &config(2), &*gate)
          .await
      })
    };

    gate.entered.notified().await;
    let in_flight = scheduler.state();
    assert_eq!(
      in_flight,
      RunState::Running { progress: 0.0, completed: 0, total: 2 }
    );

    let echo = FakeClient::echo();
    let second = scheduler
      .run(&strings(&["x"]), &config(1), &echo)
      .await;
    assert_eq!(second, Err(Error::ConcurrentRun));
    assert_eq!(scheduler.state(), in_flight);
    assert_eq!(echo.calls(), 0);
    assert_err!(scheduler.reset());

    gate.release.notify_one();
    let terminal = first.await.unwrap();
    assert_eq!(
      terminal,
      Ok(RunState::Completed(strings(&["R:a", "R:b"])))
    );

    assert_ok!(scheduler.reset());
    assert_eq!(scheduler.state(), RunState::Idle);
}

#[tokio::test]
async fn test_cancel_is_honoured_between_batches()
{   let scheduler = BatchScheduler::new();
    let token = CancelToken::new();
    let client = CancellingClient
    {   token: token.clone()
      , inner: FakeClient::echo()
    };

    let terminal = scheduler
      .run_with(
        &strings(&["a", "b", "c", "d"]),
        &config(2),
        &client,
        None,
        &token
      )
      .await;

    assert_eq!(
      terminal,
      Ok(RunState::Failed
      {   error: Error::Cancelled
        , partial: strings(&["R:a", "R:b", "", ""])
      })
    );
    assert_eq!(client.inner.calls(), 1);
}

#[tokio::test]
async fn test_cancel_before_first_batch()
{   let scheduler = BatchScheduler::new();
    let client = FakeClient::echo();
    let token = CancelToken::new();
    token.cancel();

    let terminal = scheduler
      .run_with(&strings(&["a", "b"]), &config(1), &client, None, &token)
      .await;

    assert_eq!(
      terminal,
      Ok(RunState::Failed
      {   error: Error::Cancelled
        , partial: strings(&["", ""])
      })
    );
    assert_eq!(client.calls(), 0);
}

#[tokio::test]
async fn test_response_count_mismatch_is_provider_error()
{   let scheduler = BatchScheduler::new();

    let terminal = assert_ok!(
      scheduler
        .run(&strings(&["a", "b", "c"]), &config(2), &ShortClient)
        .await
    );

    assert!(matches!(terminal.error(), Some(Error::Provider(_))));
    assert_eq!(terminal.responses(), Some(&strings(&["", "", ""])[..]));
}

#[tokio::test]
async fn test_dropped_run_is_recorded_as_cancelled()
{   let scheduler = BatchScheduler::new();
    let mut watcher = scheduler.subscribe();

    let active = assert_ok!(
      scheduler.start(strings(&["a", "b"]), config(1))
    );
    assert!(scheduler.is_running());
    assert_eq!(active.total(), 2);
    drop(active);

    assert!(watcher.has_changed().unwrap());
    assert_eq!(
      *watcher.borrow_and_update(),
      RunState::Failed
      {   error: Error::Cancelled
        , partial: strings(&["", ""])
      }
    );

    // the engine is free again
    let terminal = scheduler
      .run(&strings(&["c"]), &config(1), &FakeClient::echo())
      .await;
    assert_eq!(terminal, Ok(RunState::Completed(strings(&["R:c"]))));
}

// ===== Result export =====

#[test]
fn test_export_records_from_partial_result()
{   let records = export::to_export_records(
      &strings(&["x", "y"]),
      &strings(&["R:x", ""])
    );
    let expected = vec![
      ExportRecord { prompt: "x".to_string(), response: "R:x".to_string() }
    , ExportRecord { prompt: "y".to_string(), response: String::new() }
    ];
    assert_eq!(records, expected);

    let json = assert_ok!(export::serialize_json(&records));
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(
      value,
      serde_json::json!([
        { "prompt": "x", "response": "R:x" },
        { "prompt": "y", "response": "" }
      ])
    );
    assert_eq!(assert_ok!(export::parse_json(&json)), expected);
    assert!(json.contains('\n'), "export should be pretty-printed");
}

#[test]
fn test_export_pads_short_results()
{   let records = export::to_export_records(
      &strings(&["a", "b", "c"]),
      &strings(&["R:a"])
    );
    assert_eq!(records.len(), 3);
    assert_eq!(records[2].response, "");
    assert_eq!(
      export::serialize_text(&strings(&["a", "b"])),
      "a\nb"
    );
}

#[test]
fn test_records_only_for_finished_runs()
{   let prompts = strings(&["a"]);
    assert!(export::records_for_state(&prompts, &RunState::Idle).is_none());
    assert!(export::records_for_state(
      &prompts,
      &RunState::Running { progress: 0.0, completed: 0, total: 1 }
    ).is_none());

    let failed = RunState::Failed
    {   error: Error::Cancelled
      , partial: strings(&[""])
    };
    let records = export::records_for_state(&prompts, &failed).unwrap();
    assert_eq!(records[0].response, "");
}

#[test]
fn test_write_json_file()
{   let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out").join("generated-data.json");
    let records = export::to_export_records(
      &strings(&["q"]),
      &strings(&["a"])
    );

    assert_ok!(export::write_json_file(&path, &records));
    let text = std::fs::read_to_string(&path).unwrap();
    assert_eq!(assert_ok!(export::parse_json(&text)), records);
}

// ===== Configuration store =====

#[test]
fn test_load_without_record_returns_defaults()
{   let store = ConfigStore::new(Box::new(MemoryStore::new()));
    let loaded = assert_ok!(store.load());

    assert_eq!(loaded, RunConfig::default());
    assert_eq!(loaded.temperature, 0.7);
    assert_eq!(loaded.batch_size, 5);
    assert!(loaded.endpoint_credential.is_empty());
    assert!(loaded.base_url.is_none());
}

#[test]
fn test_save_then_load_round_trips()
{   let saved = RunConfig
    {   endpoint_credential: "sk-secret".to_string()
      , base_url: Some("http://localhost:8080/v1".to_string())
      , model_id: "my-model".to_string()
      , temperature: 1.3
      , batch_size: 12
    };

    let memory = ConfigStore::new(Box::new(MemoryStore::new()));
    assert_ok!(memory.save(&saved));
    assert_eq!(assert_ok!(memory.load()), saved);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    let file = ConfigStore::new(Box::new(FileStore::new(&path)));
    assert_ok!(file.save(&saved));

    let reopened = ConfigStore::new(Box::new(FileStore::new(&path)));
    assert_eq!(assert_ok!(reopened.load()), saved);

    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.contains("bulkgen.endpointCredential"));

    assert_ok!(reopened.clear_credential());
    let cleared = assert_ok!(reopened.load());
    assert!(!cleared.has_credential());
    assert_eq!(cleared.model_id, "my-model");
}

#[test]
fn test_quota_failure_leaves_previous_record()
{   let store = ConfigStore::new(Box::new(MemoryStore::with_quota(200)));
    let first = RunConfig
    {   endpoint_credential: "sk-small".to_string()
      , ..RunConfig::default()
    };
    assert_ok!(store.save(&first));

    let oversized = RunConfig
    {   endpoint_credential: "x".repeat(500)
      , batch_size: 9
      , ..RunConfig::default()
    };
    let result = store.save(&oversized);
    assert!(matches!(result, Err(Error::Storage(_))));
    assert_eq!(assert_ok!(store.load()), first);
}

#[test]
fn test_unparseable_values_fall_back_to_defaults()
{   let kv = MemoryStore::new();
    assert_ok!(kv.put_all(&[
      ("bulkgen.temperature", Some("warm".to_string()))
    , ("bulkgen.batchSize", Some("many".to_string()))
    , ("bulkgen.endpointCredential", Some("sk".to_string()))
    ]));

    let loaded = assert_ok!(ConfigStore::new(Box::new(kv)).load());
    assert_eq!(loaded.temperature, 0.7);
    assert_eq!(loaded.batch_size, 5);
    assert_eq!(loaded.endpoint_credential, "sk");
}

#[test]
fn test_out_of_range_values_load_as_saved_and_fail_validation()
{   let saved = RunConfig
    {   endpoint_credential: "sk".to_string()
      , base_url: Some(String::new())
      , model_id: String::new()
      , temperature: 2.5
      , batch_size: 0
    };

    let memory = ConfigStore::new(Box::new(MemoryStore::new()));
    assert_ok!(memory.save(&saved));
    let loaded = assert_ok!(memory.load());
    assert_eq!(loaded, saved);
    assert!(matches!(loaded.validate(), Err(Error::Configuration(_))));

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    let file = ConfigStore::new(Box::new(FileStore::new(&path)));
    assert_ok!(file.save(&saved));
    assert_eq!(assert_ok!(file.load()), saved);

    let unset = RunConfig { base_url: None, ..saved };
    assert_ok!(file.save(&unset));
    assert_eq!(assert_ok!(file.load()), unset);

    for broken in [
      RunConfig { model_id: " ".to_string(), ..config(1) }
    , RunConfig { base_url: Some(String::new()), ..config(1) }
    , RunConfig { temperature: -0.1, ..config(1) }
    , config(0)
    ]
    {   assert!(matches!(broken.validate(), Err(Error::Configuration(_))));
    }
}

#[test]
fn test_file_store_reads_one_snapshot()
{   let dir = tempfile::tempdir().unwrap();
    let store = FileStore::new(dir.path().join("kv.json"));
    assert_eq!(assert_ok!(store.get_many(&["a", "b"])), vec![None, None]);

    assert_ok!(store.put_all(&[
      ("a", Some("1".to_string()))
    , ("b", Some("2".to_string()))
    ]));
    assert_ok!(store.put_all(&[("a", None)]));

    assert_eq!(
      assert_ok!(store.get_many(&["b", "a", "missing"])),
      vec![Some("2".to_string()), None, None]
    );
    assert_eq!(assert_ok!(store.get("b")), Some("2".to_string()));
}

#[test]
fn test_corrupt_config_file_is_a_storage_error()
{   let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(&path, "{ not json").unwrap();

    let store = ConfigStore::new(Box::new(FileStore::new(&path)));
    assert!(matches!(store.load(), Err(Error::Storage(_))));
}

#[test]
fn test_config_validation_and_redaction()
{   assert_ok!(config(1).validate());

    let hot = RunConfig { temperature: 2.5, ..config(1) };
    assert!(matches!(hot.validate(), Err(Error::Configuration(_))));

    let debug = format!("{:?}", config(1));
    assert!(!debug.contains("sk-test"));
    assert!(debug.contains("<redacted>"));
}

// ===== Retry wrapper =====

#[test]
fn test_backoff_grows_exponentially()
{   let policy = RetryPolicy::default();
    assert_eq!(policy.backoff_for_attempt(0).as_millis(), 100);
    assert_eq!(policy.backoff_for_attempt(1).as_millis(), 200);
    assert_eq!(policy.backoff_for_attempt(2).as_millis(), 400);
}

#[tokio::test]
async fn test_retrying_client_retries_rate_limits_only()
{   let flaky = RetryingClient::new(
      FakeClient::echo()
        .failing_on(0, Error::RateLimit("429".to_string())),
      RetryPolicy::new(2, 1.0, 1)
    );
    let answer = flaky.generate(&strings(&["a"]), &config(1)).await;
    assert_eq!(answer, Ok(strings(&["R:a"])));
    assert_eq!(flaky.inner().calls(), 2);

    let denied = RetryingClient::new(
      FakeClient::echo()
        .failing_on(0, Error::Authentication("bad key".to_string())),
      RetryPolicy::new(2, 1.0, 1)
    );
    let answer = denied.generate(&strings(&["a"]), &config(1)).await;
    assert!(matches!(answer, Err(Error::Authentication(_))));
    assert_eq!(denied.inner().calls(), 1);
}

// ===== OpenAI-compatible client =====

fn http_config(base_url: String, batch_size: usize) -> RunConfig
{   RunConfig
    {   base_url: Some(base_url)
      , model_id: "test-model".to_string()
      , ..config(batch_size)
    }
}

#[tokio::test]
async fn test_openai_client_orders_choices()
{   let mut server = mockito::Server::new_async().await;
    let mock = server
      .mock("POST", "/completions")
      .match_header("authorization", "Bearer sk-test")
      .match_body(mockito::Matcher::PartialJson(serde_json::json!({
        "model": "test-model",
        "prompt": ["a", "b"]
      })))
      .with_status(200)
      .with_header("content-type", "application/json")
      .with_body(r#"{
        "model": "test-model",
        "choices": [
          {"text": "second", "index": 1, "finish_reason": "stop"},
          {"text": "first", "index": 0, "finish_reason": "stop"}
        ],
        "usage": {"total_tokens": 12}
      }"#)
      .create_async()
      .await;

    let client = OpenAiClient::new().unwrap();
    let answer = client
      .generate(&strings(&["a", "b"]), &http_config(server.url(), 2))
      .await;

    assert_eq!(answer, Ok(strings(&["first", "second"])));
    mock.assert_async().await;
}

#[tokio::test]
async fn test_openai_client_maps_status_codes()
{   let mut server = mockito::Server::new_async().await;
    let cases = [
      (401, "auth")
    , (429, "rate-limit")
    , (500, "provider")
    ];

    for (status, kind) in cases
    {   let mock = server
          .mock("POST", "/completions")
          .with_status(status)
          .with_body(r#"{"error":{"message":"nope"}}"#)
          .create_async()
          .await;

        let client = OpenAiClient::new().unwrap();
        let err = client
          .generate(&strings(&["a"]), &http_config(server.url(), 1))
          .await
          .unwrap_err();
        assert_eq!(err.kind(), kind, "status {}", status);

        mock.remove_async().await;
    }
}

#[tokio::test]
async fn test_openai_client_rejects_malformed_body()
{   let mut server = mockito::Server::new_async().await;
    let _mock = server
      .mock("POST", "/completions")
      .with_status(200)
      .with_body("not json at all")
      .create_async()
      .await;

    let client = OpenAiClient::new().unwrap();
    let err = client
      .generate(&strings(&["a"]), &http_config(server.url(), 1))
      .await
      .unwrap_err();
    assert!(matches!(err, Error::Provider(_)));
}

#[tokio::test]
async fn test_openai_client_unreachable_host_is_transport_error()
{   let client = OpenAiClient::new().unwrap();
    let err = client
      .generate(
        &strings(&["a"]),
        &http_config("http://127.0.0.1:1".to_string(), 1)
      )
      .await
      .unwrap_err();
    assert!(matches!(err, Error::Transport(_)));
    assert!(err.is_retryable());
}

// ===== Backend =====

fn seeded_store(config: &RunConfig) -> Box<dyn KeyValueStore>
{   let store = ConfigStore::new(Box::new(MemoryStore::new()));
    store.save(config).unwrap();
    store.into_inner()
}

#[tokio::test]
async fn test_backend_generate_and_export()
{   let backend = BulkGenBackend::new(
      Box::new(MemoryStore::new()),
      Arc::new(FakeClient::echo())
    );

    let mut rx = backend.generate("a".to_string(), None).await.unwrap();
    let rejected = rx.recv().await.unwrap();
    assert!(matches!(rejected, Err(Error::Configuration(_))));

    let saved = config(2);
    let mut rx = backend.save_config(saved.clone()).await.unwrap();
    assert_eq!(rx.recv().await, Some(Ok(())));

    let mut rx = backend.load_config().await.unwrap();
    assert_eq!(rx.recv().await, Some(Ok(saved)));

    let mut rx = backend
      .generate("a\n\n  b \nc\n".to_string(), None)
      .await
      .unwrap();
    assert_eq!(
      rx.recv().await,
      Some(Ok(RunState::Completed(strings(&["R:a", "R:b", "R:c"]))))
    );
    assert_eq!(
      backend.state(),
      RunState::Completed(strings(&["R:a", "R:b", "R:c"]))
    );

    let mut rx = backend.export().await.unwrap();
    let records = rx.recv().await.unwrap().unwrap();
    assert_eq!(records.len(), 3);
    assert_eq!(records[1].prompt, "b");
    assert_eq!(records[1].response, "R:b");

    assert_ok!(backend.shutdown().await);
}

#[tokio::test]
async fn test_backend_cancel_and_concurrent_generate()
{   let gate = Arc::new(GatedClient::new());
    let backend = BulkGenBackend::new(
      seeded_store(&config(1)),
      gate.clone()
    );
    let mut watcher = backend.subscribe();

    let mut first = backend
      .generate("a\nb\nc".to_string(), None)
      .await
      .unwrap();
    gate.entered.notified().await;
    assert!(watcher.borrow_and_update().is_running());

    let mut second = backend.generate("z".to_string(), None).await.unwrap();
    assert_eq!(second.recv().await, Some(Err(Error::ConcurrentRun)));

    let mut cancelled = backend.cancel().await.unwrap();
    assert_eq!(cancelled.recv().await, Some(Ok(true)));
    gate.release.notify_one();

    assert_eq!(
      first.recv().await,
      Some(Ok(RunState::Failed
      {   error: Error::Cancelled
        , partial: strings(&["R:a", "", ""])
      }))
    );

    let mut rx = backend.export().await.unwrap();
    let records = rx.recv().await.unwrap().unwrap();
    assert_eq!(
      records.iter().map(|r| r.response.as_str()).collect::<Vec<_>>(),
      vec!["R:a", "", ""]
    );

    let mut idle_cancel = backend.cancel().await.unwrap();
    assert_eq!(idle_cancel.recv().await, Some(Ok(false)));

    assert_ok!(backend.shutdown().await);
}
