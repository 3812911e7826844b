//! Prompt/response pairing and export formats

use std::path::Path;
use serde::{Deserialize, Serialize};
use log::{debug, trace};
use crate::error::Error;
use crate::RunState;

/// A prompt paired with its response, empty if none was produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportRecord
{   pub prompt: String
  , pub response: String
}

/// Zip prompts with responses. The output always has one record
/// per prompt; missing responses become empty strings.
pub fn to_export_records(prompts: &[String], result: &[String])
  -> Vec<ExportRecord>
{   prompts.iter()
      .enumerate()
      .map(|(index, prompt)| ExportRecord
      {   prompt: prompt.clone()
        , response: result.get(index).cloned().unwrap_or_default()
      })
      .collect()
}

/// Records for a finished run. `None` unless the state is
/// `Completed` or `Failed`.
pub fn records_for_state(prompts: &[String], state: &RunState)
  -> Option<Vec<ExportRecord>>
{   match state
    {   RunState::Completed(result) => {
          Some(to_export_records(prompts, result))
        }
      , RunState::Failed { partial, .. } => {
          Some(to_export_records(prompts, partial))
        }
      , RunState::Idle | RunState::Running { .. } => {
          trace!("No exportable records in {:?}", state);
          None
        }
    }
}

/// Pretty-printed JSON array of `{prompt, response}` objects
pub fn serialize_json(records: &[ExportRecord]) -> Result<String, Error>
{   Ok(serde_json::to_string_pretty(records)?)
}

/// Read an export produced by `serialize_json`
pub fn parse_json(text: &str) -> Result<Vec<ExportRecord>, Error>
{   Ok(serde_json::from_str(text)?)
}

/// Prompts joined by newlines
pub fn serialize_text(prompts: &[String]) -> String
{   crate::prompt::join(prompts)
}

pub fn write_json_file(path: &Path, records: &[ExportRecord])
  -> Result<(), Error>
{   let body = serialize_json(records)?;
    debug!("Exporting {} records to {}", records.len(), path.display());
    crate::kv::write_atomic(path, &body)
}
