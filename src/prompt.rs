//! Raw text to prompt list

use std::fs;
use std::path::Path;
use log::{debug, error};
use crate::error::Error;

/// Split raw text into trimmed, non-empty prompts in input order.
/// Accepts `\n`, `\r\n` and lone `\r` line breaks.
pub fn parse(raw: &str) -> Vec<String>
{   raw.split(['\n', '\r'])
      .map(str::trim)
      .filter(|line| !line.is_empty())
      .map(str::to_string)
      .collect()
}

/// Number of prompts `parse` would produce
pub fn count(raw: &str) -> usize
{   raw.split(['\n', '\r'])
      .filter(|line| !line.trim().is_empty())
      .count()
}

/// Inverse of `parse` up to blank-line normalization
pub fn join(prompts: &[String]) -> String
{   prompts.join("\n")
}

/// Read a UTF-8 prompt file, one prompt per line
pub fn read_prompt_file(path: &Path) -> Result<Vec<String>, Error>
{   let raw = fs::read_to_string(path).map_err(|e| {
      error!("Failed to read prompts from {}: {}", path.display(), e);
      Error::Storage(format!("{}: {}", path.display(), e))
    })?;
    let prompts = parse(&raw);
    debug!("Read {} prompts from {}", prompts.len(), path.display());
    Ok(prompts)
}

/// Write prompts one per line, with a trailing newline
pub fn write_prompt_file(path: &Path, prompts: &[String])
  -> Result<(), Error>
{   let mut body = join(prompts);
    if !body.is_empty()
    {   body.push('\n');
    }
    debug!("Writing {} prompts to {}", prompts.len(), path.display());
    crate::kv::write_atomic(path, &body)
}
