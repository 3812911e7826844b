//! Persistent key-value media backing the configuration store

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use log::{debug, trace, error};
use crate::error::Error;

/// A string-to-string store.
///
/// `put_all` must be atomic: either every entry is applied or
/// none is, so a record spread over several keys is never
/// observed half-saved. `get_many` reads one consistent snapshot.
pub trait KeyValueStore: Send + Sync
{   /// Read several keys at once, `None` for each absent key
    fn get_many(&self, keys: &[&str])
      -> Result<Vec<Option<String>>, Error>;

    /// Read one key, `Ok(None)` when absent
    fn get(&self, key: &str) -> Result<Option<String>, Error>
    {   Ok(self.get_many(&[key])?.pop().flatten())
    }

    /// Apply all entries in a single operation; `None` deletes
    fn put_all(&self, entries: &[(&str, Option<String>)])
      -> Result<(), Error>;

    /// Delete one key; deleting an absent key is not an error
    fn remove(&self, key: &str) -> Result<(), Error>;
}

fn encoded_size(map: &BTreeMap<String, String>) -> usize
{   map.iter().map(|(k, v)| k.len() + v.len()).sum()
}

fn apply(
  map: &mut BTreeMap<String, String>
, entries: &[(&str, Option<String>)]
)
{   for (key, value) in entries
    {   match value
        {   Some(value) => { map.insert(key.to_string(), value.clone()); }
          , None => { map.remove(*key); }
        }
    }
}

fn pick(map: &BTreeMap<String, String>, keys: &[&str]) -> Vec<Option<String>>
{   keys.iter().map(|key| map.get(*key).cloned()).collect()
}

/// In-memory store with an optional byte quota
#[derive(Debug, Default)]
pub struct MemoryStore
{   entries: Mutex<BTreeMap<String, String>>
  , quota_bytes: Option<usize>
}

impl MemoryStore
{   pub fn new() -> Self
    {   MemoryStore::default()
    }

    /// Reject writes that would grow the store past `bytes`
    /// (sum of key and value lengths)
    pub fn with_quota(bytes: usize) -> Self
    {   MemoryStore
        {   entries: Mutex::new(BTreeMap::new())
          , quota_bytes: Some(bytes)
        }
    }

    fn lock(&self)
      -> Result<std::sync::MutexGuard<'_, BTreeMap<String, String>>, Error>
    {   self.entries.lock()
          .map_err(|_| Error::Storage(
            "memory store lock poisoned".to_string()
          ))
    }
}

impl KeyValueStore for MemoryStore
{   fn get_many(&self, keys: &[&str])
      -> Result<Vec<Option<String>>, Error>
    {   Ok(pick(&*self.lock()?, keys))
    }

    fn put_all(&self, entries: &[(&str, Option<String>)])
      -> Result<(), Error>
    {   let mut map = self.lock()?;
        let mut staged = map.clone();
        apply(&mut staged, entries);

        if let Some(quota) = self.quota_bytes
        {   let size = encoded_size(&staged);
            if size > quota
            {   error!(
                  "Memory store quota exceeded: {} > {}",
                  size, quota
                );
                return Err(Error::Storage(format!(
                  "quota exceeded ({} of {} bytes)",
                  size, quota
                )));
            }
        }

        trace!("Memory store committing {} entries", entries.len());
        *map = staged;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), Error>
    {   self.lock()?.remove(key);
        Ok(())
    }
}

/// JSON-object file store.
///
/// The whole file is rewritten on each `put_all` through a
/// temporary sibling and a rename.
#[derive(Debug)]
pub struct FileStore
{   path: PathBuf
  , guard: Mutex<()>
}

impl FileStore
{   pub fn new(path: impl Into<PathBuf>) -> Self
    {   let path = path.into();
        debug!("Creating FileStore at {}", path.display());
        FileStore
        {   path
          , guard: Mutex::new(())
        }
    }

    fn read_map(&self) -> Result<BTreeMap<String, String>, Error>
    {   let text = match fs::read_to_string(&self.path)
        {   Ok(text) => text
          , Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
              trace!("No store file yet at {}", self.path.display());
              return Ok(BTreeMap::new());
            }
          , Err(e) => {
              error!(
                "Failed to read {}: {}",
                self.path.display(), e
              );
              return Err(Error::Storage(format!(
                "{}: {}", self.path.display(), e
              )));
            }
        };

        if text.trim().is_empty()
        {   return Ok(BTreeMap::new());
        }

        serde_json::from_str(&text).map_err(|e| {
          error!("Corrupt store file {}: {}", self.path.display(), e);
          Error::Storage(format!(
            "{}: {}", self.path.display(), e
          ))
        })
    }

    fn write_map(&self, map: &BTreeMap<String, String>)
      -> Result<(), Error>
    {   let body = serde_json::to_string_pretty(map)?;
        write_atomic(&self.path, &body)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>, Error>
    {   self.guard.lock()
          .map_err(|_| Error::Storage(
            "file store lock poisoned".to_string()
          ))
    }
}

impl KeyValueStore for FileStore
{   fn get_many(&self, keys: &[&str])
      -> Result<Vec<Option<String>>, Error>
    {   let _guard = self.lock()?;
        Ok(pick(&self.read_map()?, keys))
    }

    fn put_all(&self, entries: &[(&str, Option<String>)])
      -> Result<(), Error>
    {   let _guard = self.lock()?;
        let mut map = self.read_map()?;
        apply(&mut map, entries);
        debug!(
          "Writing {} keys to {}",
          map.len(), self.path.display()
        );
        self.write_map(&map)
    }

    fn remove(&self, key: &str) -> Result<(), Error>
    {   let _guard = self.lock()?;
        let mut map = self.read_map()?;
        if map.remove(key).is_some()
        {   self.write_map(&map)?;
        }
        Ok(())
    }
}

/// Write `content` to `path` via a temporary file and a rename,
/// so readers never see a partially written file
pub fn write_atomic(path: &Path, content: &str) -> Result<(), Error>
{   if let Some(parent) = path.parent()
    {   if !parent.as_os_str().is_empty()
        {   fs::create_dir_all(parent)?;
        }
    }

    let temp_path = temp_sibling(path)?;
    let mut temp_file = fs::File::create(&temp_path)?;
    temp_file.write_all(content.as_bytes())?;
    temp_file.sync_all()?;
    drop(temp_file);

    fs::rename(&temp_path, path).map_err(|e| {
      error!("Rename to {} failed: {}", path.display(), e);
      Error::Storage(format!("{}: {}", path.display(), e))
    })
}

/// `<file name>.tmp` next to `path`; keeps the full name so
/// siblings sharing a stem never share a temporary file
fn temp_sibling(path: &Path) -> Result<PathBuf, Error>
{   let mut name = path.file_name()
      .ok_or_else(|| Error::Storage(format!(
        "{}: not a file path", path.display()
      )))?
      .to_os_string();
    name.push(".tmp");
    Ok(path.with_file_name(name))
}
