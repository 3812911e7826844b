//! Run configuration and its persistent store

use std::fmt;
use std::str::FromStr;
use log::{debug, warn, error};
use crate::error::Error;
use crate::kv::KeyValueStore;

pub const DEFAULT_MODEL_ID: &str = "gpt-3.5-turbo-instruct";
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_BATCH_SIZE: usize = 5;
pub const MAX_TEMPERATURE: f32 = 2.0;

pub const KEY_CREDENTIAL: &str = "bulkgen.endpointCredential";
pub const KEY_BASE_URL: &str = "bulkgen.baseUrl";
pub const KEY_MODEL_ID: &str = "bulkgen.modelId";
pub const KEY_TEMPERATURE: &str = "bulkgen.temperature";
pub const KEY_BATCH_SIZE: &str = "bulkgen.batchSize";

/// Parameters of a generation run
#[derive(Clone, PartialEq)]
pub struct RunConfig
{   /// Opaque API secret
    pub endpoint_credential: String
  , /// API base URL (if custom)
    pub base_url: Option<String>
  , /// Model identifier sent with every request
    pub model_id: String
  , /// Sampling temperature, 0.0 to 2.0
    pub temperature: f32
  , /// Prompts per remote call, at least 1
    pub batch_size: usize
}

impl Default for RunConfig
{   fn default() -> Self
    {   RunConfig
        {   endpoint_credential: String::new()
          , base_url: None
          , model_id: DEFAULT_MODEL_ID.to_string()
          , temperature: DEFAULT_TEMPERATURE
          , batch_size: DEFAULT_BATCH_SIZE
        }
    }
}

impl fmt::Debug for RunConfig
{   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {   let credential = if self.endpoint_credential.is_empty()
        {   "<empty>"
        } else
        {   "<redacted>"
        };
        f.debug_struct("RunConfig")
          .field("endpoint_credential", &credential)
          .field("base_url", &self.base_url)
          .field("model_id", &self.model_id)
          .field("temperature", &self.temperature)
          .field("batch_size", &self.batch_size)
          .finish()
    }
}

impl RunConfig
{   /// Check the invariants a run depends on
    pub fn validate(&self) -> Result<(), Error>
    {   if self.endpoint_credential.trim().is_empty()
        {   return Err(Error::Configuration(
              "endpoint credential is not set".to_string()
            ));
        }
        if self.model_id.trim().is_empty()
        {   return Err(Error::Configuration(
              "model id is not set".to_string()
            ));
        }
        if self.base_url.as_deref().is_some_and(|url| url.trim().is_empty())
        {   return Err(Error::Configuration(
              "base URL is empty".to_string()
            ));
        }
        if self.batch_size == 0
        {   return Err(Error::Configuration(
              "batch size must be at least 1".to_string()
            ));
        }
        if !(0.0..=MAX_TEMPERATURE).contains(&self.temperature)
        {   return Err(Error::Configuration(format!(
              "temperature {} outside 0..={}",
              self.temperature, MAX_TEMPERATURE
            )));
        }
        Ok(())
    }

    pub fn has_credential(&self) -> bool
    {   !self.endpoint_credential.trim().is_empty()
    }
}

/// Loads and saves a `RunConfig` as a namespaced key-value record
pub struct ConfigStore
{   store: Box<dyn KeyValueStore>
}

impl ConfigStore
{   pub fn new(store: Box<dyn KeyValueStore>) -> Self
    {   debug!("Creating ConfigStore");
        ConfigStore { store }
    }

    /// Give back the underlying medium
    pub fn into_inner(self) -> Box<dyn KeyValueStore>
    {   self.store
    }

    /// Read the persisted record as one snapshot.
    ///
    /// Absent keys fall back to defaults and an unparseable number
    /// falls back to its default with a warning. Everything else is
    /// returned exactly as saved; `RunConfig::validate` decides
    /// whether it can drive a run.
    pub fn load(&self) -> Result<RunConfig, Error>
    {   let defaults = RunConfig::default();

        let mut values = self.store
          .get_many(&[
            KEY_CREDENTIAL
          , KEY_BASE_URL
          , KEY_MODEL_ID
          , KEY_TEMPERATURE
          , KEY_BATCH_SIZE
          ])?
          .into_iter();
        let mut next = || values.next().flatten();

        let endpoint_credential = next().unwrap_or_default();
        let base_url = next();
        let model_id = next().unwrap_or(defaults.model_id);
        let temperature = parsed_or(
          KEY_TEMPERATURE, next(), defaults.temperature
        );
        let batch_size = parsed_or(
          KEY_BATCH_SIZE, next(), defaults.batch_size
        );

        let config = RunConfig
        {   endpoint_credential
          , base_url
          , model_id
          , temperature
          , batch_size
        };
        debug!("Loaded {:?}", config);
        Ok(config)
    }

    /// Persist the whole record in one store operation
    pub fn save(&self, config: &RunConfig) -> Result<(), Error>
    {   debug!("Saving {:?}", config);
        let entries = [
          (KEY_CREDENTIAL, Some(config.endpoint_credential.clone()))
        , (KEY_BASE_URL, config.base_url.clone())
        , (KEY_MODEL_ID, Some(config.model_id.clone()))
        , (KEY_TEMPERATURE, Some(config.temperature.to_string()))
        , (KEY_BATCH_SIZE, Some(config.batch_size.to_string()))
        ];
        self.store.put_all(&entries).map_err(|e| {
          error!("Failed to save configuration: {}", e);
          e
        })
    }

    /// Forget the stored credential, keeping the other fields
    pub fn clear_credential(&self) -> Result<(), Error>
    {   debug!("Clearing stored credential");
        self.store.remove(KEY_CREDENTIAL)
    }
}

fn parsed_or<T>(key: &str, raw: Option<String>, default: T) -> T
where
  T: FromStr
{   match raw
    {   None => default
      , Some(raw) => match raw.trim().parse::<T>()
        {   Ok(value) => value
          , Err(_) => {
              warn!("Unparseable value {:?} for {}, using default", raw, key);
              default
            }
        }
    }
}
