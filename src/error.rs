use std::fmt;

/// Error type for bulkgen operations
/// Implements Clone for sending through channels and for
/// being held inside a terminal `RunState`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error
{   /// Missing credential, invalid parameter, unusable input
    Configuration(String)
  , /// A run is already active on this engine
    ConcurrentRun
  , /// Credential rejected by the remote API
    Authentication(String)
  , /// Upstream throttling, safe to retry later
    RateLimit(String)
  , /// Network failure or timeout
    Transport(String)
  , /// Malformed or unexpected response from the remote API
    Provider(String)
  , /// Run stopped by a cancellation request
    Cancelled
  , /// Key-value medium failure (quota, io)
    Storage(String)
  , /// JSON encode/decode failure
    Serialization(String)
  , /// Generic error
    Other(String)
}

impl Error
{   /// Whether a caller-level retry may succeed
    pub fn is_retryable(&self) -> bool
    {   matches!(self, Error::RateLimit(_) | Error::Transport(_))
    }

    /// Stable short name of the error kind, used in logs
    pub fn kind(&self) -> &'static str
    {   match self
        {   Error::Configuration(_) => "configuration"
          , Error::ConcurrentRun => "concurrent-run"
          , Error::Authentication(_) => "auth"
          , Error::RateLimit(_) => "rate-limit"
          , Error::Transport(_) => "transport"
          , Error::Provider(_) => "provider"
          , Error::Cancelled => "cancelled"
          , Error::Storage(_) => "storage"
          , Error::Serialization(_) => "serialization"
          , Error::Other(_) => "other"
        }
    }
}

impl fmt::Display for Error
{   fn fmt(&self, f: &mut fmt::Formatter<'_>)
      -> fmt::Result
    {   match self
        {   Error::Configuration(msg) => {
              write!(f, "Invalid configuration: {}", msg)
            }
          , Error::ConcurrentRun => {
              write!(f, "A generation run is already in progress")
            }
          , Error::Authentication(msg) => {
              write!(f, "Authentication failed: {}", msg)
            }
          , Error::RateLimit(msg) => {
              write!(f, "API rate limit exceeded: {}", msg)
            }
          , Error::Transport(msg) => {
              write!(f, "Transport error: {}", msg)
            }
          , Error::Provider(msg) => {
              write!(f, "Provider error: {}", msg)
            }
          , Error::Cancelled => {
              write!(f, "Generation run cancelled")
            }
          , Error::Storage(msg) => {
              write!(f, "Storage error: {}", msg)
            }
          , Error::Serialization(msg) => {
              write!(f, "Serialization error: {}", msg)
            }
          , Error::Other(msg) => {
              write!(f, "Error: {}", msg)
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<serde_json::Error> for Error
{   fn from(e: serde_json::Error) -> Self
    {   Error::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for Error
{   fn from(e: std::io::Error) -> Self
    {   Error::Storage(e.to_string())
    }
}
