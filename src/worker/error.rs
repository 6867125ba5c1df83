use thiserror::Error;

use super::Phase;
use crate::http::NetworkError;

#[derive(Error, Debug)]
pub enum WorkerError {
  #[error("Failed to precache {resource}: {source}")]
  PrecacheFetch {
    resource: String,
    #[source]
    source: NetworkError,
  },

  #[error("Failed to precache {resource}: status {status}")]
  PrecacheStatus { resource: String, status: u16 },

  #[error("Cache storage error during install: {0}")]
  Storage(String),

  #[error("Cache generation {0} is not installed")]
  MissingGeneration(String),

  #[error("Invalid manifest: {0}")]
  Manifest(String),

  #[error("Cannot {operation} while {phase:?}")]
  InvalidPhase { operation: &'static str, phase: Phase },
}
