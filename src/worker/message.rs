use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Commands accepted on the interceptor's control channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
  /// Adopt the installed generation now instead of waiting
  SkipWaiting,
}

impl FromStr for ControlMessage {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim() {
      "SKIP_WAITING" => Ok(Self::SkipWaiting),
      other => Err(format!("Unknown control message: {}", other)),
    }
  }
}
