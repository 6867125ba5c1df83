use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::sync::Arc;

use crate::http::{Network, Request};

/// Anything that can report how many local mutations the backend has not
/// acknowledged yet.
#[async_trait]
pub trait PendingCountSource: Send + Sync {
  async fn pending_count(&self) -> Result<u64>;
}

/// Asks a backend endpoint for the pending-mutation count.
///
/// Goes to the network directly, never through the interceptor: a cached
/// count would be worse than no count.
pub struct HttpPendingCount {
  network: Arc<dyn Network>,
  url: String,
}

impl HttpPendingCount {
  pub fn new(network: Arc<dyn Network>, url: impl Into<String>) -> Self {
    Self {
      network,
      url: url.into(),
    }
  }
}

#[async_trait]
impl PendingCountSource for HttpPendingCount {
  async fn pending_count(&self) -> Result<u64> {
    let response = self
      .network
      .fetch(&Request::get(self.url.clone()).with_header("Accept", "application/json"))
      .await
      .map_err(|e| eyre!("Failed to query pending count: {}", e))?;

    if !response.is_success() {
      return Err(eyre!(
        "Pending count endpoint returned status {}",
        response.status
      ));
    }

    parse_count(&response.body)
  }
}

/// Accepts a bare integer, or an object with a `count` or `pending` field.
pub fn parse_count(body: &[u8]) -> Result<u64> {
  let value: Value =
    serde_json::from_slice(body).map_err(|e| eyre!("Invalid pending count response: {}", e))?;

  let count = match &value {
    Value::Number(n) => n.as_u64(),
    Value::Object(map) => map
      .get("count")
      .or_else(|| map.get("pending"))
      .and_then(Value::as_u64),
    _ => None,
  };

  count.ok_or_else(|| eyre!("Pending count response has no count: {}", value))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::http::testing::ScriptedNetwork;
  use crate::http::Response;

  const URL: &str = "https://app.test/api/sync/pending";

  #[test]
  fn test_parse_count() {
    assert_eq!(parse_count(b"3").unwrap(), 3);
    assert_eq!(parse_count(br#"{"count": 7}"#).unwrap(), 7);
    assert_eq!(parse_count(br#"{"pending": 0, "other": 1}"#).unwrap(), 0);
    assert!(parse_count(b"-1").is_err());
    assert!(parse_count(br#"{"total": 2}"#).is_err());
    assert!(parse_count(b"<html>").is_err());
  }

  #[tokio::test]
  async fn test_http_source() {
    let network = Arc::new(ScriptedNetwork::new());
    network.route(URL, Response::ok(r#"{"count": 4}"#));
    let source = HttpPendingCount::new(network.clone(), URL);

    assert_eq!(source.pending_count().await.unwrap(), 4);

    network.route(URL, Response::new(502, "bad gateway"));
    assert!(source.pending_count().await.is_err());

    network.set_offline(true);
    assert!(source.pending_count().await.is_err());
  }
}
