//! Scripted network for unit tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::client::{Network, NetworkError};
use super::types::{Request, Response};

/// Serves canned responses by URL and records every request it sees.
#[derive(Default)]
pub struct ScriptedNetwork {
  routes: Mutex<HashMap<String, Response>>,
  requests: Mutex<Vec<Request>>,
  offline: AtomicBool,
}

impl ScriptedNetwork {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn route(&self, url: &str, response: Response) {
    self.routes.lock().unwrap().insert(url.to_string(), response);
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  pub fn hits(&self, url: &str) -> usize {
    self
      .requests
      .lock()
      .unwrap()
      .iter()
      .filter(|r| r.url == url)
      .count()
  }
}

#[async_trait]
impl Network for ScriptedNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response, NetworkError> {
    self.requests.lock().unwrap().push(request.clone());

    if self.offline.load(Ordering::SeqCst) {
      return Err(NetworkError::Unreachable {
        url: request.url.clone(),
        reason: "offline".to_string(),
      });
    }

    Ok(
      self
        .routes
        .lock()
        .unwrap()
        .get(&request.url)
        .cloned()
        .unwrap_or_else(|| Response::new(404, "not found")),
    )
  }
}
