use std::time::Duration;

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::Client;
use thiserror::Error;

use super::types::{Request, Response};

/// The network could not produce a response at all.
///
/// HTTP error statuses are not network errors: a 500 is a response.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
  #[error("Network unreachable for {url}: {reason}")]
  Unreachable { url: String, reason: String },

  #[error("Request to {url} timed out")]
  Timeout { url: String },

  #[error("Invalid request to {url}: {reason}")]
  InvalidRequest { url: String, reason: String },
}

/// Something that can perform a request over the network.
#[async_trait]
pub trait Network: Send + Sync {
  async fn fetch(&self, request: &Request) -> Result<Response, NetworkError>;
}

/// Network implementation backed by reqwest.
/// Clone is cheap - reqwest::Client is reference counted internally.
#[derive(Clone)]
pub struct ReqwestNetwork {
  client: Client,
}

impl ReqwestNetwork {
  pub fn new(timeout: Duration) -> Result<Self> {
    let client = Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }

  fn classify(url: &str, err: reqwest::Error) -> NetworkError {
    if err.is_timeout() {
      NetworkError::Timeout {
        url: url.to_string(),
      }
    } else if err.is_builder() {
      NetworkError::InvalidRequest {
        url: url.to_string(),
        reason: err.to_string(),
      }
    } else {
      NetworkError::Unreachable {
        url: url.to_string(),
        reason: err.to_string(),
      }
    }
  }
}

#[async_trait]
impl Network for ReqwestNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response, NetworkError> {
    let mut builder = self.client.request(request.method.clone(), &request.url);
    for (name, value) in &request.headers {
      builder = builder.header(name, value);
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder
      .send()
      .await
      .map_err(|e| Self::classify(&request.url, e))?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();

    let body = response
      .bytes()
      .await
      .map_err(|e| Self::classify(&request.url, e))?
      .to_vec();

    Ok(Response {
      status,
      headers,
      body,
    })
  }
}
