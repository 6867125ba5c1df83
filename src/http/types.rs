use reqwest::Method;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// An outgoing request as seen by the interceptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub method: Method,
  pub url: String,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
}

impl Request {
  pub fn new(method: Method, url: impl Into<String>) -> Self {
    Self {
      method,
      url: url.into(),
      headers: Vec::new(),
      body: None,
    }
  }

  pub fn get(url: impl Into<String>) -> Self {
    Self::new(Method::GET, url)
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = Some(body.into());
    self
  }

  pub fn is_get(&self) -> bool {
    self.method == Method::GET
  }

  /// Request identity used as the cache key: method plus URL.
  pub fn cache_key(&self) -> String {
    format!("{} {}", self.method, self.url)
  }

  /// Path component of the URL. Relative URLs are treated as paths already.
  pub fn path(&self) -> String {
    match url::Url::parse(&self.url) {
      Ok(parsed) => parsed.path().to_string(),
      Err(_) => self
        .url
        .split(['?', '#'])
        .next()
        .unwrap_or_default()
        .to_string(),
    }
  }
}

/// A completed HTTP exchange. The body is fully buffered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  pub fn ok(body: impl Into<Vec<u8>>) -> Self {
    Self::new(200, body)
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Only plain 200 responses are ever written to the cache.
  pub fn is_cacheable(&self) -> bool {
    self.status == 200
  }

  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }
}

/// Serialized form of a response inside a cache generation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedResponse {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  /// SHA-256 of the body, hex encoded
  pub digest: String,
  #[serde(with = "hex_bytes")]
  pub body: Vec<u8>,
}

impl CachedResponse {
  pub fn from_response(response: &Response) -> Self {
    Self {
      status: response.status,
      headers: response.headers.clone(),
      digest: body_digest(&response.body),
      body: response.body.clone(),
    }
  }

  /// True if the body still matches the digest taken when it was stored.
  pub fn verify(&self) -> bool {
    body_digest(&self.body) == self.digest
  }

  pub fn into_response(self) -> Response {
    Response {
      status: self.status,
      headers: self.headers,
      body: self.body,
    }
  }
}

fn body_digest(body: &[u8]) -> String {
  let mut hasher = Sha256::new();
  hasher.update(body);
  hex::encode(hasher.finalize())
}

mod hex_bytes {
  use serde::{Deserialize, Deserializer, Serializer};

  pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&hex::encode(bytes))
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let s = String::deserialize(deserializer)?;
    hex::decode(s).map_err(serde::de::Error::custom)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_cache_key_includes_method() {
    let get = Request::get("https://app.test/api/feed?page=2");
    assert_eq!(get.cache_key(), "GET https://app.test/api/feed?page=2");

    let post = Request::new(Method::POST, "https://app.test/api/feed?page=2");
    assert_ne!(get.cache_key(), post.cache_key());
  }

  #[test]
  fn test_path_of_absolute_and_relative_urls() {
    assert_eq!(Request::get("https://app.test/api/feed?page=2").path(), "/api/feed");
    assert_eq!(Request::get("/static/js/main.js#top").path(), "/static/js/main.js");
  }

  #[test]
  fn test_only_200_is_cacheable() {
    assert!(Response::ok("x").is_cacheable());
    assert!(Response::new(204, "").is_success());
    assert!(!Response::new(204, "").is_cacheable());
    assert!(!Response::new(404, "").is_cacheable());
  }

  #[test]
  fn test_cached_response_detects_corruption() {
    let mut response = Response::ok("hello");
    response.headers.push(("Content-Type".to_string(), "text/plain".to_string()));
    let mut cached = CachedResponse::from_response(&response);
    assert!(cached.verify());

    let json = serde_json::to_string(&cached).unwrap();
    let decoded: CachedResponse = serde_json::from_str(&json).unwrap();
    assert!(decoded.verify());
    assert_eq!(decoded.into_response(), response);

    cached.body = b"tampered".to_vec();
    assert!(!cached.verify());
  }
}
