use crate::http::Request;

/// How a request is handled by the interceptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  /// Straight to the network, never cached
  Passthrough,
  /// Live response preferred, cache on failure
  NetworkFirst,
  /// Cached response preferred, network on miss
  CacheFirst,
}

/// Pick the strategy for a request.
///
/// Mutating requests always pass through. GETs under the API prefix are
/// dynamic; every other GET is a static asset.
pub fn select(request: &Request, api_prefix: &str) -> Strategy {
  if !request.is_get() {
    Strategy::Passthrough
  } else if request.path().starts_with(api_prefix) {
    Strategy::NetworkFirst
  } else {
    Strategy::CacheFirst
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use reqwest::Method;

  #[test]
  fn test_select() {
    let cases = [
      (Request::get("https://app.test/api/feed"), Strategy::NetworkFirst),
      (Request::get("https://app.test/api/sync/pending?x=1"), Strategy::NetworkFirst),
      (Request::get("https://app.test/static/js/main.js"), Strategy::CacheFirst),
      (Request::get("https://app.test/"), Strategy::CacheFirst),
      // Only the path counts, not the query string
      (Request::get("https://app.test/page?next=/api/"), Strategy::CacheFirst),
      (Request::new(Method::POST, "https://app.test/api/feed"), Strategy::Passthrough),
      (Request::new(Method::DELETE, "https://app.test/static/x"), Strategy::Passthrough),
      (Request::new(Method::HEAD, "https://app.test/"), Strategy::Passthrough),
    ];

    for (request, expected) in cases {
      assert_eq!(select(&request, "/api/"), expected, "{}", request.cache_key());
    }
  }
}
