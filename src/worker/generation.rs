use color_eyre::{eyre::eyre, Result};
use url::Url;

/// Resources every generation precaches unless configured otherwise.
pub const DEFAULT_MANIFEST: &[&str] = &[
  "/",
  "/index.html",
  "/static/css/main.css",
  "/static/js/main.js",
  "/manifest.json",
];

/// Default prefix for generation names.
pub const DEFAULT_GENERATION_PREFIX: &str = "offcache-";

/// One versioned instance of the static-asset cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheGeneration {
  name: String,
  manifest: Vec<String>,
}

impl CacheGeneration {
  pub fn new(name: impl Into<String>, manifest: Vec<String>) -> Self {
    Self {
      name: name.into(),
      manifest,
    }
  }

  /// Generation named after a build version, e.g. `offcache-v3`.
  pub fn for_version(prefix: &str, version: &str, manifest: Vec<String>) -> Self {
    Self::new(format!("{}{}", prefix, version), manifest)
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  /// Manifest entries as absolute URLs, resolved against the origin.
  pub fn manifest_urls(&self, origin: &Url) -> Result<Vec<String>> {
    self
      .manifest
      .iter()
      .map(|resource| {
        origin
          .join(resource)
          .map(|url| url.to_string())
          .map_err(|e| eyre!("Invalid manifest resource {}: {}", resource, e))
      })
      .collect()
  }
}
