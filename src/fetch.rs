//! Fetcher seam and an HTTP implementation for the clinic backend.

use color_eyre::{eyre::eyre, Result};
use futures::future::{BoxFuture, FutureExt};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Method;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;
use url::Url;

use crate::config::Config;
use crate::error::{CacheError, CacheResult};

/// A factory for fetch futures. Called once per attempt, so it must be re-invocable.
pub type FetchFn = Arc<dyn Fn() -> BoxFuture<'static, CacheResult<Value>> + Send + Sync>;

/// Box a closure into a [`FetchFn`].
///
/// ```ignore
/// let fetcher = fetch_fn(move || {
///   let http = http.clone();
///   async move { http.get("/rest/v1/patients").await }
/// });
/// ```
pub fn fetch_fn<F, Fut>(f: F) -> FetchFn
where
  F: Fn() -> Fut + Send + Sync + 'static,
  Fut: Future<Output = CacheResult<Value>> + Send + 'static,
{
  Arc::new(move || f().boxed())
}

/// Supplies credentials for outgoing requests (session store seam)
pub trait Credentials: Send + Sync {
  /// Value for the `Authorization` header, if the session has one
  fn authorization(&self) -> Option<String>;

  /// Project API key sent as the `apikey` header, if any
  fn api_key(&self) -> Option<String> {
    None
  }
}

/// Static API key used both as project key and bearer token
#[derive(Clone)]
pub struct ApiKeyCredentials {
  api_key: String,
}

impl ApiKeyCredentials {
  pub fn new(api_key: impl Into<String>) -> Self {
    Self {
      api_key: api_key.into(),
    }
  }

  /// Read the key from the environment (see [`Config::get_api_key`]).
  pub fn from_env() -> Result<Self> {
    Ok(Self::new(Config::get_api_key()?))
  }
}

impl Credentials for ApiKeyCredentials {
  fn authorization(&self) -> Option<String> {
    Some(format!("Bearer {}", self.api_key))
  }

  fn api_key(&self) -> Option<String> {
    Some(self.api_key.clone())
  }
}

/// REST client for the hosted backend
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
  base_url: Url,
  credentials: Arc<dyn Credentials>,
}

impl HttpFetcher {
  pub fn new(base_url: &str, credentials: Arc<dyn Credentials>) -> Result<Self> {
    let base_url =
      Url::parse(base_url).map_err(|e| eyre!("Invalid backend URL {}: {}", base_url, e))?;

    let client = reqwest::Client::builder()
      .gzip(true)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base_url,
      credentials,
    })
  }

  /// Resolve a resource path against the backend URL
  pub fn url_for(&self, path: &str) -> CacheResult<Url> {
    self
      .base_url
      .join(path)
      .map_err(|e| CacheError::InvalidKey(format!("{}: {}", path, e)))
  }

  fn headers(&self) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Some(value) = self
      .credentials
      .authorization()
      .and_then(|v| HeaderValue::from_str(&v).ok())
    {
      headers.insert(AUTHORIZATION, value);
    }
    if let Some(value) = self
      .credentials
      .api_key()
      .and_then(|v| HeaderValue::from_str(&v).ok())
    {
      headers.insert("apikey", value);
    }
    headers
  }

  /// GET a resource and parse its JSON body
  pub async fn get(&self, path: &str) -> CacheResult<Value> {
    self
      .send(Method::GET, path, None)
      .await
      .map(|body| body.unwrap_or(Value::Null))
  }

  /// Send a request; returns the parsed body, or `None` when the response is empty.
  pub async fn send(
    &self,
    method: Method,
    path: &str,
    body: Option<&Value>,
  ) -> CacheResult<Option<Value>> {
    let url = self.url_for(path)?;
    debug!(%method, %url, "backend request");

    let mut request = self.client.request(method, url).headers(self.headers());
    if let Some(body) = body {
      let bytes = serde_json::to_vec(body).map_err(|e| CacheError::Decode(e.to_string()))?;
      request = request.header(CONTENT_TYPE, "application/json").body(bytes);
    }

    let response = request
      .send()
      .await
      .map_err(|e| CacheError::Network(e.to_string()))?;

    let status = response.status();
    let bytes = response
      .bytes()
      .await
      .map_err(|e| CacheError::Network(e.to_string()))?;

    if !status.is_success() {
      return Err(CacheError::Status {
        status: status.as_u16(),
        message: String::from_utf8_lossy(&bytes).trim().to_string(),
      });
    }

    if bytes.iter().all(u8::is_ascii_whitespace) {
      return Ok(None);
    }

    serde_json::from_slice(&bytes)
      .map(Some)
      .map_err(|e| CacheError::Decode(e.to_string()))
  }

  /// A [`FetchFn`] that GETs `path` on every invocation
  pub fn fetcher(&self, path: &str) -> FetchFn {
    let http = self.clone();
    let path = path.to_string();
    fetch_fn(move || {
      let http = http.clone();
      let path = path.clone();
      async move { http.get(&path).await }
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[tokio::test]
  async fn test_fetch_fn_is_reinvocable() {
    let fetcher = fetch_fn(|| async { Ok(json!({"ok": true})) });
    assert_eq!(fetcher().await, Ok(json!({"ok": true})));
    assert_eq!(fetcher().await, Ok(json!({"ok": true})));
  }

  #[test]
  fn test_rejects_invalid_base_url() {
    let credentials = Arc::new(ApiKeyCredentials::new("key"));
    assert!(HttpFetcher::new("not a url", credentials).is_err());
  }

  #[test]
  fn test_resolves_paths_and_attaches_credentials() {
    let credentials = Arc::new(ApiKeyCredentials::new("secret"));
    let http = HttpFetcher::new("https://clinic.example.com/", credentials).unwrap();

    let url = http.url_for("rest/v1/patients?select=*").unwrap();
    assert_eq!(url.as_str(), "https://clinic.example.com/rest/v1/patients?select=*");

    let headers = http.headers();
    assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer secret");
    assert_eq!(headers.get("apikey").unwrap(), "secret");
  }
}
