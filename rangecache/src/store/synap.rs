//! Cache store backed by a Synap server
//!
//! Speaks the Synap StreamableHTTP command protocol:
//! ```json
//! {
//!   "command": "kv.get",
//!   "request_id": "uuid",
//!   "payload": { ... }
//! }
//! ```
//! Synap stores JSON values, so payloads travel as base64 strings.

use super::CacheStore;
use crate::core::{RangeCacheError, Result};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Upper bound on keys returned by one prefix scan
const SCAN_LIMIT: u64 = 1_000_000;

/// Synap store configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynapStoreConfig {
    /// Base URL of the Synap server
    pub url: String,
    /// Request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Optional authentication token
    #[serde(default)]
    pub auth_token: Option<String>,
}

fn default_timeout_secs() -> u64 {
    30
}

impl SynapStoreConfig {
    /// Create a new configuration with the given base URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout_secs: default_timeout_secs(),
            auth_token: None,
        }
    }

    /// Set the timeout for requests
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs();
        self
    }

    /// Set the authentication token
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }
}

#[derive(Clone)]
pub struct SynapStore {
    config: Arc<SynapStoreConfig>,
    http_client: Client,
    base_url: Url,
}

impl SynapStore {
    pub fn new(config: SynapStoreConfig) -> Result<Self> {
        let base_url = Url::parse(&config.url)?;

        let mut http_client_builder =
            Client::builder().timeout(Duration::from_secs(config.timeout_secs));

        if let Some(ref token) = config.auth_token {
            let mut headers = reqwest::header::HeaderMap::new();
            let value = format!("Bearer {}", token).parse().map_err(|_| {
                RangeCacheError::InvalidConfig("auth token is not a valid header value".to_string())
            })?;
            headers.insert(reqwest::header::AUTHORIZATION, value);
            http_client_builder = http_client_builder.default_headers(headers);
        }

        let http_client = http_client_builder.build()?;

        Ok(Self {
            config: Arc::new(config),
            http_client,
            base_url,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn config(&self) -> &SynapStoreConfig {
        &self.config
    }

    async fn send_command(&self, command: &str, payload: Value) -> Result<Value> {
        let request_id = uuid::Uuid::new_v4().to_string();

        let body = json!({
            "command": command,
            "request_id": request_id,
            "payload": payload,
        });

        let url = self.base_url.join("api/v1/command")?;

        let response = self
            .http_client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| RangeCacheError::Store(format!("{} request failed: {}", command, e)))?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(RangeCacheError::Store(error_text));
        }

        let result: Value = response
            .json()
            .await
            .map_err(|e| RangeCacheError::Store(format!("{} returned a bad body: {}", command, e)))?;

        if !result["success"].as_bool().unwrap_or(false) {
            let error_msg = result["error"]
                .as_str()
                .unwrap_or("Unknown error")
                .to_string();
            return Err(RangeCacheError::Store(error_msg));
        }

        Ok(result["payload"].clone())
    }
}

/// Decode a `kv.get` payload back into raw bytes.
///
/// The server hands back the stored JSON text, so a base64 string may arrive either bare or
/// still wrapped in its JSON quotes.
fn decode_value(payload: &Value) -> Result<Option<Bytes>> {
    let text = match payload {
        Value::Null => return Ok(None),
        Value::String(text) => text,
        other => {
            return Err(RangeCacheError::Store(format!(
                "unexpected kv.get payload: {}",
                other
            )));
        }
    };

    let encoded = serde_json::from_str::<String>(text).unwrap_or_else(|_| text.clone());
    Ok(Some(Bytes::from(STANDARD.decode(encoded)?)))
}

#[async_trait]
impl CacheStore for SynapStore {
    fn name(&self) -> &'static str {
        "synap"
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let payload = json!({"key": key, "type": "string"});
        let response = self.send_command("kv.get", payload).await?;
        decode_value(&response)
    }

    async fn set(&self, key: &str, value: Bytes, ttl_secs: Option<u64>) -> Result<()> {
        debug!("SET key={}, size={}, ttl={:?}", key, value.len(), ttl_secs);
        let payload = json!({
            "key": key,
            "value": STANDARD.encode(&value),
            "ttl": ttl_secs,
        });

        self.send_command("kv.set", payload).await?;
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<BTreeSet<String>> {
        let payload = json!({"prefix": prefix, "limit": SCAN_LIMIT});
        let response = self.send_command("kv.scan", payload).await?;

        let keys: Vec<String> = serde_json::from_value(response["keys"].clone())?;
        Ok(keys
            .into_iter()
            .filter(|key| key.starts_with(prefix))
            .collect())
    }

    async fn delete(&self, keys: &[String]) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let payload = json!({"keys": keys});
        let response = self.send_command("kv.mdel", payload).await?;

        Ok(response["deleted"].as_u64().unwrap_or(0) as usize)
    }
}
