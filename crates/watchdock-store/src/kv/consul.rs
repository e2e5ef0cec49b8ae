use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::trace;

use crate::{
    StoreError,
    kv::{KvClient, KvListing, KvPair},
};

const INDEX_HEADER: &str = "X-Consul-Index";

/// Longest a blocking list query is held open by the server.
pub const DEFAULT_WAIT: Duration = Duration::from_secs(55);

#[derive(Debug, Deserialize)]
struct ConsulEntry {
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "Value", default)]
    value: Option<String>,
}

/// Consul HTTP API client for the KV store and leader status.
#[derive(Debug, Clone)]
pub struct ConsulKv {
    http: reqwest::Client,
    base: String,
    wait: Duration,
}

impl ConsulKv {
    /// `address` is `host:port` or a full `http(s)://` URL.
    pub fn new(address: &str) -> Result<Self, StoreError> {
        Self::with_wait(address, DEFAULT_WAIT)
    }

    pub fn with_wait(address: &str, wait: Duration) -> Result<Self, StoreError> {
        let http = reqwest::Client::builder()
            .timeout(wait + Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            base: base_url(address),
            wait,
        })
    }

    pub fn address(&self) -> &str {
        &self.base
    }

    /// Current raft leader, `None` while there is none.
    pub async fn leader(&self) -> Result<Option<String>, StoreError> {
        let leader: String = self
            .http
            .get(format!("{}/v1/status/leader", self.base))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(Some(leader).filter(|l| !l.is_empty()))
    }

    fn kv_url(&self, key: &str) -> String {
        format!("{}/v1/kv/{}", self.base, key.trim_start_matches('/'))
    }
}

fn base_url(address: &str) -> String {
    let address = address.trim_end_matches('/');
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{address}")
    }
}

#[async_trait]
impl KvClient for ConsulKv {
    async fn list(&self, prefix: &str, wait_index: Option<u64>) -> Result<KvListing, StoreError> {
        let mut url = format!("{}?recurse=true", self.kv_url(prefix));
        if let Some(index) = wait_index {
            url.push_str(&format!("&index={index}&wait={}s", self.wait.as_secs()));
        }
        trace!(%url, "kv list");

        let resp = self.http.get(&url).send().await?;
        let index = resp
            .headers()
            .get(INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(KvListing {
                index,
                pairs: Vec::new(),
            });
        }
        let entries: Vec<ConsulEntry> = resp.error_for_status()?.json().await?;

        let mut pairs = Vec::with_capacity(entries.len());
        for e in entries {
            let value = match e.value {
                Some(v) => STANDARD
                    .decode(v)
                    .map_err(|err| StoreError::Kv(format!("{}: bad base64: {err}", e.key)))?,
                None => Vec::new(),
            };
            pairs.push(KvPair { key: e.key, value });
        }
        Ok(KvListing { index, pairs })
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let ok: bool = self
            .http
            .put(self.kv_url(key))
            .body(value.to_vec())
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if !ok {
            return Err(StoreError::Kv(format!("put {key} rejected")));
        }
        Ok(())
    }

    async fn delete_tree(&self, prefix: &str) -> Result<(), StoreError> {
        self.http
            .delete(format!("{}?recurse=true", self.kv_url(prefix)))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
