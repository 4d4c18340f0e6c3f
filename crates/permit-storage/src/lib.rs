//! Record storage, blob archival and HTTP fetch utilities for permit sync.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use permit_core::{PermitRecord, PermitUpdate, RecordKey, StoredPermit};
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

mod blobs;
mod postgres;
mod records;

pub use blobs::{HttpBlobStore, LocalBlobStore};
pub use postgres::PgRecordStore;
pub use records::{JsonFileRecordStore, MemoryRecordStore};

pub const CRATE_NAME: &str = "permit-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record store i/o on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("record store document {path} is not valid: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("no stored permit with key {0}")]
    UnknownKey(RecordKey),
}

/// Key-value store holding one record per permit.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// All records whose permit number equals `permit_number`.
    async fn find_by_permit_number(&self, permit_number: &str) -> Result<Vec<StoredPermit>, StoreError>;

    /// Up to `limit` records ordered by `date_created`, newest first.
    async fn find_latest(&self, limit: usize) -> Result<Vec<StoredPermit>, StoreError>;

    async fn insert(&self, record: &PermitRecord) -> Result<RecordKey, StoreError>;

    async fn update(&self, key: RecordKey, update: &PermitUpdate) -> Result<(), StoreError>;
}

#[derive(Debug, Error)]
pub enum BlobUploadError {
    #[error("invalid blob key {0:?}")]
    InvalidKey(String),
    #[error("writing blob {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// Destination for archived documents.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stores `bytes` under `key` and returns a reference URL for it.
    async fn upload(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<String, BlobUploadError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Thin single-attempt wrapper over a shared reqwest client.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    /// GET `url` with query parameters; any non-2xx status is an error.
    pub async fn fetch_bytes(
        &self,
        url: &str,
        query: &[(&str, String)],
        headers: HeaderMap,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        async move {
            let resp = self.client.get(url).query(query).headers(headers).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }
            let body = resp.bytes().await?.to_vec();
            debug!(status = status.as_u16(), bytes = body.len(), "fetched");
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }

    /// PUT `body` to `url`, optionally with a bearer token.
    pub async fn put_bytes(
        &self,
        url: &str,
        body: Vec<u8>,
        content_type: &str,
        bearer_token: Option<&str>,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_put", url, bytes = body.len());
        async move {
            let mut request = self.client.put(url).header(CONTENT_TYPE, content_type).body(body);
            if let Some(token) = bearer_token {
                request = request.bearer_auth(token);
            }
            let resp = request.send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }
            let body = resp.bytes().await?.to_vec();
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_http_config_has_timeout() {
        let config = HttpClientConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(20));
        assert!(config.user_agent.is_none());
        HttpFetcher::new(HttpClientConfig {
            user_agent: Some("permit-sync/0.1".into()),
            ..config
        })
        .expect("client builds");
    }

    #[test]
    fn fetch_errors_render_status_and_url() {
        let err = FetchError::HttpStatus {
            status: 503,
            url: "https://example.test/search".into(),
        };
        assert_eq!(err.to_string(), "http status 503 for https://example.test/search");
    }
}
