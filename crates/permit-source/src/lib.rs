//! Permit source contracts + the NYC Streets permit search client.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use permit_core::{format_source_date, FetchWindow, PermitFields, PERMIT_NUMBER_FIELD};
use permit_storage::{FetchError, HttpFetcher};
use reqwest::header::{HeaderMap, HeaderValue, REFERER};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "permit-source";

pub const DEFAULT_SEARCH_URL: &str = "https://nycstreets.net/Public/Permit/SearchPermits";
pub const DEFAULT_DOCUMENT_URL: &str = "https://nycstreets.net/Public/Document/ViewPermitPDF/";
pub const DEFAULT_REFERER: &str = "https://nycstreets.net";
pub const DEFAULT_PAGE_SIZE: u32 = 250;
pub const DEFAULT_SORT_FIELD: &str = "PermitIssueDateFrom";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed search payload for page {page}: {reason}")]
    Malformed { page: u32, reason: String },
    #[error("reading fixture {path}: {source}")]
    Fixture {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    pub fn as_str(self) -> &'static str {
        match self {
            SortOrder::Asc => "asc",
            SortOrder::Desc => "desc",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchQuery {
    pub window: FetchWindow,
    /// 1-based page index.
    pub page: u32,
}

/// One permit as delivered by the source, with its natural key extracted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourcePermit {
    pub permit_number: String,
    pub fields: PermitFields,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchPage {
    pub page: u32,
    pub total_pages: u32,
    pub items: Vec<SourcePermit>,
}

#[async_trait]
pub trait PermitSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn search(&self, query: &SearchQuery) -> Result<SearchPage, SourceError>;

    /// Raw document bytes for a permit. Non-2xx responses are errors.
    async fn fetch_document(&self, permit_number: &str) -> Result<Vec<u8>, SourceError>;
}

#[derive(Debug, Deserialize)]
struct RawSearchPage {
    #[serde(rename = "TotalPages")]
    total_pages: u32,
    #[serde(rename = "PermitList", default)]
    permit_list: Option<Vec<JsonValue>>,
}

fn permit_number_of(fields: &PermitFields) -> Option<String> {
    match fields.get(PERMIT_NUMBER_FIELD)? {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parses one search response body into permits.
pub fn parse_search_page(page: u32, body: &[u8]) -> Result<SearchPage, SourceError> {
    let raw: RawSearchPage = serde_json::from_slice(body).map_err(|err| SourceError::Malformed {
        page,
        reason: err.to_string(),
    })?;

    let mut items = Vec::new();
    for (index, value) in raw.permit_list.unwrap_or_default().into_iter().enumerate() {
        let JsonValue::Object(fields) = value else {
            return Err(SourceError::Malformed {
                page,
                reason: format!("item {index} is not an object"),
            });
        };
        let Some(permit_number) = permit_number_of(&fields) else {
            return Err(SourceError::Malformed {
                page,
                reason: format!("item {index} has no {PERMIT_NUMBER_FIELD}"),
            });
        };
        items.push(SourcePermit {
            permit_number,
            fields,
        });
    }

    Ok(SearchPage {
        page,
        total_pages: raw.total_pages,
        items,
    })
}

#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub search_url: String,
    pub document_url: String,
    pub referer: Option<String>,
    pub page_size: u32,
    pub sort_field: String,
    pub sort_order: SortOrder,
}

impl SourceConfig {
    pub fn nyc_streets(search_url: impl Into<String>) -> Self {
        Self {
            search_url: search_url.into(),
            document_url: DEFAULT_DOCUMENT_URL.to_string(),
            referer: Some(DEFAULT_REFERER.to_string()),
            page_size: DEFAULT_PAGE_SIZE,
            sort_field: DEFAULT_SORT_FIELD.to_string(),
            sort_order: SortOrder::Desc,
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self::nyc_streets(DEFAULT_SEARCH_URL)
    }
}

/// Query string for one search page. `cache_buster` fills the `_` parameter.
pub fn search_params(config: &SourceConfig, query: &SearchQuery, cache_buster: i64) -> Vec<(&'static str, String)> {
    vec![
        ("PermitIssueDateFrom", format_source_date(query.window.from)),
        ("PermitIssueDateTo", format_source_date(query.window.to)),
        ("page", query.page.to_string()),
        ("rows", config.page_size.to_string()),
        ("sidx", config.sort_field.clone()),
        ("sord", config.sort_order.as_str().to_string()),
        ("LocationSearchType", "0".to_string()),
        ("_", cache_buster.to_string()),
    ]
}

/// Client for the nycstreets.net permit search and PDF endpoints.
#[derive(Debug, Clone)]
pub struct NycStreetsSource {
    http: HttpFetcher,
    config: SourceConfig,
}

impl NycStreetsSource {
    pub fn new(http: HttpFetcher, config: SourceConfig) -> Self {
        Self { http, config }
    }

    pub fn config(&self) -> &SourceConfig {
        &self.config
    }

    fn document_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(value) = self
            .config
            .referer
            .as_deref()
            .and_then(|r| HeaderValue::from_str(r).ok())
        {
            headers.insert(REFERER, value);
        }
        headers
    }
}

#[async_trait]
impl PermitSource for NycStreetsSource {
    fn source_id(&self) -> &'static str {
        "nycstreets"
    }

    async fn search(&self, query: &SearchQuery) -> Result<SearchPage, SourceError> {
        let params = search_params(&self.config, query, Utc::now().timestamp_millis());
        info!(page = query.page, from = %query.window.from, to = %query.window.to, "querying permit search");
        let response = self
            .http
            .fetch_bytes(&self.config.search_url, &params, HeaderMap::new())
            .await?;
        let page = parse_search_page(query.page, &response.body)?;
        debug!(page = page.page, total_pages = page.total_pages, items = page.items.len(), "search page parsed");
        Ok(page)
    }

    async fn fetch_document(&self, permit_number: &str) -> Result<Vec<u8>, SourceError> {
        let params = [("id", permit_number.to_string())];
        let response = self
            .http
            .fetch_bytes(&self.config.document_url, &params, self.document_headers())
            .await?;
        Ok(response.body)
    }
}

/// Offline source serving captured pages from a fixture directory:
/// `search/page-<n>.json` and `documents/<permit_number>.pdf`.
#[derive(Debug, Clone)]
pub struct FixturePermitSource {
    root: PathBuf,
}

impl FixturePermitSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn read(&self, path: PathBuf) -> Result<Vec<u8>, SourceError> {
        tokio::fs::read(&path)
            .await
            .map_err(|source| SourceError::Fixture { path, source })
    }
}

#[async_trait]
impl PermitSource for FixturePermitSource {
    fn source_id(&self) -> &'static str {
        "fixture"
    }

    async fn search(&self, query: &SearchQuery) -> Result<SearchPage, SourceError> {
        let path = self.root.join("search").join(format!("page-{}.json", query.page));
        let body = self.read(path).await?;
        parse_search_page(query.page, &body)
    }

    async fn fetch_document(&self, permit_number: &str) -> Result<Vec<u8>, SourceError> {
        let path = self.root.join("documents").join(format!("{permit_number}.pdf"));
        self.read(path).await
    }
}
