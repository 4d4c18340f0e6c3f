//! Incremental permit sync: fetch window, pagination, reconcile, PDF archival.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use permit_core::{
    pdf_blob_key, pdf_file_name, Clock, FetchWindow, PdfArchive, PermitRecord, PermitUpdate, RecordKey,
    SystemClock, PDF_CONTENT_TYPE,
};
use permit_source::{
    PermitSource, SearchPage, SearchQuery, SourceError, SourcePermit, DEFAULT_DOCUMENT_URL, DEFAULT_SEARCH_URL,
};
use permit_storage::{BlobStore, RecordStore, StoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

mod runtime;

pub use runtime::{
    build_engine, build_scheduler, migrate_store, open_blob_store, open_record_store, run_scheduled_sync,
    run_sync_once, run_sync_once_from_env, BlobTarget, StoreTarget,
};

pub const CRATE_NAME: &str = "permit-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub search_url: String,
    pub document_url: String,
    /// Record store identifier: `postgres://…`, `memory:` or a JSON file path.
    pub store: String,
    /// Blob target: an `http(s)://` bucket endpoint or a local directory.
    pub blobs: String,
    pub blob_public_base_url: Option<String>,
    pub blob_token: Option<String>,
    /// Serve search pages and documents from captured fixtures instead of HTTP.
    pub fixtures_dir: Option<PathBuf>,
    pub since: Option<NaiveDate>,
    pub page_size: u32,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub sync_cron: String,
}

impl SyncConfig {
    pub fn new(search_url: impl Into<String>, store: impl Into<String>) -> Self {
        Self {
            search_url: search_url.into(),
            document_url: DEFAULT_DOCUMENT_URL.to_string(),
            store: store.into(),
            blobs: "./artifacts".to_string(),
            blob_public_base_url: None,
            blob_token: None,
            fixtures_dir: None,
            since: None,
            page_size: permit_source::DEFAULT_PAGE_SIZE,
            user_agent: "permit-sync/0.1".to_string(),
            http_timeout_secs: 20,
            sync_cron: "0 6 * * *".to_string(),
        }
    }

    /// Reads `PERMIT_*` variables; anything unset or unparsable keeps the
    /// default from [`SyncConfig::new`].
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::new(
            lookup("PERMIT_SEARCH_URL").unwrap_or_else(|| DEFAULT_SEARCH_URL.to_string()),
            lookup("PERMIT_STORE").unwrap_or_else(|| "./state/permits.json".to_string()),
        );
        if let Some(document_url) = lookup("PERMIT_DOCUMENT_URL") {
            config.document_url = document_url;
        }
        if let Some(blobs) = lookup("PERMIT_BLOBS") {
            config.blobs = blobs;
        }
        config.blob_public_base_url = lookup("PERMIT_BLOB_PUBLIC_URL");
        config.blob_token = lookup("PERMIT_BLOB_TOKEN");
        config.fixtures_dir = lookup("PERMIT_FIXTURES_DIR").map(PathBuf::from);
        config.since = lookup("PERMIT_SINCE").and_then(|v| permit_core::parse_date(&v).ok());
        if let Some(page_size) = lookup("PERMIT_PAGE_SIZE").and_then(|v| v.parse().ok()) {
            config.page_size = page_size;
        }
        if let Some(user_agent) = lookup("PERMIT_USER_AGENT") {
            config.user_agent = user_agent;
        }
        if let Some(secs) = lookup("PERMIT_HTTP_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            config.http_timeout_secs = secs;
        }
        if let Some(cron) = lookup("PERMIT_SYNC_CRON") {
            config.sync_cron = cron;
        }
        config
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("record store is empty so no fetch window can be derived; supply a start date with --since")]
    NoPriorState,
    #[error("permit source unavailable: {0}")]
    SourceUnavailable(#[from] SourceError),
    #[error("record store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordChange {
    Created,
    Touched,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PdfOutcome {
    AlreadyArchived,
    Archived(PdfArchive),
    /// Fetch failed or returned no bytes; retried next run.
    Unavailable,
    /// Blob upload failed; retried next run.
    UploadFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub key: RecordKey,
    pub change: RecordChange,
    pub pdf: PdfOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncCounts {
    pub records_seen: usize,
    pub created: usize,
    pub touched: usize,
    pub pdfs_archived: usize,
    pub pdfs_already_archived: usize,
    pub pdfs_unavailable: usize,
    pub pdf_upload_failures: usize,
}

impl SyncCounts {
    fn record(&mut self, report: &ReconcileReport) {
        self.records_seen += 1;
        match report.change {
            RecordChange::Created => self.created += 1,
            RecordChange::Touched => self.touched += 1,
        }
        match report.pdf {
            PdfOutcome::AlreadyArchived => self.pdfs_already_archived += 1,
            PdfOutcome::Archived(_) => self.pdfs_archived += 1,
            PdfOutcome::Unavailable => self.pdfs_unavailable += 1,
            PdfOutcome::UploadFailed => self.pdf_upload_failures += 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub source_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub window: FetchWindow,
    pub total_pages: u32,
    pub pages_fetched: u32,
    pub counts: SyncCounts,
}

/// Drives one incremental sync pass against injected collaborators.
pub struct SyncEngine {
    source: Arc<dyn PermitSource>,
    store: Arc<dyn RecordStore>,
    blobs: Arc<dyn BlobStore>,
    clock: Arc<dyn Clock>,
    since: Option<NaiveDate>,
}

impl SyncEngine {
    pub fn new(source: Arc<dyn PermitSource>, store: Arc<dyn RecordStore>, blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            source,
            store,
            blobs,
            clock: Arc::new(SystemClock),
            since: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Overrides the window start; required on a first run against an empty store.
    pub fn with_since(mut self, since: Option<NaiveDate>) -> Self {
        self.since = since;
        self
    }

    /// Window from the newest `date_created` (or `since`) through tomorrow.
    pub async fn fetch_window(&self) -> Result<FetchWindow, SyncError> {
        let today = self.clock.today();
        let from = match self.since {
            Some(since) => since,
            None => self
                .store
                .find_latest(1)
                .await?
                .into_iter()
                .next()
                .map(|latest| latest.record.date_created)
                .ok_or(SyncError::NoPriorState)?,
        };
        Ok(FetchWindow::through_tomorrow(from, today))
    }

    pub async fn run_sync(&self) -> Result<SyncRunSummary, SyncError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, source = self.source.source_id());
        self.run_sync_inner(run_id).instrument(span).await
    }

    async fn run_sync_inner(&self, run_id: Uuid) -> Result<SyncRunSummary, SyncError> {
        let started_at = Utc::now();
        let window = self.fetch_window().await?;
        info!(from = %window.from, to = %window.to, "sync window");

        let mut counts = SyncCounts::default();
        let first = self.source.search(&SearchQuery { window, page: 1 }).await?;
        let total_pages = first.total_pages;
        self.reconcile_page(&first, &mut counts).await?;
        let mut pages_fetched = 1;

        for page in 2..=total_pages {
            let next = self.source.search(&SearchQuery { window, page }).await?;
            self.reconcile_page(&next, &mut counts).await?;
            pages_fetched += 1;
        }

        let summary = SyncRunSummary {
            run_id,
            source_id: self.source.source_id().to_string(),
            started_at,
            finished_at: Utc::now(),
            window,
            total_pages,
            pages_fetched,
            counts,
        };
        info!(
            pages = summary.pages_fetched,
            seen = summary.counts.records_seen,
            created = summary.counts.created,
            touched = summary.counts.touched,
            pdfs_archived = summary.counts.pdfs_archived,
            "sync complete"
        );
        Ok(summary)
    }

    async fn reconcile_page(&self, page: &SearchPage, counts: &mut SyncCounts) -> Result<(), SyncError> {
        debug!(page = page.page, items = page.items.len(), "reconciling page");
        for permit in &page.items {
            let report = self.reconcile(permit).await?;
            counts.record(&report);
        }
        Ok(())
    }

    /// Inserts an unseen permit or refreshes `last_seen` on a known one, then
    /// archives its PDF if none is stored yet.
    pub async fn reconcile(&self, permit: &SourcePermit) -> Result<ReconcileReport, SyncError> {
        let today = self.clock.today();
        let permit_number = permit.permit_number.as_str();
        let mut existing = self.store.find_by_permit_number(permit_number).await?;
        if existing.len() > 1 {
            warn!(permit_number, matches = existing.len(), "duplicate permit records; using the first");
        }

        let (key, change, has_pdf) = if existing.is_empty() {
            let record = PermitRecord::first_seen(permit_number, permit.fields.clone(), today);
            let key = self.store.insert(&record).await?;
            info!(permit_number, %key, "permit created");
            (key, RecordChange::Created, false)
        } else {
            let stored = existing.swap_remove(0);
            self.store
                .update(stored.key, &PermitUpdate::last_seen(today))
                .await?;
            debug!(permit_number, key = %stored.key, "permit last_seen refreshed");
            (stored.key, RecordChange::Touched, stored.record.has_pdf())
        };

        let pdf = if has_pdf {
            PdfOutcome::AlreadyArchived
        } else {
            self.archive_pdf(key, permit_number).await?
        };

        Ok(ReconcileReport { key, change, pdf })
    }

    /// Fetches and uploads the permit PDF. Fetch and upload failures leave the
    /// record unarchived; only the final store write can fail the call.
    pub async fn archive_pdf(&self, key: RecordKey, permit_number: &str) -> Result<PdfOutcome, SyncError> {
        let bytes = match self.source.fetch_document(permit_number).await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(permit_number, error = %err, "permit pdf fetch failed");
                return Ok(PdfOutcome::Unavailable);
            }
        };
        if bytes.is_empty() {
            debug!(permit_number, "permit pdf is empty");
            return Ok(PdfOutcome::Unavailable);
        }

        let url = match self
            .blobs
            .upload(&pdf_blob_key(permit_number), &bytes, PDF_CONTENT_TYPE)
            .await
        {
            Ok(url) => url,
            Err(err) => {
                warn!(permit_number, error = %err, "permit pdf upload failed");
                return Ok(PdfOutcome::UploadFailed);
            }
        };

        let archive = PdfArchive {
            reference: pdf_file_name(permit_number),
            url,
        };
        self.store.update(key, &PermitUpdate::pdf(archive.clone())).await?;
        info!(permit_number, url = %archive.url, "permit pdf archived");
        Ok(PdfOutcome::Archived(archive))
    }
}
