//! Core domain model for permit sync: records, updates, fetch windows.

use std::fmt;

use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "permit-core";

/// Date format the permit search endpoint expects in its query string.
pub const SOURCE_DATE_FORMAT: &str = "%m/%d/%Y";

/// Source field carrying the natural key of a permit.
pub const PERMIT_NUMBER_FIELD: &str = "PermitNumber";

pub const PDF_CONTENT_TYPE: &str = "application/pdf";

/// Opaque attribute map exactly as returned by the source.
pub type PermitFields = serde_json::Map<String, serde_json::Value>;

/// Store-assigned identity of a persisted permit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordKey(pub Uuid);

impl RecordKey {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RecordKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One permit known locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermitRecord {
    pub permit_number: String,
    #[serde(default)]
    pub fields: PermitFields,
    pub date_created: NaiveDate,
    pub last_seen: NaiveDate,
    #[serde(default)]
    pub pdf_reference: Option<String>,
    #[serde(default)]
    pub pdf_url: Option<String>,
}

impl PermitRecord {
    /// Builds the record for a permit observed locally for the first time.
    pub fn first_seen(permit_number: impl Into<String>, fields: PermitFields, today: NaiveDate) -> Self {
        Self {
            permit_number: permit_number.into(),
            fields,
            date_created: today,
            last_seen: today,
            pdf_reference: None,
            pdf_url: None,
        }
    }

    pub fn has_pdf(&self) -> bool {
        self.pdf_reference.is_some()
    }

    /// Applies an update without ever moving `last_seen` backwards or
    /// replacing an archived PDF.
    pub fn apply(&mut self, update: &PermitUpdate) {
        if let Some(last_seen) = update.last_seen {
            self.last_seen = self.last_seen.max(last_seen);
        }
        if let Some(pdf) = &update.pdf {
            if self.pdf_reference.is_none() {
                self.pdf_reference = Some(pdf.reference.clone());
                self.pdf_url = Some(pdf.url.clone());
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredPermit {
    pub key: RecordKey,
    pub record: PermitRecord,
}

/// Result of a successful PDF archival.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PdfArchive {
    /// Filename token persisted as `pdf_reference`, e.g. `P2.pdf`.
    pub reference: String,
    /// Public URL handed back by the blob store.
    pub url: String,
}

/// Partial update of a stored permit. Source fields are never refreshed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermitUpdate {
    pub last_seen: Option<NaiveDate>,
    pub pdf: Option<PdfArchive>,
}

impl PermitUpdate {
    pub fn last_seen(date: NaiveDate) -> Self {
        Self {
            last_seen: Some(date),
            pdf: None,
        }
    }

    pub fn pdf(archive: PdfArchive) -> Self {
        Self {
            last_seen: None,
            pdf: Some(archive),
        }
    }
}

pub fn pdf_file_name(permit_number: &str) -> String {
    format!("{permit_number}.pdf")
}

/// Deterministic blob key for a permit's PDF.
pub fn pdf_blob_key(permit_number: &str) -> String {
    format!("permitpdf/{}", pdf_file_name(permit_number))
}

/// Inclusive issue-date range requested from the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchWindow {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl FetchWindow {
    /// Window from `from` through tomorrow relative to `today`.
    pub fn through_tomorrow(from: NaiveDate, today: NaiveDate) -> Self {
        Self {
            from,
            to: today.succ_opt().unwrap_or(today),
        }
    }
}

pub fn format_source_date(date: NaiveDate) -> String {
    date.format(SOURCE_DATE_FORMAT).to_string()
}

/// Accepts `YYYY-MM-DD` or the source's `MM/DD/YYYY`.
pub fn parse_date(input: &str) -> Result<NaiveDate, chrono::ParseError> {
    let input = input.trim();
    NaiveDate::parse_from_str(input, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(input, SOURCE_DATE_FORMAT))
}

/// Source of "today" for stamping records.
pub trait Clock: Send + Sync {
    fn today(&self) -> NaiveDate;
}

/// Local calendar date of the host.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn today(&self) -> NaiveDate {
        Local::now().date_naive()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub NaiveDate);

impl Clock for FixedClock {
    fn today(&self) -> NaiveDate {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn first_seen_stamps_both_dates() {
        let record = PermitRecord::first_seen("P1", PermitFields::new(), date(2024, 3, 9));
        assert_eq!(record.date_created, date(2024, 3, 9));
        assert_eq!(record.last_seen, date(2024, 3, 9));
        assert!(!record.has_pdf());
    }

    #[test]
    fn last_seen_never_moves_backwards() {
        let mut record = PermitRecord::first_seen("P1", PermitFields::new(), date(2024, 3, 9));
        record.apply(&PermitUpdate::last_seen(date(2024, 3, 12)));
        record.apply(&PermitUpdate::last_seen(date(2024, 3, 10)));
        assert_eq!(record.last_seen, date(2024, 3, 12));
        assert_eq!(record.date_created, date(2024, 3, 9));
    }

    #[test]
    fn pdf_reference_is_written_once() {
        let mut record = PermitRecord::first_seen("P1", PermitFields::new(), date(2024, 3, 9));
        record.apply(&PermitUpdate::pdf(PdfArchive {
            reference: "P1.pdf".into(),
            url: "file:///a/P1.pdf".into(),
        }));
        record.apply(&PermitUpdate::pdf(PdfArchive {
            reference: "other.pdf".into(),
            url: "file:///b/other.pdf".into(),
        }));
        assert_eq!(record.pdf_reference.as_deref(), Some("P1.pdf"));
        assert_eq!(record.pdf_url.as_deref(), Some("file:///a/P1.pdf"));
    }

    #[test]
    fn window_ends_tomorrow() {
        let window = FetchWindow::through_tomorrow(date(2024, 1, 1), date(2024, 12, 31));
        assert_eq!(window.from, date(2024, 1, 1));
        assert_eq!(window.to, date(2025, 1, 1));
    }

    #[test]
    fn dates_use_source_format_on_the_wire() {
        assert_eq!(format_source_date(date(2018, 4, 2)), "04/02/2018");
        assert_eq!(parse_date("04/02/2018").unwrap(), date(2018, 4, 2));
        assert_eq!(parse_date("2018-04-02").unwrap(), date(2018, 4, 2));
        assert!(parse_date("yesterday").is_err());
    }

    #[test]
    fn blob_key_is_derived_from_permit_number() {
        assert_eq!(pdf_file_name("X-100"), "X-100.pdf");
        assert_eq!(pdf_blob_key("X-100"), "permitpdf/X-100.pdf");
    }
}
