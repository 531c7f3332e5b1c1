use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// Persisted content column width. Longer content is split into chunks of at
/// most this many characters (not bytes), each stored as its own row.
pub const MAX_CONTENT_CHARS: usize = 131_072;

pub const SUMMARY_PREFIX_CHARS: usize = 30;

pub const CONFIDENTIAL_SUMMARY: &str = "confidential";
pub const HIDDEN: &str = "-hidden-";

pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationError {
    EmptyBatch,
    EmptyFilter,
    InvalidDocumentDate,
    InvalidFilterDate,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::EmptyBatch => {
                write!(f, "Request contains no records to archive, that is not allowed")
            }
            ValidationError::EmptyFilter => {
                write!(f, "Request contains no search parameters, that is not allowed")
            }
            ValidationError::InvalidDocumentDate => write!(
                f,
                "One or more records contain an invalid documentDate (correct format is yyyy-MM-dd)"
            ),
            ValidationError::InvalidFilterDate => write!(
                f,
                "Request contains an invalid documentDate (correct format is empty or yyyy-MM-dd)"
            ),
        }
    }
}

impl std::error::Error for ValidationError {}

/// Lowering an [`ArchiveFilter`] can fail two ways: a caller-visible
/// validation error (400), or a non-numeric id, which is not part of the
/// validation contract and propagates as an internal failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterError {
    Validation(ValidationError),
    InvalidId { value: String },
}

impl fmt::Display for FilterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterError::Validation(err) => err.fmt(f),
            FilterError::InvalidId { value } => {
                write!(f, "filter id is not numeric: {value}")
            }
        }
    }
}

impl std::error::Error for FilterError {}

impl From<ValidationError> for FilterError {
    fn from(err: ValidationError) -> Self {
        FilterError::Validation(err)
    }
}

/// One record as posted to /arkiv. Absent fields deserialize to their
/// defaults so partial payloads are accepted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ArchiveRecordInput {
    pub created_by: String,
    pub source: String,
    pub document_id: String,
    pub content: String,
    pub document_date: String,
    pub subject_person_id: String,
    pub national_id: String,
    pub organization_id: String,
    pub topic: String,
    pub confidential: bool,
}

impl ArchiveRecordInput {
    /// Empty input is a valid absent date; anything else must parse as
    /// yyyy-MM-dd.
    pub fn parsed_document_date(&self) -> Result<Option<NaiveDate>, ValidationError> {
        if self.document_date.is_empty() {
            return Ok(None);
        }
        NaiveDate::parse_from_str(&self.document_date, DATE_FORMAT)
            .map(Some)
            .map_err(|_| ValidationError::InvalidDocumentDate)
    }
}

/// One insert unit: a validated record carrying at most one content chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveWrite {
    pub created_by: String,
    pub source: String,
    pub document_id: String,
    pub content: String,
    pub document_date: Option<NaiveDate>,
    pub subject_person_id: String,
    pub national_id: String,
    pub organization_id: String,
    pub topic: String,
    pub confidential: bool,
}

/// Validates a whole batch, then expands it into insert units. Every record's
/// date is checked before any expansion happens, so an invalid date anywhere
/// rejects the batch with nothing written.
pub fn expand_batch(records: &[ArchiveRecordInput]) -> Result<Vec<ArchiveWrite>, ValidationError> {
    if records.is_empty() {
        return Err(ValidationError::EmptyBatch);
    }
    let mut dates = Vec::with_capacity(records.len());
    for record in records {
        dates.push(record.parsed_document_date()?);
    }
    let mut writes = Vec::with_capacity(records.len());
    for (record, document_date) in records.iter().zip(dates) {
        for content in chunk_content(&record.content) {
            writes.push(ArchiveWrite {
                created_by: record.created_by.clone(),
                source: record.source.clone(),
                document_id: record.document_id.clone(),
                content,
                document_date,
                subject_person_id: record.subject_person_id.clone(),
                national_id: record.national_id.clone(),
                organization_id: record.organization_id.clone(),
                topic: record.topic.clone(),
                confidential: record.confidential,
            });
        }
    }
    Ok(writes)
}

/// Content under the column width stays a single unit; anything at or over
/// it splits into runs of at most [`MAX_CONTENT_CHARS`] characters.
pub fn chunk_content(content: &str) -> Vec<String> {
    if content.chars().count() < MAX_CONTENT_CHARS {
        return vec![content.to_string()];
    }
    let mut chunks = Vec::new();
    let mut rest = content;
    while !rest.is_empty() {
        match rest.char_indices().nth(MAX_CONTENT_CHARS) {
            Some((split, _)) => {
                let (head, tail) = rest.split_at(split);
                chunks.push(head.to_string());
                rest = tail;
            }
            None => {
                chunks.push(rest.to_string());
                rest = "";
            }
        }
    }
    chunks
}

pub fn summarize(content: &str) -> String {
    let total = content.chars().count();
    if total > SUMMARY_PREFIX_CHARS {
        let prefix: String = content.chars().take(SUMMARY_PREFIX_CHARS).collect();
        format!("{prefix}... ({SUMMARY_PREFIX_CHARS} of {total} characters)")
    } else {
        content.to_string()
    }
}

pub fn format_document_date(date: Option<NaiveDate>) -> String {
    date.map(|d| d.format(DATE_FORMAT).to_string())
        .unwrap_or_default()
}

/// Write acknowledgment, one per inserted unit. Content appears only
/// summarized; confidential units additionally hide the person, national,
/// organization and topic fields. The confidential flag itself is reported
/// as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveReceipt {
    pub id: i64,
    pub created_at: String,
    pub created_by: String,
    pub source: String,
    pub document_id: String,
    pub content_summary: String,
    pub document_date: String,
    pub subject_person_id: String,
    pub national_id: String,
    pub organization_id: String,
    pub topic: String,
    pub confidential: bool,
}

impl ArchiveReceipt {
    pub fn build(id: i64, created_at: NaiveDateTime, write: &ArchiveWrite) -> Self {
        let (content_summary, subject_person_id, national_id, organization_id, topic) =
            if write.confidential {
                (
                    CONFIDENTIAL_SUMMARY.to_string(),
                    HIDDEN.to_string(),
                    HIDDEN.to_string(),
                    HIDDEN.to_string(),
                    HIDDEN.to_string(),
                )
            } else {
                (
                    summarize(&write.content),
                    write.subject_person_id.clone(),
                    write.national_id.clone(),
                    write.organization_id.clone(),
                    write.topic.clone(),
                )
            };
        ArchiveReceipt {
            id,
            created_at: created_at.format(TIMESTAMP_FORMAT).to_string(),
            created_by: write.created_by.clone(),
            source: write.source.clone(),
            document_id: write.document_id.clone(),
            content_summary,
            document_date: format_document_date(write.document_date),
            subject_person_id,
            national_id,
            organization_id,
            topic,
            confidential: write.confidential,
        }
    }
}

/// Read projection returned by /hente. Full content, no confidential flag;
/// confidential rows are filtered out before this is ever built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchivedRecord {
    pub id: i64,
    pub created_at: String,
    pub created_by: String,
    pub source: String,
    pub document_id: String,
    pub content: String,
    pub document_date: String,
    pub subject_person_id: String,
    pub national_id: String,
    pub organization_id: String,
    pub topic: String,
}

/// Search filter as posted to /hente. Empty string means "not filtered on".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ArchiveFilter {
    pub id: String,
    pub source: String,
    pub document_id: String,
    pub document_date: String,
    pub subject_person_id: String,
    pub national_id: String,
    pub organization_id: String,
    pub topic: String,
}

impl ArchiveFilter {
    pub fn is_empty(&self) -> bool {
        self.id.is_empty()
            && self.source.is_empty()
            && self.document_id.is_empty()
            && self.document_date.is_empty()
            && self.subject_person_id.is_empty()
            && self.national_id.is_empty()
            && self.organization_id.is_empty()
            && self.topic.is_empty()
    }

    pub fn to_query(&self) -> Result<RecordQuery, FilterError> {
        if self.is_empty() {
            return Err(ValidationError::EmptyFilter.into());
        }
        let id = match self.id.as_str() {
            "" => None,
            raw => Some(raw.parse::<i64>().map_err(|_| FilterError::InvalidId {
                value: raw.to_string(),
            })?),
        };
        let document_date = match self.document_date.as_str() {
            "" => None,
            raw => Some(
                NaiveDate::parse_from_str(raw, DATE_FORMAT)
                    .map_err(|_| ValidationError::InvalidFilterDate)?,
            ),
        };
        Ok(RecordQuery {
            id,
            source: non_empty(&self.source),
            document_id: non_empty(&self.document_id),
            document_date,
            subject_person_id: non_empty(&self.subject_person_id),
            national_id: non_empty(&self.national_id),
            organization_id: non_empty(&self.organization_id),
            topic: non_empty(&self.topic),
        })
    }
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Typed conjunction of equality predicates, ready for the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordQuery {
    pub id: Option<i64>,
    pub source: Option<String>,
    pub document_id: Option<String>,
    pub document_date: Option<NaiveDate>,
    pub subject_person_id: Option<String>,
    pub national_id: Option<String>,
    pub organization_id: Option<String>,
    pub topic: Option<String>,
}
