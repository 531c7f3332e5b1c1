use std::str::FromStr;
use std::time::Duration;

use arkiv_model::{ArchiveReceipt, ArchiveWrite, ArchivedRecord, RecordQuery, format_document_date};
use chrono::{Local, NaiveDate, NaiveDateTime};
use sqlx::Executor;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const MIGRATE_TIMEOUT: Duration = Duration::from_secs(10);

// Small pool that fails acquisition fast instead of queueing callers.
const POOL_MAX_CONNECTIONS: u32 = 4;
const POOL_MIN_CONNECTIONS: u32 = 1;
const POOL_ACQUIRE_TIMEOUT: Duration = Duration::from_millis(250);
const POOL_MAX_LIFETIME: Duration = Duration::from_secs(26);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

const SELECT_COLUMNS: &str = "id, created_at, created_by, source, document_id, content, document_date, subject_person_id, national_id, organization_id, topic";

#[derive(Debug)]
pub enum StoreError {
    Misconfigured(String),
    Timeout,
    Transient(String),
    Sqlx(sqlx::Error),
}

impl StoreError {
    /// Transient failures are connectivity problems a caller may retry;
    /// the HTTP layer maps them to 503 instead of 500.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Timeout | StoreError::Transient(_))
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Misconfigured(message) => {
                write!(f, "archive store misconfigured: {}", message)
            }
            StoreError::Timeout => write!(f, "archive store operation timed out"),
            StoreError::Transient(message) => {
                write!(f, "transient connection failure: {}", message)
            }
            StoreError::Sqlx(err) => write!(f, "archive store sql error: {}", err),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<sqlx::Error> for StoreError {
    fn from(value: sqlx::Error) -> Self {
        match value {
            err @ (sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)) => {
                StoreError::Transient(err.to_string())
            }
            other => StoreError::Sqlx(other),
        }
    }
}

/// Connection settings. `tables` is the ordered generation list: every entry
/// is queried on fetch, only the last one receives writes.
#[derive(Clone)]
pub struct StoreSettings {
    pub db_url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tables: Vec<String>,
}

#[derive(Clone)]
pub struct ArchiveStore {
    pool: sqlx::PgPool,
    tables: Vec<String>,
    current: String,
    op_timeout: Duration,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct ArchiveRow {
    id: i64,
    created_at: NaiveDateTime,
    created_by: String,
    source: String,
    document_id: String,
    content: String,
    document_date: Option<NaiveDate>,
    subject_person_id: String,
    national_id: String,
    organization_id: String,
    topic: String,
}

impl From<ArchiveRow> for ArchivedRecord {
    fn from(row: ArchiveRow) -> Self {
        ArchivedRecord {
            id: row.id,
            created_at: row.created_at.format(arkiv_model::TIMESTAMP_FORMAT).to_string(),
            created_by: row.created_by,
            source: row.source,
            document_id: row.document_id,
            content: row.content,
            document_date: format_document_date(row.document_date),
            subject_person_id: row.subject_person_id,
            national_id: row.national_id,
            organization_id: row.organization_id,
            topic: row.topic,
        }
    }
}

impl ArchiveStore {
    pub async fn connect(
        settings: StoreSettings,
        op_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let Some(current) = settings.tables.last().cloned() else {
            return Err(StoreError::Misconfigured(
                "generation table list is empty".to_string(),
            ));
        };
        for table in &settings.tables {
            if !is_valid_table_name(table) {
                return Err(StoreError::Misconfigured(format!(
                    "invalid generation table name: {table}"
                )));
            }
        }

        let mut connect_options = PgConnectOptions::from_str(&settings.db_url)
            .map_err(|err| StoreError::Misconfigured(format!("bad DB_URL: {err}")))?;
        if let Some(username) = &settings.username {
            connect_options = connect_options.username(username);
        }
        if let Some(password) = &settings.password {
            connect_options = connect_options.password(password);
        }

        let pool = tokio::time::timeout(
            CONNECT_TIMEOUT,
            PgPoolOptions::new()
                .max_connections(POOL_MAX_CONNECTIONS)
                .min_connections(POOL_MIN_CONNECTIONS)
                .acquire_timeout(POOL_ACQUIRE_TIMEOUT)
                .max_lifetime(POOL_MAX_LIFETIME)
                .idle_timeout(POOL_IDLE_TIMEOUT)
                .after_connect(|conn, _meta| {
                    Box::pin(async move {
                        conn.execute(
                            "SET SESSION CHARACTERISTICS AS TRANSACTION ISOLATION LEVEL REPEATABLE READ",
                        )
                        .await?;
                        Ok(())
                    })
                })
                .connect_with(connect_options),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;

        Ok(Self {
            pool,
            tables: settings.tables,
            current,
            op_timeout,
        })
    }

    pub async fn connect_and_migrate(
        settings: StoreSettings,
        op_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let store = Self::connect(settings, op_timeout).await?;
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        tokio::time::timeout(MIGRATE_TIMEOUT, migrate(&self.pool))
            .await
            .map_err(|_| StoreError::Timeout)??;
        Ok(())
    }

    /// Inserts every unit of a validated batch in one transaction against the
    /// current generation and returns one receipt per inserted row. Nothing
    /// is kept if any insert fails.
    pub async fn add_archive(
        &self,
        writes: &[ArchiveWrite],
    ) -> Result<Vec<ArchiveReceipt>, StoreError> {
        let insert_sql = format!(
            "INSERT INTO {} (created_at, created_by, source, document_id, content, document_date, subject_person_id, national_id, organization_id, topic, confidential) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) RETURNING id",
            self.current
        );

        let receipts = tokio::time::timeout(self.op_timeout, async {
            let mut tx = self.pool.begin().await?;
            let mut receipts = Vec::with_capacity(writes.len());
            for write in writes {
                let created_at = Local::now().naive_local();
                let (id,): (i64,) = sqlx::query_as(&insert_sql)
                    .bind(created_at)
                    .bind(&write.created_by)
                    .bind(&write.source)
                    .bind(&write.document_id)
                    .bind(&write.content)
                    .bind(write.document_date)
                    .bind(&write.subject_person_id)
                    .bind(&write.national_id)
                    .bind(&write.organization_id)
                    .bind(&write.topic)
                    .bind(write.confidential)
                    .fetch_one(&mut *tx)
                    .await?;
                receipts.push(ArchiveReceipt::build(id, created_at, write));
            }
            tx.commit().await?;
            Ok::<_, sqlx::Error>(receipts)
        })
        .await
        .map_err(|_| StoreError::Timeout)??;

        Ok(receipts)
    }

    /// Runs the query against every generation, merges the rows and sorts
    /// them ascending by id. Confidential rows never leave the store.
    pub async fn fetch_archive(
        &self,
        query: &RecordQuery,
    ) -> Result<Vec<ArchivedRecord>, StoreError> {
        let mut rows = tokio::time::timeout(self.op_timeout, async {
            let mut rows: Vec<ArchiveRow> = Vec::new();
            for table in &self.tables {
                let sql = select_sql(table, query);
                let mut fetch = sqlx::query_as::<_, ArchiveRow>(&sql);
                if let Some(id) = query.id {
                    fetch = fetch.bind(id);
                }
                if let Some(source) = &query.source {
                    fetch = fetch.bind(source);
                }
                if let Some(document_id) = &query.document_id {
                    fetch = fetch.bind(document_id);
                }
                if let Some(document_date) = query.document_date {
                    fetch = fetch.bind(document_date);
                }
                if let Some(subject_person_id) = &query.subject_person_id {
                    fetch = fetch.bind(subject_person_id);
                }
                if let Some(national_id) = &query.national_id {
                    fetch = fetch.bind(national_id);
                }
                if let Some(organization_id) = &query.organization_id {
                    fetch = fetch.bind(organization_id);
                }
                if let Some(topic) = &query.topic {
                    fetch = fetch.bind(topic);
                }
                rows.extend(fetch.fetch_all(&self.pool).await?);
            }
            Ok::<_, sqlx::Error>(rows)
        })
        .await
        .map_err(|_| StoreError::Timeout)??;

        rows.sort_by_key(|row| row.id);
        Ok(rows.into_iter().map(ArchivedRecord::from).collect())
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        tokio::time::timeout(self.op_timeout, sqlx::query("SELECT 1").execute(&self.pool))
            .await
            .map_err(|_| StoreError::Timeout)??;
        Ok(())
    }

    pub async fn list_tables(&self) -> Result<Vec<String>, StoreError> {
        let rows: Vec<(String,)> = tokio::time::timeout(
            self.op_timeout,
            sqlx::query_as(
                "SELECT tablename::text FROM pg_catalog.pg_tables WHERE schemaname = current_schema() ORDER BY tablename",
            )
            .fetch_all(&self.pool),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;
        Ok(rows.into_iter().map(|(name,)| name).collect())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Table names end up interpolated into SQL, so only plain snake_case
/// identifiers are accepted.
fn is_valid_table_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

fn select_sql(table: &str, query: &RecordQuery) -> String {
    let mut sql = format!("SELECT {SELECT_COLUMNS} FROM {table} WHERE confidential = FALSE");
    let mut placeholder = 0usize;
    for (column, present) in [
        ("id", query.id.is_some()),
        ("source", query.source.is_some()),
        ("document_id", query.document_id.is_some()),
        ("document_date", query.document_date.is_some()),
        ("subject_person_id", query.subject_person_id.is_some()),
        ("national_id", query.national_id.is_some()),
        ("organization_id", query.organization_id.is_some()),
        ("topic", query.topic.is_some()),
    ] {
        if present {
            placeholder += 1;
            sql.push_str(&format!(" AND {column} = ${placeholder}"));
        }
    }
    sql
}

pub async fn migrate(pool: &sqlx::PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_sql_always_excludes_confidential_rows() {
        let sql = select_sql("arkiv", &RecordQuery::default());
        assert_eq!(
            sql,
            format!("SELECT {SELECT_COLUMNS} FROM arkiv WHERE confidential = FALSE")
        );
    }

    #[test]
    fn select_sql_numbers_predicates_in_bind_order() {
        let query = RecordQuery {
            source: Some("salesforce".to_string()),
            document_date: NaiveDate::from_ymd_opt(2024, 1, 31),
            topic: Some("DAG".to_string()),
            ..RecordQuery::default()
        };
        let sql = select_sql("arkivv4", &query);
        assert!(sql.ends_with(
            "WHERE confidential = FALSE AND source = $1 AND document_date = $2 AND topic = $3"
        ));
    }

    #[test]
    fn pool_errors_classify_as_transient() {
        assert!(StoreError::from(sqlx::Error::PoolTimedOut).is_transient());
        assert!(StoreError::from(sqlx::Error::PoolClosed).is_transient());
        assert!(StoreError::from(sqlx::Error::Io(std::io::Error::other("reset"))).is_transient());
        assert!(StoreError::Timeout.is_transient());
        assert!(!StoreError::from(sqlx::Error::RowNotFound).is_transient());
    }

    #[test]
    fn table_names_are_restricted_to_plain_identifiers() {
        assert!(is_valid_table_name("arkiv"));
        assert!(is_valid_table_name("arkivv4"));
        assert!(is_valid_table_name("arkiv_v3"));
        assert!(!is_valid_table_name(""));
        assert!(!is_valid_table_name("4arkiv"));
        assert!(!is_valid_table_name("arkiv; drop table arkiv"));
        assert!(!is_valid_table_name("Arkiv"));
    }
}
