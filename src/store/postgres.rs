//! Postgres-backed [`CaseStore`].
//!
//! Schema lives in `migrations/0001_case_lifecycle.sql`; [`PgCaseStore::ensure_schema`]
//! applies it idempotently. Reference counters use an upsert on
//! `case_sequences`, so concurrent creators never see the same sequence.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::{PgArguments, PgPoolOptions};
use sqlx::query::Query;
use sqlx::{FromRow, PgConnection, PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use super::{CaseStore, Reassignment};
use crate::activity::{ActivityEntry, ActivityKind};
use crate::error::{CaseError, Result};
use crate::filter::{Assignee, CaseFilter, Page};
use crate::identifier::{CaseReference, SequenceKey};
use crate::record::CaseRecord;
use crate::status_machine;
use crate::types::{CaseStatus, CaseType, Priority, StaffId};

const SCHEMA: &str = include_str!("../../migrations/0001_case_lifecycle.sql");
const REFERENCE_CONSTRAINT: &str = "case_records_reference_key";

macro_rules! case_columns {
    () => {
        "id, reference, case_type, status, priority, title, description, category, \
         assigned_to, parent_reference, created_at, updated_at, version, due_at, \
         start_date, end_date, first_response_time, started_at, signed_at, \
         resolved_at, closed_at, last_contact_at, contact_attempts, \
         resolution_notes, attributes"
    };
}

const INSERT_CASE: &str = concat!(
    "INSERT INTO case_records (",
    case_columns!(),
    ") VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, \
     $16, $17, $18, $19, $20, $21, $22, $23, $24, $25)"
);

const UPDATE_CASE: &str = r#"
    UPDATE case_records
    SET case_type = $3,
        status = $4,
        priority = $5,
        title = $6,
        description = $7,
        category = $8,
        assigned_to = $9,
        parent_reference = $10,
        created_at = $11,
        updated_at = $12,
        version = $13,
        due_at = $14,
        start_date = $15,
        end_date = $16,
        first_response_time = $17,
        started_at = $18,
        signed_at = $19,
        resolved_at = $20,
        closed_at = $21,
        last_contact_at = $22,
        contact_attempts = $23,
        resolution_notes = $24,
        attributes = $25
    WHERE id = $1 AND reference = $2 AND version = $26
"#;

const SELECT_CASE: &str = concat!(
    "SELECT ",
    case_columns!(),
    " FROM case_records WHERE reference = $1"
);

/// Row shape of `case_records`.
#[derive(Debug, FromRow)]
struct CaseRow {
    id: Uuid,
    reference: String,
    case_type: String,
    status: String,
    priority: i16,
    title: String,
    description: String,
    category: Option<String>,
    assigned_to: Option<Uuid>,
    parent_reference: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    version: i64,
    due_at: Option<DateTime<Utc>>,
    start_date: Option<NaiveDate>,
    end_date: Option<NaiveDate>,
    first_response_time: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    signed_at: Option<DateTime<Utc>>,
    resolved_at: Option<DateTime<Utc>>,
    closed_at: Option<DateTime<Utc>>,
    last_contact_at: Option<DateTime<Utc>>,
    contact_attempts: i32,
    resolution_notes: Option<String>,
    attributes: serde_json::Value,
}

impl TryFrom<CaseRow> for CaseRecord {
    type Error = CaseError;

    fn try_from(row: CaseRow) -> Result<Self> {
        let case_type = CaseType::parse(&row.case_type)?;
        let priority = u8::try_from(row.priority)
            .map_err(|_| corrupt(&row.reference, "priority out of range"))
            .and_then(Priority::from_rank)?;
        let attributes: BTreeMap<String, serde_json::Value> =
            serde_json::from_value(row.attributes)
                .map_err(|e| corrupt(&row.reference, &e.to_string()))?;

        Ok(CaseRecord {
            id: row.id,
            status: CaseStatus::parse(case_type, &row.status)?,
            priority,
            title: row.title,
            description: row.description,
            category: row.category,
            assigned_to: row.assigned_to.map(StaffId),
            parent: row
                .parent_reference
                .as_deref()
                .map(CaseReference::parse)
                .transpose()?,
            created_at: row.created_at,
            updated_at: row.updated_at,
            version: u64::try_from(row.version)
                .map_err(|_| corrupt(&row.reference, "negative version"))?,
            due_at: row.due_at,
            start_date: row.start_date,
            end_date: row.end_date,
            first_response_time: row.first_response_time,
            started_at: row.started_at,
            signed_at: row.signed_at,
            resolved_at: row.resolved_at,
            closed_at: row.closed_at,
            last_contact_at: row.last_contact_at,
            contact_attempts: u32::try_from(row.contact_attempts)
                .map_err(|_| corrupt(&row.reference, "negative contact_attempts"))?,
            resolution_notes: row.resolution_notes,
            attributes,
            reference: CaseReference::parse(&row.reference)?,
        })
    }
}

/// Row shape of `case_activities`.
#[derive(Debug, FromRow)]
struct ActivityRow {
    seq: i64,
    id: Uuid,
    case_reference: String,
    author: Option<Uuid>,
    kind: String,
    body: String,
    created_at: DateTime<Utc>,
    visible_externally: bool,
}

impl TryFrom<ActivityRow> for ActivityEntry {
    type Error = CaseError;

    fn try_from(row: ActivityRow) -> Result<Self> {
        Ok(ActivityEntry {
            id: row.id,
            case: CaseReference::parse(&row.case_reference)?,
            seq: u64::try_from(row.seq)
                .map_err(|_| corrupt(&row.case_reference, "negative activity seq"))?,
            author: row.author.map(StaffId),
            kind: ActivityKind::parse(&row.kind)?,
            text: row.body,
            created_at: row.created_at,
            visible_externally: row.visible_externally,
        })
    }
}

fn corrupt(reference: &str, reason: &str) -> CaseError {
    CaseError::Storage(format!("corrupt row for {reference}: {reason}"))
}

/// Bind the 25 `case_records` columns in `case_columns!` order.
fn bind_record<'q>(
    query: Query<'q, Postgres, PgArguments>,
    record: &'q CaseRecord,
) -> Result<Query<'q, Postgres, PgArguments>> {
    let version = i64::try_from(record.version)
        .map_err(|_| CaseError::Storage(format!("version overflow on {}", record.reference)))?;
    let contact_attempts = i32::try_from(record.contact_attempts).map_err(|_| {
        CaseError::Storage(format!("contact_attempts overflow on {}", record.reference))
    })?;
    let attributes = serde_json::to_value(&record.attributes)
        .map_err(|e| CaseError::Storage(e.to_string()))?;

    Ok(query
        .bind(record.id)
        .bind(record.reference.as_str())
        .bind(record.case_type().as_str())
        .bind(record.status.as_str())
        .bind(i16::from(record.priority.rank()))
        .bind(record.title.as_str())
        .bind(record.description.as_str())
        .bind(record.category.as_deref())
        .bind(record.assigned_to.map(|s| s.0))
        .bind(record.parent.as_ref().map(CaseReference::as_str))
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(version)
        .bind(record.due_at)
        .bind(record.start_date)
        .bind(record.end_date)
        .bind(record.first_response_time)
        .bind(record.started_at)
        .bind(record.signed_at)
        .bind(record.resolved_at)
        .bind(record.closed_at)
        .bind(record.last_contact_at)
        .bind(contact_attempts)
        .bind(record.resolution_notes.as_deref())
        .bind(attributes))
}

async fn insert_activity(conn: &mut PgConnection, entry: ActivityEntry) -> Result<ActivityEntry> {
    let seq: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO case_activities
            (id, case_reference, author, kind, body, created_at, visible_externally)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING seq
        "#,
    )
    .bind(entry.id)
    .bind(entry.case.as_str())
    .bind(entry.author.map(|s| s.0))
    .bind(entry.kind.as_str())
    .bind(entry.text.as_str())
    .bind(entry.created_at)
    .bind(entry.visible_externally)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| {
        if let sqlx::Error::Database(db) = &e {
            if db.is_foreign_key_violation() {
                return CaseError::not_found(&entry.case);
            }
        }
        CaseError::from(e)
    })?;

    let seq = u64::try_from(seq).map_err(|_| corrupt(entry.case.as_str(), "negative activity seq"))?;
    Ok(ActivityEntry { seq, ..entry })
}

/// `case_type:status` keys of every terminal status.
fn terminal_keys() -> Vec<String> {
    CaseType::ALL
        .into_iter()
        .flat_map(CaseStatus::all)
        .filter(|s| status_machine::is_terminal(*s))
        .map(|s| format!("{}:{}", s.case_type(), s.as_str()))
        .collect()
}

/// Escape `%`, `_` and `\` for use inside an ILIKE pattern.
fn escape_like(needle: &str) -> String {
    let mut escaped = String::with_capacity(needle.len());
    for c in needle.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

pub struct PgCaseStore {
    pool: PgPool,
}

impl PgCaseStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indexes if missing.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        tracing::debug!("case lifecycle schema ensured");
        Ok(())
    }
}

#[async_trait]
impl CaseStore for PgCaseStore {
    async fn next_sequence(&self, key: &SequenceKey) -> Result<u32> {
        let month = i32::try_from(key.month)
            .map_err(|_| CaseError::validation("month", format!("{} out of range", key.month)))?;
        let value: i32 = sqlx::query_scalar(
            r#"
            INSERT INTO case_sequences (prefix, year, month, last_value)
            VALUES ($1, $2, $3, 1)
            ON CONFLICT (prefix, year, month)
            DO UPDATE SET last_value = case_sequences.last_value + 1
            RETURNING last_value
            "#,
        )
        .bind(key.prefix.as_str())
        .bind(key.year)
        .bind(month)
        .fetch_one(&self.pool)
        .await?;

        u32::try_from(value).map_err(|_| CaseError::Storage(format!("negative sequence for {key}")))
    }

    async fn insert(&self, record: &CaseRecord, opened: ActivityEntry) -> Result<ActivityEntry> {
        let mut tx = self.pool.begin().await?;

        bind_record(sqlx::query(INSERT_CASE), record)?
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                if let sqlx::Error::Database(db) = &e {
                    if db.is_unique_violation() && db.constraint() == Some(REFERENCE_CONSTRAINT) {
                        return CaseError::DuplicateIdentifier {
                            reference: record.reference.to_string(),
                            attempts: 1,
                        };
                    }
                }
                CaseError::from(e)
            })?;

        let entry = insert_activity(&mut tx, opened).await?;
        tx.commit().await?;
        Ok(entry)
    }

    async fn load(&self, reference: &CaseReference) -> Result<Option<CaseRecord>> {
        let row: Option<CaseRow> = sqlx::query_as(SELECT_CASE)
            .bind(reference.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(CaseRecord::try_from).transpose()
    }

    async fn commit(
        &self,
        record: &CaseRecord,
        expected_version: u64,
        activity: Option<ActivityEntry>,
    ) -> Result<Option<ActivityEntry>> {
        let expected = i64::try_from(expected_version)
            .map_err(|_| CaseError::Storage(format!("version overflow on {}", record.reference)))?;
        let mut tx = self.pool.begin().await?;

        let result = bind_record(sqlx::query(UPDATE_CASE), record)?
            .bind(expected)
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            let exists: bool =
                sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM case_records WHERE reference = $1)")
                    .bind(record.reference.as_str())
                    .fetch_one(&mut *tx)
                    .await?;
            tx.rollback().await?;
            return Err(if exists {
                tracing::debug!(reference = %record.reference, expected_version, "stale version");
                CaseError::ConcurrentModification {
                    reference: record.reference.to_string(),
                }
            } else {
                CaseError::not_found(&record.reference)
            });
        }

        let entry = match activity {
            Some(entry) => Some(insert_activity(&mut tx, entry).await?),
            None => None,
        };
        tx.commit().await?;
        Ok(entry)
    }

    async fn delete(&self, reference: &CaseReference) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        // Detach children first so their version moves with the change.
        sqlx::query(
            r#"
            UPDATE case_records
            SET parent_reference = NULL,
                version = version + 1
            WHERE parent_reference = $1
            "#,
        )
        .bind(reference.as_str())
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query("DELETE FROM case_records WHERE reference = $1")
            .bind(reference.as_str())
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }
        tx.commit().await?;
        Ok(true)
    }

    async fn append_activity(&self, entry: ActivityEntry) -> Result<ActivityEntry> {
        let mut conn = self.pool.acquire().await?;
        insert_activity(&mut conn, entry).await
    }

    async fn activities(&self, reference: &CaseReference) -> Result<Vec<ActivityEntry>> {
        let rows: Vec<ActivityRow> = sqlx::query_as(
            r#"
            SELECT seq, id, case_reference, author, kind, body, created_at, visible_externally
            FROM case_activities
            WHERE case_reference = $1
            ORDER BY created_at, seq
            "#,
        )
        .bind(reference.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ActivityEntry::try_from).collect()
    }

    async fn query(&self, filter: &CaseFilter, page: Page) -> Result<Vec<CaseRecord>> {
        let mut qb = QueryBuilder::<Postgres>::new(concat!(
            "SELECT ",
            case_columns!(),
            " FROM case_records WHERE TRUE"
        ));

        if let Some(case_type) = filter.case_type {
            qb.push(" AND case_type = ").push_bind(case_type.as_str());
        }
        if let Some(status) = filter.status {
            qb.push(" AND case_type = ")
                .push_bind(status.case_type().as_str())
                .push(" AND status = ")
                .push_bind(status.as_str());
        }
        if let Some(priority) = filter.priority {
            qb.push(" AND priority = ").push_bind(i16::from(priority.rank()));
        }
        match filter.assignee {
            Some(Assignee::Staff(staff)) => {
                qb.push(" AND assigned_to = ").push_bind(staff.0);
            }
            Some(Assignee::Unassigned) => {
                qb.push(" AND assigned_to IS NULL");
            }
            None => {}
        }
        if let Some(from) = filter.created_from {
            qb.push(" AND created_at >= ").push_bind(from);
        }
        if let Some(until) = filter.created_until {
            qb.push(" AND created_at < ").push_bind(until);
        }
        if filter.open_only {
            qb.push(" AND (case_type || ':' || status) <> ALL(")
                .push_bind(terminal_keys())
                .push(")");
        }
        if let Some(needle) = filter.needle() {
            let pattern = format!("%{}%", escape_like(&needle));
            qb.push(" AND (title ILIKE ")
                .push_bind(pattern.clone())
                .push(" OR description ILIKE ")
                .push_bind(pattern.clone())
                .push(" OR reference ILIKE ")
                .push_bind(pattern)
                .push(")");
        }

        qb.push(" ORDER BY created_at DESC, reference DESC LIMIT ")
            .push_bind(i64::try_from(page.limit).unwrap_or(i64::MAX))
            .push(" OFFSET ")
            .push_bind(i64::try_from(page.offset).unwrap_or(i64::MAX));

        let rows = qb.build_query_as::<CaseRow>().fetch_all(&self.pool).await?;
        tracing::debug!(rows = rows.len(), "case query");
        rows.into_iter().map(CaseRecord::try_from).collect()
    }

    async fn open_cases(&self, case_type: CaseType) -> Result<Vec<CaseRecord>> {
        self.query(&CaseFilter::of_type(case_type).open_only(), Page::all())
            .await
    }

    async fn has_open_children(&self, parent: &CaseReference) -> Result<bool> {
        let open: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM case_records
                WHERE parent_reference = $1
                  AND (case_type || ':' || status) <> ALL($2)
            )
            "#,
        )
        .bind(parent.as_str())
        .bind(terminal_keys())
        .fetch_one(&self.pool)
        .await?;
        Ok(open)
    }

    async fn reassign_staff(&self, reassignment: &Reassignment) -> Result<Vec<CaseReference>> {
        let allowed: Vec<String> = reassignment
            .allowed_types
            .iter()
            .map(|t| t.as_str().to_string())
            .collect();
        let mut tx = self.pool.begin().await?;

        let blocked: Option<String> = sqlx::query_scalar(
            r#"
            SELECT case_type FROM case_records
            WHERE assigned_to = $1 AND NOT (case_type = ANY($2))
            LIMIT 1
            "#,
        )
        .bind(reassignment.from.0)
        .bind(allowed.clone())
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(case_type) = blocked {
            tx.rollback().await?;
            return Err(reassignment.rejection(CaseType::parse(&case_type)?));
        }

        // The type filter keeps a case assigned after the check above out of
        // the hand-over.
        let references: Vec<String> = sqlx::query_scalar(
            r#"
            UPDATE case_records
            SET assigned_to = $2,
                updated_at = GREATEST(updated_at, $3),
                version = version + 1
            WHERE assigned_to = $1 AND case_type = ANY($4)
            RETURNING reference
            "#,
        )
        .bind(reassignment.from.0)
        .bind(reassignment.to.map(|s| s.0))
        .bind(reassignment.at)
        .bind(allowed)
        .fetch_all(&mut *tx)
        .await?;

        let mut affected = references
            .iter()
            .map(|r| CaseReference::parse(r))
            .collect::<Result<Vec<_>>>()?;
        affected.sort();

        for reference in &affected {
            insert_activity(&mut tx, reassignment.entry_for(reference)).await?;
        }
        tx.commit().await?;
        Ok(affected)
    }
}
