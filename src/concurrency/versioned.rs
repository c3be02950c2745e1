use crate::error::{Result, StoreError};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::query::Query;
use sqlx::sqlite::SqliteArguments;
use sqlx::{Sqlite, SqliteConnection};
use std::fmt::{self, Write as _};

/// Counter column every versioned table carries.
pub const TOKEN_COLUMN: &str = "row_version";
/// Wall-clock time of the last accepted write, for display only.
pub const LAST_MODIFIED_COLUMN: &str = "last_modified";

/// Optimistic-lock token: the `row_version` a writer read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConflictToken(pub i64);

impl ConflictToken {
    pub const INITIAL: ConflictToken = ConflictToken(1);

    pub fn value(self) -> i64 {
        self.0
    }

    pub fn next(self) -> Self {
        ConflictToken(self.0 + 1)
    }
}

impl fmt::Display for ConflictToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A table or column name that is safe to splice into SQL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Ident(String);

impl Ident {
    pub fn new(name: &str) -> Result<Self> {
        let mut chars = name.chars();
        let valid_start = chars
            .next()
            .map(|c| c.is_ascii_alphabetic() || c == '_')
            .unwrap_or(false);
        if !valid_start || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(StoreError::InvalidIdentifier(name.to_string()));
        }
        Ok(Ident(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Real(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

fn bind_value<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &'q SqlValue,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        SqlValue::Null => query.bind(None::<i64>),
        SqlValue::Integer(v) => query.bind(*v),
        SqlValue::Real(v) => query.bind(*v),
        SqlValue::Text(v) => query.bind(v.as_str()),
    }
}

/// Identifies one row of a versioned table by its integer key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordRef {
    pub table: Ident,
    pub key_column: Ident,
    pub key: i64,
}

impl RecordRef {
    pub fn new(table: &str, key: i64) -> Result<Self> {
        Self::with_key_column(table, "id", key)
    }

    pub fn with_key_column(table: &str, key_column: &str, key: i64) -> Result<Self> {
        Ok(Self {
            table: Ident::new(table)?,
            key_column: Ident::new(key_column)?,
            key,
        })
    }
}

/// Column assignments applied only if the row still carries `expected`.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedWrite {
    pub record: RecordRef,
    pub expected: ConflictToken,
    pub assignments: Vec<(Ident, SqlValue)>,
}

impl VersionedWrite {
    pub fn new(record: RecordRef, expected: ConflictToken) -> Self {
        Self {
            record,
            expected,
            assignments: Vec::new(),
        }
    }

    pub fn set(mut self, column: &str, value: impl Into<SqlValue>) -> Result<Self> {
        if column == TOKEN_COLUMN || column == LAST_MODIFIED_COLUMN {
            return Err(StoreError::InvalidIdentifier(format!(
                "{} is maintained by the store",
                column
            )));
        }
        self.assignments.push((Ident::new(column)?, value.into()));
        Ok(self)
    }
}

pub async fn read_token(
    conn: &mut SqliteConnection,
    record: &RecordRef,
) -> Result<Option<ConflictToken>> {
    let sql = format!(
        "SELECT {} FROM {} WHERE {} = ?",
        TOKEN_COLUMN, record.table, record.key_column
    );
    let token: Option<i64> = sqlx::query_scalar(&sql)
        .bind(record.key)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(token.map(ConflictToken))
}

/// Compare-and-advance in a single conditional `UPDATE`.
///
/// On success the stored token is `expected + 1`. On a stale token nothing is
/// written and the current token is reported in [`StoreError::Conflict`].
/// Runs on the caller's connection so it can share a transaction with other
/// statements; the caller commits.
pub async fn apply_versioned(
    conn: &mut SqliteConnection,
    write: &VersionedWrite,
) -> Result<ConflictToken> {
    let record = &write.record;
    let mut sql = format!("UPDATE {} SET ", record.table);
    for (column, _) in &write.assignments {
        let _ = write!(sql, "{} = ?, ", column);
    }
    let _ = write!(
        sql,
        "{tok} = {tok} + 1, {modified} = ? WHERE {key} = ? AND {tok} = ?",
        tok = TOKEN_COLUMN,
        modified = LAST_MODIFIED_COLUMN,
        key = record.key_column
    );

    let mut query = sqlx::query(&sql);
    for (_, value) in &write.assignments {
        query = bind_value(query, value);
    }
    let affected = query
        .bind(Utc::now())
        .bind(record.key)
        .bind(write.expected.value())
        .execute(&mut *conn)
        .await?
        .rows_affected();

    if affected > 0 {
        return Ok(write.expected.next());
    }

    match read_token(conn, record).await? {
        Some(actual) => Err(StoreError::Conflict {
            expected: write.expected.value(),
            actual: actual.value(),
        }),
        None => Err(StoreError::RecordNotFound {
            table: record.table.to_string(),
            key: record.key,
        }),
    }
}

/// Bumps a record's token without touching other columns, for writes that
/// change child rows but must still conflict with concurrent parent edits.
pub async fn advance_token(
    conn: &mut SqliteConnection,
    record: &RecordRef,
    expected: ConflictToken,
) -> Result<ConflictToken> {
    apply_versioned(conn, &VersionedWrite::new(record.clone(), expected)).await
}
