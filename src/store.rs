use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::error::{ConfigError, StoreError};
use crate::record::{RequestRecord, ResponseRecord};

/// Log table layout: table name, id column, and the ordered custom columns.
///
/// Identifiers are validated once here and are the only part of a statement
/// that is not a bound parameter; every value travels as a placeholder.
#[derive(Debug, Clone)]
pub struct Schema {
    table: String,
    id_column: String,
    custom: Vec<String>,
    insert_before: String,
    insert_complete: String,
    update_after: String,
}

impl Schema {
    pub fn new(
        table: impl Into<String>,
        id_column: impl Into<String>,
        custom: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<Self, ConfigError> {
        let table = table.into();
        let id_column = id_column.into();
        let custom: Vec<String> = custom.into_iter().map(Into::into).collect();

        check_identifier(&table)?;
        check_identifier(&id_column)?;
        for name in &custom {
            check_identifier(name)?;
        }

        let custom_cols: String = custom.iter().map(|c| format!(", {c}")).collect();

        let insert_before = format!(
            "INSERT INTO {table} (requestTime, requestUri, requestMethod, requestParams{custom_cols}) \
             VALUES ({})",
            placeholders(4 + custom.len()),
        );
        let insert_complete = format!(
            "INSERT INTO {table} (requestTime, requestUri, requestMethod, requestParams, \
             responseTime, responseStatus, response{custom_cols}) VALUES ({})",
            placeholders(7 + custom.len()),
        );
        let custom_sets: String = custom.iter().map(|c| format!(", {c} = ?")).collect();
        let update_after = format!(
            "UPDATE {table} SET responseTime = ?, responseStatus = ?, response = ?{custom_sets} \
             WHERE {id_column} = ?",
        );

        Ok(Schema {
            table,
            id_column,
            custom,
            insert_before,
            insert_complete,
            update_after,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn id_column(&self) -> &str {
        &self.id_column
    }

    pub fn custom_columns(&self) -> &[String] {
        &self.custom
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn check_identifier(name: &str) -> Result<(), ConfigError> {
    let mut chars = name.chars();
    let ok = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if ok {
        Ok(())
    } else {
        Err(ConfigError::InvalidIdentifier(name.to_string()))
    }
}

/// Persistence boundary for access-log rows.
///
/// `insert_before` and `update_after` form the two-phase strategy, correlated
/// by the id returned from the before write. `insert_complete` is the
/// single-write strategy. Failures are surfaced to the caller, never retried.
#[async_trait(?Send)]
pub trait LogStore {
    /// Ordered custom-column names this store was configured with.
    fn custom_columns(&self) -> &[String];

    /// Creates a partial row (response fields null) and returns its id.
    async fn insert_before(
        &self,
        request: &RequestRecord,
        custom: &[Option<String>],
    ) -> Result<i64, StoreError>;

    /// Creates one fully-populated row in a single write.
    async fn insert_complete(
        &self,
        request: &RequestRecord,
        response: &ResponseRecord,
        custom: &[Option<String>],
    ) -> Result<(), StoreError>;

    /// Fills the response fields of the row created by `insert_before`.
    async fn update_after(
        &self,
        id: i64,
        response: &ResponseRecord,
        custom: &[Option<String>],
    ) -> Result<(), StoreError>;
}

/// `LogStore` backed by a SQLite pool. Statement text is rendered once from
/// the schema at construction.
#[derive(Debug, Clone)]
pub struct SqliteLogStore {
    pool: SqlitePool,
    schema: Schema,
}

impl SqliteLogStore {
    pub fn new(pool: SqlitePool, schema: Schema) -> Self {
        SqliteLogStore { pool, schema }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }
}

#[async_trait(?Send)]
impl LogStore for SqliteLogStore {
    fn custom_columns(&self) -> &[String] {
        self.schema.custom_columns()
    }

    async fn insert_before(
        &self,
        request: &RequestRecord,
        custom: &[Option<String>],
    ) -> Result<i64, StoreError> {
        let mut query = sqlx::query(&self.schema.insert_before)
            .bind(request.time)
            .bind(&request.uri)
            .bind(request.method)
            .bind(&request.params);
        for value in custom {
            query = query.bind(value.as_deref());
        }
        let done = query.execute(&self.pool).await?;
        Ok(done.last_insert_rowid())
    }

    async fn insert_complete(
        &self,
        request: &RequestRecord,
        response: &ResponseRecord,
        custom: &[Option<String>],
    ) -> Result<(), StoreError> {
        let mut query = sqlx::query(&self.schema.insert_complete)
            .bind(request.time)
            .bind(&request.uri)
            .bind(request.method)
            .bind(&request.params)
            .bind(response.time)
            .bind(i64::from(response.status))
            .bind(&response.body);
        for value in custom {
            query = query.bind(value.as_deref());
        }
        query.execute(&self.pool).await?;
        Ok(())
    }

    async fn update_after(
        &self,
        id: i64,
        response: &ResponseRecord,
        custom: &[Option<String>],
    ) -> Result<(), StoreError> {
        let mut query = sqlx::query(&self.schema.update_after)
            .bind(response.time)
            .bind(i64::from(response.status))
            .bind(&response.body);
        for value in custom {
            query = query.bind(value.as_deref());
        }
        query.bind(id).execute(&self.pool).await?;
        Ok(())
    }
}
