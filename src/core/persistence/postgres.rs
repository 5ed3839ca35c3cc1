// src/core/persistence/postgres.rs

//! A `sqlx::PgPool`-backed [`PersistencePort`] (spec §6). The table contract
//! (`bigint` identities, array columns, UTC timestamps) is Postgres-shaped
//! in the spec itself; the teacher carries no SQL client of its own (it
//! *is* the database), so `sqlx` is adopted from the wider retrieval pack.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::QueryBuilder;

use crate::core::errors::SourceMgrError;
use crate::core::model::LogLevel;
use crate::core::ports::{AggregatorRecord, PersistencePort, SqlValue};

pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, SourceMgrError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(PostgresPersistence { pool })
    }

    pub async fn migrate(&self) -> Result<(), SourceMgrError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| SourceMgrError::Database(e.to_string()))
    }

    fn push_value(builder: &mut QueryBuilder<'_, sqlx::Postgres>, value: &SqlValue) {
        match value {
            SqlValue::Text(v) => {
                builder.push_bind(v.clone());
            }
            SqlValue::OptText(v) => {
                builder.push_bind(v.clone());
            }
            SqlValue::Bool(v) => {
                builder.push_bind(*v);
            }
            SqlValue::OptBool(v) => {
                builder.push_bind(*v);
            }
            SqlValue::OptF64(v) => {
                builder.push_bind(*v);
            }
            SqlValue::OptI32(v) => {
                builder.push_bind(*v);
            }
            SqlValue::OptI64(v) => {
                builder.push_bind(*v);
            }
            SqlValue::OptBytes(v) => {
                builder.push_bind(v.clone());
            }
            SqlValue::StringArray(v) => {
                builder.push_bind(v.clone());
            }
            SqlValue::OptTimestamp(v) => {
                builder.push_bind(*v);
            }
        }
    }
}

#[async_trait]
impl PersistencePort for PostgresPersistence {
    async fn insert_row(&self, table: &'static str, fields: &[(&'static str, SqlValue)]) -> Result<i64, SourceMgrError> {
        let mut builder: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(format!("INSERT INTO {table} ("));
        for (i, (name, _)) in fields.iter().enumerate() {
            if i > 0 {
                builder.push(", ");
            }
            builder.push(*name);
        }
        builder.push(") VALUES (");
        for (i, (_, value)) in fields.iter().enumerate() {
            if i > 0 {
                builder.push(", ");
            }
            Self::push_value(&mut builder, value);
        }
        builder.push(") RETURNING id");

        let row: (i64,) = builder.build_query_as().fetch_one(&self.pool).await?;
        Ok(row.0)
    }

    async fn update_fields(
        &self,
        table: &'static str,
        id: i64,
        fields: &[(&'static str, SqlValue)],
    ) -> Result<u64, SourceMgrError> {
        if fields.is_empty() {
            return Ok(0);
        }
        let mut builder: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(format!("UPDATE {table} SET "));
        for (i, (name, value)) in fields.iter().enumerate() {
            if i > 0 {
                builder.push(", ");
            }
            builder.push(format!("{name} = "));
            Self::push_value(&mut builder, value);
        }
        builder.push(" WHERE id = ");
        builder.push_bind(id);

        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn delete_row(&self, table: &'static str, id: i64) -> Result<u64, SourceMgrError> {
        let sql = format!("DELETE FROM {table} WHERE id = $1");
        let result = sqlx::query(&sql).bind(id).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn append_feed_log(&self, feed_id: i64, level: LogLevel, message: &str) -> Result<(), SourceMgrError> {
        sqlx::query("INSERT INTO feed_logs (feed_id, level, message) VALUES ($1, $2, $3)")
            .bind(feed_id)
            .bind(level.to_string())
            .bind(message)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn store_advisory(&self, feed_id: i64, url: &str, document: &[u8]) -> Result<(), SourceMgrError> {
        sqlx::query(
            "INSERT INTO advisories (feed_id, url, document) VALUES ($1, $2, $3)
             ON CONFLICT (feed_id, url) DO UPDATE SET document = EXCLUDED.document, downloaded_at = now()",
        )
        .bind(feed_id)
        .bind(url)
        .bind(document)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_aggregators(&self) -> Result<Vec<AggregatorRecord>, SourceMgrError> {
        let rows: Vec<(i64, String, String, bool, Option<DateTime<Utc>>, Option<DateTime<Utc>>)> = sqlx::query_as(
            "SELECT id, name, url, active, checksum_ack, checksum_updated FROM aggregators ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(id, name, url, active, checksum_ack, checksum_updated)| AggregatorRecord {
                id,
                name,
                url,
                active,
                checksum_ack,
                checksum_updated,
            })
            .collect())
    }

    async fn acknowledge_aggregator(&self, id: i64) -> Result<(), SourceMgrError> {
        sqlx::query("UPDATE aggregators SET checksum_ack = checksum_updated WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
