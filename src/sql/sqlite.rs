// SQLite driver
// Pool-backed driver over sqlx. In-memory databases pin the pool to a
// single connection so the database survives across statements.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row, TypeInfo, ValueRef};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::SqlDriver;
use crate::config::DatasourceConfig;

pub struct SqliteDriver {
    datasource: DatasourceConfig,
    pool: RwLock<Option<SqlitePool>>,
}

impl SqliteDriver {
    pub fn new(datasource: DatasourceConfig) -> Self {
        Self {
            datasource,
            pool: RwLock::new(None),
        }
    }

    fn database_url(&self) -> String {
        let path = self.datasource.param_str("database", ":memory:");
        if path == ":memory:" {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{path}?mode=rwc")
        }
    }

    async fn build_pool(&self) -> Result<SqlitePool> {
        let url = self.database_url();
        let in_memory = url == "sqlite::memory:";
        let max_connections = if in_memory {
            1
        } else {
            self.datasource.param_u16("pool_size", 5) as u32
        };

        // An in-memory database lives exactly as long as its connection, so
        // the pool must never recycle it
        let mut options = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(std::time::Duration::from_secs(
                self.datasource.connection_timeout,
            ));
        if in_memory {
            options = options
                .min_connections(1)
                .idle_timeout(None::<std::time::Duration>)
                .max_lifetime(None::<std::time::Duration>);
        }
        let pool = options.connect(&url).await?;

        debug!("Opened sqlite pool ({url})");
        Ok(pool)
    }

    async fn pool(&self) -> Result<SqlitePool> {
        self.pool
            .read()
            .await
            .clone()
            .ok_or_else(|| anyhow!("sqlite connection not initialized"))
    }
}

#[async_trait]
impl SqlDriver for SqliteDriver {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn connect(&self) -> Result<()> {
        let mut guard = self.pool.write().await;
        if guard.is_none() {
            *guard = Some(self.build_pool().await?);
        }
        Ok(())
    }

    async fn reconnect(&self) -> Result<()> {
        let mut guard = self.pool.write().await;
        if let Some(pool) = guard.take() {
            pool.close().await;
        }
        *guard = Some(self.build_pool().await?);
        info!("sqlite pool reinitialized");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Some(pool) = self.pool.write().await.take() {
            pool.close().await;
        }
        Ok(())
    }

    async fn execute(&self, sql: &str, binds: &[Value]) -> Result<Vec<Map<String, Value>>> {
        let pool = self.pool().await?;

        let mut query = sqlx::query(sql);
        for bind in binds {
            query = bind_value(query, bind);
        }

        let rows = query.fetch_all(&pool).await?;
        Ok(rows.iter().map(convert_row).collect())
    }
}

fn bind_value<'q>(
    query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    value: &'q Value,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) if n.is_i64() => query.bind(n.as_i64().unwrap()),
        Value::Number(n) => query.bind(n.as_f64().unwrap_or(0.0)),
        Value::String(s) => query.bind(s.as_str()),
        other => query.bind(other.to_string()),
    }
}

/// Decode a row into portable JSON values. SQLite typing is dynamic, so
/// the decode follows each value's actual storage class rather than the
/// declared column type.
fn convert_row(row: &SqliteRow) -> Map<String, Value> {
    let mut converted = Map::new();

    for (index, column) in row.columns().iter().enumerate() {
        let storage_class = row
            .try_get_raw(index)
            .map(|raw| raw.type_info().name().to_uppercase())
            .unwrap_or_else(|_| "NULL".to_string());

        let value = match storage_class.as_str() {
            "INTEGER" => row
                .try_get::<Option<i64>, _>(index)
                .ok()
                .flatten()
                .map(Value::from)
                .unwrap_or(Value::Null),
            "REAL" => row
                .try_get::<Option<f64>, _>(index)
                .ok()
                .flatten()
                .map(Value::from)
                .unwrap_or(Value::Null),
            "BOOLEAN" => row
                .try_get::<Option<bool>, _>(index)
                .ok()
                .flatten()
                .map(Value::from)
                .unwrap_or(Value::Null),
            "BLOB" => row
                .try_get::<Option<Vec<u8>>, _>(index)
                .ok()
                .flatten()
                .map(|bytes| Value::from(String::from_utf8_lossy(&bytes).into_owned()))
                .unwrap_or(Value::Null),
            "NULL" => Value::Null,
            _ => row
                .try_get::<Option<String>, _>(index)
                .ok()
                .flatten()
                .map(Value::from)
                .unwrap_or(Value::Null),
        };

        converted.insert(column.name().to_string(), value);
    }

    converted
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn memory_driver() -> SqliteDriver {
        SqliteDriver::new(DatasourceConfig::default())
    }

    #[tokio::test]
    async fn test_execute_and_type_conversion() -> Result<()> {
        let driver = memory_driver();
        driver.connect().await?;

        driver
            .execute(
                "CREATE TABLE orders (id INTEGER PRIMARY KEY, name TEXT, total REAL)",
                &[],
            )
            .await?;
        driver
            .execute(
                "INSERT INTO orders (id, name, total) VALUES (1, 'John Smith', 99.5)",
                &[],
            )
            .await?;

        let rows = driver.execute("SELECT * FROM orders", &[]).await?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("id"), Some(&json!(1)));
        assert_eq!(rows[0].get("name"), Some(&json!("John Smith")));
        assert_eq!(rows[0].get("total"), Some(&json!(99.5)));

        driver.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_positional_binds() -> Result<()> {
        let driver = memory_driver();
        driver.connect().await?;

        driver
            .execute("CREATE TABLE t (name TEXT, active INTEGER)", &[])
            .await?;
        driver
            .execute(
                "INSERT INTO t (name, active) VALUES (?, ?)",
                &[json!("x"), json!(1)],
            )
            .await?;

        let rows = driver
            .execute("SELECT * FROM t WHERE name = ?", &[json!("x")])
            .await?;
        assert_eq!(rows.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_execute_before_connect_fails() {
        let driver = memory_driver();
        assert!(driver.execute("SELECT 1", &[]).await.is_err());
    }
}
