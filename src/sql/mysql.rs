// MySQL driver
// Pool-backed driver over sqlx with typed row conversion keyed on the
// column's declared type.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::{Map, Value};
use sqlx::mysql::{MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::{Column, Row, TypeInfo};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{encode_credentials, SqlDriver};
use crate::config::DatasourceConfig;

pub struct MysqlDriver {
    datasource: DatasourceConfig,
    pool: RwLock<Option<MySqlPool>>,
}

impl MysqlDriver {
    pub fn new(datasource: DatasourceConfig) -> Self {
        Self {
            datasource,
            pool: RwLock::new(None),
        }
    }

    fn database_url(&self) -> String {
        let host = self.datasource.param_str("host", "localhost");
        let port = self.datasource.param_u16("port", 3306);
        let database = self.datasource.param_str("database", "mysql");
        let username = self.datasource.param_str("username", "root");
        let password = self.datasource.param_str("password", "");
        let credentials = encode_credentials(&username, &password);
        format!("mysql://{credentials}@{host}:{port}/{database}")
    }

    async fn build_pool(&self) -> Result<MySqlPool> {
        let pool = MySqlPoolOptions::new()
            .max_connections(self.datasource.param_u16("pool_size", 5) as u32)
            .acquire_timeout(std::time::Duration::from_secs(
                self.datasource.connection_timeout,
            ))
            .connect(&self.database_url())
            .await?;
        debug!("Opened mysql pool");
        Ok(pool)
    }

    async fn pool(&self) -> Result<MySqlPool> {
        self.pool
            .read()
            .await
            .clone()
            .ok_or_else(|| anyhow!("mysql connection not initialized"))
    }
}

#[async_trait]
impl SqlDriver for MysqlDriver {
    fn name(&self) -> &str {
        "mysql"
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
        info!("mysql pool reinitialized");
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
    query: sqlx::query::Query<'q, sqlx::MySql, sqlx::mysql::MySqlArguments>,
    value: &'q Value,
) -> sqlx::query::Query<'q, sqlx::MySql, sqlx::mysql::MySqlArguments> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) if n.is_i64() => query.bind(n.as_i64().unwrap()),
        Value::Number(n) => query.bind(n.as_f64().unwrap_or(0.0)),
        Value::String(s) => query.bind(s.as_str()),
        other => query.bind(other.to_string()),
    }
}

fn convert_row(row: &MySqlRow) -> Map<String, Value> {
    let mut converted = Map::new();

    for (index, column) in row.columns().iter().enumerate() {
        let type_name = column.type_info().name().to_uppercase();
        let value = convert_column(row, index, &type_name);
        converted.insert(column.name().to_string(), value);
    }

    converted
}

fn convert_column(row: &MySqlRow, index: usize, type_name: &str) -> Value {
    match type_name {
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" => row
            .try_get::<Option<i64>, _>(index)
            .ok()
            .flatten()
            .map(Value::from)
            .unwrap_or(Value::Null),
        name if name.contains("UNSIGNED") => row
            .try_get::<Option<u64>, _>(index)
            .ok()
            .flatten()
            .map(Value::from)
            .unwrap_or(Value::Null),
        "FLOAT" | "DOUBLE" => row
            .try_get::<Option<f64>, _>(index)
            .ok()
            .flatten()
            .map(Value::from)
            .unwrap_or(Value::Null),
        "DECIMAL" | "NEWDECIMAL" => row
            .try_get::<Option<Decimal>, _>(index)
            .ok()
            .flatten()
            .and_then(|decimal| decimal.to_f64())
            .map(Value::from)
            .unwrap_or(Value::Null),
        "BOOLEAN" => row
            .try_get::<Option<bool>, _>(index)
            .ok()
            .flatten()
            .map(Value::from)
            .unwrap_or(Value::Null),
        "DATE" => row
            .try_get::<Option<NaiveDate>, _>(index)
            .ok()
            .flatten()
            .map(|date| Value::from(date.format("%Y-%m-%d").to_string()))
            .unwrap_or(Value::Null),
        "DATETIME" | "TIMESTAMP" => row
            .try_get::<Option<NaiveDateTime>, _>(index)
            .ok()
            .flatten()
            .map(|ts| Value::from(ts.format("%Y-%m-%dT%H:%M:%S").to_string()))
            .unwrap_or(Value::Null),
        "TINYBLOB" | "BLOB" | "MEDIUMBLOB" | "LONGBLOB" | "VARBINARY" | "BINARY" => row
            .try_get::<Option<Vec<u8>>, _>(index)
            .ok()
            .flatten()
            .map(|bytes| Value::from(String::from_utf8_lossy(&bytes).into_owned()))
            .unwrap_or(Value::Null),
        "JSON" => row
            .try_get::<Option<Value>, _>(index)
            .ok()
            .flatten()
            .unwrap_or(Value::Null),
        _ => row
            .try_get::<Option<String>, _>(index)
            .ok()
            .flatten()
            .map(Value::from)
            .unwrap_or(Value::Null),
    }
}
