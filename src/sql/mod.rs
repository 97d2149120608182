// SQL driver layer
// One trait for the three relational backends plus the shared policies:
// statement preparation (named placeholder rewriting, positional mapping),
// the reconnect-once recovery on dropped connections, and retry with
// exponential backoff for transient failures.

pub mod mysql;
pub mod postgres;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::errors::is_connection_dropped;

/// Keys consulted, in order, when mapping bare `?` placeholders.
const PAGINATION_KEYS: &[&str] = &["limit", "offset"];

/// Driver contract for relational backends.
///
/// Drivers own their pool handle; `execute` runs one statement and returns
/// rows as JSON maps with native types already converted to portable ones
/// (numeric -> number, datetime -> ISO string, UUID -> string, blob -> lossy
/// UTF-8 text).
#[async_trait]
pub trait SqlDriver: Send + Sync {
    fn name(&self) -> &str;

    /// Establish the pool. Idempotent.
    async fn connect(&self) -> Result<()>;

    /// Tear down and re-establish the pool after a dropped connection.
    async fn reconnect(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;

    /// Execute a statement with positional bind values.
    async fn execute(&self, sql: &str, binds: &[Value]) -> Result<Vec<Map<String, Value>>>;

    /// Cheap statement used by connection tests.
    fn test_query(&self) -> &str {
        "SELECT 1"
    }
}

/// Verify the driver can reach its backend.
pub async fn test_connection(driver: &dyn SqlDriver) -> bool {
    match driver.execute(driver.test_query(), &[]).await {
        Ok(_) => {
            debug!("Database connection test successful: {}", driver.name());
            true
        }
        Err(error) => {
            warn!("Database connection test failed for {}: {error}", driver.name());
            false
        }
    }
}

/// Execute a statement, recovering once from a dropped connection.
///
/// When the driver reports an error whose text carries the closed/lost
/// signature, the pool is re-established and the statement retried exactly
/// once; `reconnects` counts how many recoveries occurred.
pub async fn execute_with_recovery(
    driver: &dyn SqlDriver,
    sql: &str,
    binds: &[Value],
    reconnects: &AtomicUsize,
) -> Result<Vec<Map<String, Value>>> {
    match driver.execute(sql, binds).await {
        Ok(rows) => Ok(rows),
        Err(first_error) => {
            if !is_connection_dropped(&first_error.to_string()) {
                error!("Error executing {} query: {first_error}", driver.name());
                return Err(first_error);
            }

            warn!(
                "Connection to {} appears closed, reinitializing datasource",
                driver.name()
            );
            driver.reconnect().await?;
            reconnects.fetch_add(1, Ordering::SeqCst);
            info!("Reconnected to {} successfully", driver.name());

            driver.execute(sql, binds).await
        }
    }
}

/// Execute with retry and exponential backoff for transient failures.
pub async fn execute_with_retry(
    driver: &dyn SqlDriver,
    sql: &str,
    binds: &[Value],
    max_retries: usize,
) -> Result<Vec<Map<String, Value>>> {
    let mut attempt = 0;
    loop {
        match driver.execute(sql, binds).await {
            Ok(rows) => return Ok(rows),
            Err(error) if attempt + 1 < max_retries => {
                warn!("Query attempt {} failed: {error}, retrying", attempt + 1);
                tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

/// Rewrite a statement's placeholders to bare `?` and produce the matching
/// positional bind list.
///
/// Handles, in order of precedence:
/// - `%(name)s` named placeholders,
/// - `:name` named placeholders,
/// - pre-existing `?` placeholders, mapped first to the pagination keys
///   `[limit, offset]`, then to the remaining parameter values in insertion
///   order.
pub fn prepare_statement(sql: &str, params: &Map<String, Value>) -> (String, Vec<Value>) {
    static PYFORMAT: once_cell::sync::Lazy<Regex> =
        once_cell::sync::Lazy::new(|| Regex::new(r"%\((\w+)\)s").expect("valid regex"));
    static NAMED: once_cell::sync::Lazy<Regex> =
        once_cell::sync::Lazy::new(|| Regex::new(r":(\w+)").expect("valid regex"));

    let mut binds: Vec<Value> = Vec::new();
    let mut used_keys: Vec<String> = Vec::new();

    // `%(name)s` -> ?
    let sql = PYFORMAT.replace_all(sql, |captures: &regex::Captures<'_>| {
        let key = &captures[1];
        binds.push(params.get(key).cloned().unwrap_or(Value::Null));
        used_keys.push(key.to_string());
        "?"
    });

    // `:name` -> ? (skip things like `::type` casts by requiring a word char
    // boundary before the colon not being another colon)
    let mut rewritten = String::with_capacity(sql.len());
    let mut last_end = 0;
    for captures in NAMED.captures_iter(&sql) {
        let whole = captures.get(0).unwrap();
        let preceded_by_colon = sql[..whole.start()].ends_with(':');
        if preceded_by_colon {
            continue;
        }
        let key = &captures[1];
        if !params.contains_key(key) {
            continue;
        }
        rewritten.push_str(&sql[last_end..whole.start()]);
        rewritten.push('?');
        binds.push(params.get(key).cloned().unwrap_or(Value::Null));
        used_keys.push(key.to_string());
        last_end = whole.end();
    }
    rewritten.push_str(&sql[last_end..]);

    // Bare `?` placeholders map to pagination keys then leftover values
    let placeholder_count = rewritten.matches('?').count();
    if placeholder_count > binds.len() {
        let mut positional: Vec<Value> = Vec::new();
        for key in PAGINATION_KEYS {
            if positional.len() + binds.len() >= placeholder_count {
                break;
            }
            if let Some(value) = params.get(*key) {
                if !used_keys.iter().any(|used| used == key) {
                    positional.push(value.clone());
                    used_keys.push((*key).to_string());
                }
            }
        }
        for (key, value) in params {
            if positional.len() + binds.len() >= placeholder_count {
                break;
            }
            if !used_keys.iter().any(|used| used == key) {
                positional.push(value.clone());
                used_keys.push(key.clone());
            }
        }
        binds.extend(positional);
    }

    (rewritten, binds)
}

/// Build a database URL from config parts, masking nothing here; callers
/// must not log the result verbatim.
pub(crate) fn encode_credentials(username: &str, password: &str) -> String {
    if password.is_empty() {
        username.to_string()
    } else {
        format!("{username}:{password}")
    }
}
