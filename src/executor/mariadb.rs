//! MariaDB Executor
//!
//! Runs statements over the MySQL text protocol so that non-preparable
//! statements (CREATE PROCEDURE bodies, LOCK TABLES, SET ...)
//! behave exactly as they would from the `mysql` client.

use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use sqlx::mysql::{MySqlConnection, MySqlPoolOptions, MySqlRow};
use sqlx::{Column, Connection, Either, Executor, MySqlPool, Row};
use tokio::sync::RwLock;

use super::{preview, QueryExecutor, QueryResult};
use crate::config::DatabaseConfig;
use crate::error::{Error, Result};

/// MariaDB executor backed by a sqlx connection pool
pub struct MariaDbExecutor {
    /// Connection pool, replaced on reconnect
    pool: RwLock<MySqlPool>,
    /// Config for reconnection
    config: DatabaseConfig,
}

impl MariaDbExecutor {
    /// Connect to the configured database, creating it first if missing
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        if let Some(database) = &config.database {
            ensure_database(config, database).await?;
        }
        let pool = Self::connect(config).await?;
        Ok(Self {
            pool: RwLock::new(pool),
            config: config.clone(),
        })
    }

    async fn connect(config: &DatabaseConfig) -> Result<MySqlPool> {
        let pool = MySqlPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(&config.url())
            .await?;
        Ok(pool)
    }

    /// Run a statement once, with the configured timeout
    async fn run(&self, sql: &str) -> Result<QueryResult> {
        let pool = self.pool.read().await.clone();
        let timeout = Duration::from_secs(self.config.query_timeout_secs);

        match tokio::time::timeout(timeout, run_text_query(&pool, sql)).await {
            Ok(result) => result,
            Err(_) => Err(Error::QueryTimeout(self.config.query_timeout_secs)),
        }
    }

    /// Close the pool
    pub async fn close(&self) {
        self.pool.read().await.close().await;
    }
}

#[async_trait]
impl QueryExecutor for MariaDbExecutor {
    async fn execute(&self, sql: &str) -> Result<QueryResult> {
        tracing::debug!("Executing: {}", preview(sql));

        match self.run(sql).await {
            Err(e) if e.is_connection_lost() => {
                tracing::warn!("Database connection lost ({}), reconnecting", e);
                self.reconnect().await?;
                self.run(sql).await
            }
            Err(Error::QueryTimeout(secs)) => {
                // The statement may still be running on the old connection
                tracing::warn!("Statement timed out after {}s: {}", secs, preview(sql));
                if let Err(e) = self.reconnect().await {
                    tracing::warn!("Reconnect after timeout failed: {}", e);
                }
                Err(Error::QueryTimeout(secs))
            }
            other => other,
        }
    }

    async fn reconnect(&self) -> Result<()> {
        let new_pool = Self::connect(&self.config).await?;
        let old_pool = {
            let mut guard = self.pool.write().await;
            std::mem::replace(&mut *guard, new_pool)
        };
        old_pool.close().await;
        tracing::info!(
            "Reconnected to MariaDB at {}:{}",
            self.config.host,
            self.config.port
        );
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        let pool = self.pool.read().await.clone();
        let result: (i64,) = sqlx::query_as("SELECT 1").fetch_one(&pool).await?;
        Ok(result.0 == 1)
    }
}

/// Create `database` on the server if it does not exist yet
async fn ensure_database(config: &DatabaseConfig, database: &str) -> Result<()> {
    let timeout = Duration::from_secs(config.connect_timeout_secs);
    let mut conn = match tokio::time::timeout(timeout, MySqlConnection::connect(&config.server_url())).await {
        Ok(conn) => conn?,
        Err(_) => {
            return Err(Error::ConnectionTimeout(format!("{}:{}", config.host, config.port)));
        }
    };

    let created = conn.execute(create_database_sql(database).as_str()).await?;
    if created.rows_affected() > 0 {
        tracing::info!("Created database {}", database);
    }
    conn.close().await?;
    Ok(())
}

fn create_database_sql(database: &str) -> String {
    format!("CREATE DATABASE IF NOT EXISTS `{}`", database.replace('`', "``"))
}

/// Execute over the text protocol, collecting every result set
async fn run_text_query(pool: &MySqlPool, sql: &str) -> Result<QueryResult> {
    let mut result = QueryResult::default();
    let mut stream = pool.fetch_many(sql);

    loop {
        let step = match stream.try_next().await {
            Ok(Some(step)) => step,
            Ok(None) => break,
            Err(sqlx::Error::Database(e)) => {
                return Err(Error::QueryExecution(format!(
                    "'{}...': {}",
                    preview(sql),
                    e
                )))
            }
            Err(e) => return Err(Error::Database(e)),
        };

        match step {
            Either::Left(done) => {
                result.rows_affected += done.rows_affected();
                if done.last_insert_id() != 0 {
                    result.last_insert_id = Some(done.last_insert_id());
                }
            }
            Either::Right(row) => {
                if result.columns.is_empty() {
                    result.columns = row
                        .columns()
                        .iter()
                        .map(|c| c.name().to_string())
                        .collect();
                }
                result.rows.push(row_values(&row));
            }
        }
    }

    Ok(result)
}

fn row_values(row: &MySqlRow) -> Vec<Option<String>> {
    (0..row.len())
        .map(|idx| match row.try_get_unchecked::<Option<String>, _>(idx) {
            Ok(value) => value,
            Err(_) => row
                .try_get_unchecked::<Option<Vec<u8>>, _>(idx)
                .ok()
                .flatten()
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_database_quotes_name() {
        assert_eq!(create_database_sql("app"), "CREATE DATABASE IF NOT EXISTS `app`");
        assert_eq!(
            create_database_sql("we`ird"),
            "CREATE DATABASE IF NOT EXISTS `we``ird`"
        );
    }
}
