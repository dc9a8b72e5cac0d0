//! MySQL schema and index ensurer
//!
//! The schema is one script of `CREATE TABLE IF NOT EXISTS` statements and
//! runs as a whole. The index file runs one statement at a time; errors that
//! only say the index or column is already there, or already gone, are
//! ignored so the file can be applied any number of times.

use async_trait::async_trait;
use pipecd_common::{Error, Result};
use pipecd_datastore::mysql::error_number;
use sqlx::mysql::MySqlPool;
use tracing::{debug, info};

pub const SCHEMA: &str = include_str!("sql/schema.sql");
pub const INDEXES: &str = include_str!("sql/indexes.sql");

/// Duplicate key name
pub const ER_DUP_KEYNAME: u16 = 1061;
/// Duplicate column name
pub const ER_DUP_FIELDNAME: u16 = 1060;
/// Can't DROP; check that column/key exists
pub const ER_CANT_DROP_FIELD_OR_KEY: u16 = 1091;

const IGNORED_ERRORS: &[u16] = &[ER_DUP_KEYNAME, ER_DUP_FIELDNAME, ER_CANT_DROP_FIELD_OR_KEY];

/// Failure reported by a [`SqlExecutor`]
#[derive(Debug)]
pub struct ExecError {
    /// Server error number, when the server answered
    pub number: Option<u16>,
    pub message: String,
}

impl From<sqlx::Error> for ExecError {
    fn from(e: sqlx::Error) -> Self {
        Self {
            number: error_number(&e),
            message: e.to_string(),
        }
    }
}

#[async_trait]
pub trait SqlExecutor: Send + Sync {
    /// Run a script that may contain several statements
    async fn execute_script(&self, script: &str) -> std::result::Result<(), ExecError>;

    async fn execute(&self, statement: &str) -> std::result::Result<(), ExecError>;
}

#[async_trait]
impl SqlExecutor for MySqlPool {
    async fn execute_script(&self, script: &str) -> std::result::Result<(), ExecError> {
        sqlx::raw_sql(script).execute(self).await?;
        Ok(())
    }

    async fn execute(&self, statement: &str) -> std::result::Result<(), ExecError> {
        sqlx::raw_sql(statement).execute(self).await?;
        Ok(())
    }
}

/// Statements of `script`, with comment lines removed
pub fn split_statements(script: &str) -> Vec<String> {
    script
        .split(';')
        .map(|chunk| {
            chunk
                .lines()
                .filter(|l| !l.trim_start().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n")
                .trim()
                .to_string()
        })
        .filter(|s| !s.is_empty())
        .collect()
}

pub struct SqlEnsurer<X> {
    executor: X,
}

impl<X: SqlExecutor> SqlEnsurer<X> {
    pub const fn new(executor: X) -> Self {
        Self { executor }
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        self.executor
            .execute_script(SCHEMA)
            .await
            .map_err(|e| Error::internal(format!("failed to apply schema: {}", e.message)))?;
        info!("mysql schema is ready");
        Ok(())
    }

    pub async fn ensure_indexes(&self) -> Result<()> {
        let statements = split_statements(INDEXES);
        for stmt in &statements {
            match self.executor.execute(stmt).await {
                Ok(()) => {}
                Err(ExecError { number: Some(n), message }) if IGNORED_ERRORS.contains(&n) => {
                    debug!(statement = %stmt, error = %message, "index statement already applied");
                }
                Err(e) => {
                    return Err(Error::internal(format!(
                        "failed to apply index statement {stmt:?}: {}",
                        e.message
                    )));
                }
            }
        }
        info!(statements = statements.len(), "mysql indexes are ready");
        Ok(())
    }

    pub async fn ensure(&self) -> Result<()> {
        self.ensure_schema().await?;
        self.ensure_indexes().await
    }
}
