//! MySQL driver
//!
//! Each kind is a table `(Id BINARY(16), Data JSON, <generated columns>)`.
//! Ids are stored with `UUID_TO_BIN(?, true)`; `Project` ids are plain names
//! and are looked up through `Data->>"$.id"` instead. Filters render against
//! the generated columns when the kind has one for the field and against the
//! JSON document otherwise.

use crate::filter::normalize_field;
use crate::{Collection, DataStore, Direction, Filter, ListOptions, Operator, Page, Updater, decode_error};
use async_trait::async_trait;
use pipecd_common::config::MySqlConfig;
use pipecd_common::model::{Entity, Project};
use pipecd_common::{Error, Result};
use serde_json::Value;
use sqlx::mysql::{MySqlArguments, MySqlDatabaseError, MySqlPool, MySqlPoolOptions};
use sqlx::query::Query;
use sqlx::{MySql as MySqlDb, Row};
use tracing::error;

const ER_DUP_ENTRY: u16 = 1062;
const MAX_CONNECTIONS: u32 = 20;

/// Generated columns present on every table
const COMMON_COLUMNS: &[&str] = &["ProjectId", "CreatedAt", "UpdatedAt"];

/// Generated columns per kind, as created by the schema ensurer
fn kind_columns(kind: &str) -> &'static [&'static str] {
    match kind {
        "Application" => &["Name", "PipedId", "Kind", "Disabled", "Deleted"],
        "Deployment" => &["ApplicationId", "PipedId", "Status", "Kind", "DeploymentChainId"],
        "Command" => &["PipedId", "ApplicationId", "DeploymentId", "Status", "Type"],
        "Piped" | "APIKey" => &["Disabled"],
        "Event" => &["Name", "EventKey", "Status"],
        "DeploymentChain" => &["Status"],
        _ => &[],
    }
}

/// MySQL error number carried by a sqlx error, if any
pub fn error_number(e: &sqlx::Error) -> Option<u16> {
    match e {
        sqlx::Error::Database(db) => db.try_downcast_ref::<MySqlDatabaseError>().map(MySqlDatabaseError::number),
        _ => None,
    }
}

fn sql_error(kind: &str, id: &str, e: sqlx::Error) -> Error {
    match e {
        sqlx::Error::RowNotFound => Error::not_found(format!("{kind} {id}")),
        e if error_number(&e) == Some(ER_DUP_ENTRY) => Error::already_exists(format!("{kind} {id}")),
        e => {
            error!(kind, id, error = %e, "mysql operation failed");
            Error::internal(format!("mysql: {e}"))
        }
    }
}

/// Parameter bound to a rendered query
#[derive(Clone, Debug, PartialEq)]
pub enum Arg {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// JSON document, bound as text and cast by the query
    Json(String),
}

impl From<&Value> for Arg {
    fn from(v: &Value) -> Self {
        match v {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => n.as_i64().map_or_else(|| Self::Float(n.as_f64().unwrap_or_default()), Self::Int),
            Value::String(s) => Self::Str(s.clone()),
            other => Self::Json(other.to_string()),
        }
    }
}

fn bind_all<'q>(mut q: Query<'q, MySqlDb, MySqlArguments>, args: Vec<Arg>) -> Query<'q, MySqlDb, MySqlArguments> {
    for a in args {
        q = match a {
            Arg::Null => q.bind(Option::<String>::None),
            Arg::Bool(b) => q.bind(b),
            Arg::Int(i) => q.bind(i),
            Arg::Float(f) => q.bind(f),
            Arg::Str(s) | Arg::Json(s) => q.bind(s),
        };
    }
    q
}

/// Column or JSON path expression for a filter field
fn column_expr(kind: &str, field: &str) -> Result<String> {
    let plain = field.starts_with(|c: char| c.is_ascii_alphabetic()) && field.chars().all(|c| c.is_ascii_alphanumeric());
    if !plain {
        return Err(Error::unsupported(format!("field {field} is not supported")));
    }
    let mut pascal = field.to_string();
    if let Some(first) = pascal.get_mut(0..1) {
        first.make_ascii_uppercase();
    }
    if pascal == "Id" {
        return Ok("Data->>\"$.id\"".to_string());
    }
    if COMMON_COLUMNS.contains(&pascal.as_str()) || kind_columns(kind).contains(&pascal.as_str()) {
        return Ok(pascal);
    }
    Ok(format!("Data->>\"$.{}\"", normalize_field(field)))
}

fn render_filter(kind: &str, f: &Filter, args: &mut Vec<Arg>) -> Result<String> {
    let col = column_expr(kind, &f.field)?;
    let cmp = |op: &str, args: &mut Vec<Arg>| {
        args.push(Arg::from(&f.value));
        format!("{col} {op} ?")
    };
    let list = |negate: bool, args: &mut Vec<Arg>| -> Result<String> {
        let items = f.value.as_array().ok_or_else(|| {
            Error::invalid_argument(format!("in/not-in filter on {} requires an array operand", f.field))
        })?;
        if items.is_empty() {
            return Ok(if negate { "TRUE" } else { "FALSE" }.to_string());
        }
        let marks = vec!["?"; items.len()].join(", ");
        args.extend(items.iter().map(Arg::from));
        Ok(format!("{col} {}IN ({marks})", if negate { "NOT " } else { "" }))
    };
    match f.operator {
        Operator::Equal => Ok(cmp("=", args)),
        Operator::NotEqual => Ok(cmp("<>", args)),
        Operator::LessThan => Ok(cmp("<", args)),
        Operator::LessThanOrEqual => Ok(cmp("<=", args)),
        Operator::GreaterThan => Ok(cmp(">", args)),
        Operator::GreaterThanOrEqual => Ok(cmp(">=", args)),
        Operator::In => list(false, args),
        Operator::NotIn => list(true, args),
        Operator::Contains => {
            args.push(Arg::Json(f.value.to_string()));
            Ok(format!(
                "JSON_CONTAINS(Data->\"$.{}\", CAST(? AS JSON))",
                normalize_field(&f.field)
            ))
        }
    }
}

/// `SELECT` for a page; the cursor is the row offset
pub fn build_find_query(kind: &str, opts: &ListOptions) -> Result<(String, Vec<Arg>)> {
    let mut args = Vec::new();
    let mut sql = format!("SELECT Data FROM {kind}");
    if !opts.filters.is_empty() {
        let conds = opts
            .filters
            .iter()
            .map(|f| render_filter(kind, f, &mut args))
            .collect::<Result<Vec<_>>>()?;
        sql.push_str(" WHERE ");
        sql.push_str(&conds.join(" AND "));
    }
    if !opts.orders.is_empty() {
        let orders = opts
            .orders
            .iter()
            .map(|o| {
                let dir = match o.direction {
                    Direction::Asc => "ASC",
                    Direction::Desc => "DESC",
                };
                column_expr(kind, &o.field).map(|c| format!("{c} {dir}"))
            })
            .collect::<Result<Vec<_>>>()?;
        sql.push_str(" ORDER BY ");
        sql.push_str(&orders.join(", "));
    }
    let offset: i64 = if opts.cursor.is_empty() {
        0
    } else {
        opts.cursor
            .parse()
            .map_err(|_| Error::invalid_argument(format!("malformed cursor {}", opts.cursor)))?
    };
    if opts.limit > 0 {
        sql.push_str(" LIMIT ? OFFSET ?");
        args.push(Arg::Int(i64::try_from(opts.limit).unwrap_or(i64::MAX)));
        args.push(Arg::Int(offset));
    } else if offset > 0 {
        // MySQL requires a LIMIT to use OFFSET
        sql.push_str(" LIMIT 18446744073709551615 OFFSET ?");
        args.push(Arg::Int(offset));
    }
    Ok((sql, args))
}

fn id_predicate(kind: &str) -> &'static str {
    if kind == Project::KIND {
        "Data->>\"$.id\" = ?"
    } else {
        "Id = UUID_TO_BIN(?,true)"
    }
}

pub fn build_get_query(kind: &str) -> String {
    format!("SELECT Data FROM {kind} WHERE {}", id_predicate(kind))
}

pub fn build_update_query(kind: &str) -> String {
    format!("UPDATE {kind} SET Data = ? WHERE {}", id_predicate(kind))
}

pub fn build_create_query(kind: &str) -> String {
    format!("INSERT INTO {kind} (Id, Data) VALUE (UUID_TO_BIN(?,true), ?)")
}

/// `url/database` or `user:pass@tcp(url)/database` style DSN as a sqlx URL
fn build_url(cfg: &MySqlConfig) -> Result<String> {
    if cfg.url.is_empty() {
        return Err(Error::configuration("mysql url is required"));
    }
    if cfg.database.is_empty() {
        return Err(Error::configuration("mysql database is required"));
    }
    let host = cfg
        .url
        .strip_prefix("mysql://")
        .unwrap_or(&cfg.url)
        .trim_end_matches('/');
    if cfg.username_file.is_empty() || cfg.password_file.is_empty() {
        return Ok(format!("mysql://{host}/{}", cfg.database));
    }
    let read = |path: &str, what: &str| {
        std::fs::read_to_string(path)
            .map(|s| s.trim().to_string())
            .map_err(|e| Error::configuration(format!("failed to read {what} file: {e}")))
    };
    let username = read(&cfg.username_file, "username")?;
    let password = read(&cfg.password_file, "password")?;
    Ok(format!(
        "mysql://{}:{}@{host}/{}",
        urlencoding::encode(&username),
        urlencoding::encode(&password),
        cfg.database
    ))
}

pub struct MySql {
    pool: MySqlPool,
}

impl MySql {
    /// Build a lazily connecting pool; the first query dials
    pub fn connect(cfg: &MySqlConfig) -> Result<Self> {
        let url = build_url(cfg)?;
        let pool = MySqlPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_lazy(&url)
            .map_err(|e| Error::configuration(format!("invalid mysql url: {e}")))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }
}

/// Ids that are not UUIDs (project names) get a random row id
fn row_id(id: &str) -> String {
    match uuid::Uuid::parse_str(id) {
        Ok(_) => id.to_string(),
        Err(_) => uuid::Uuid::new_v4().to_string(),
    }
}

#[async_trait]
impl DataStore for MySql {
    async fn find(&self, col: &dyn Collection, opts: &ListOptions) -> Result<Page> {
        let kind = col.kind();
        let (sql, args) = build_find_query(kind, opts)?;
        let rows = bind_all(sqlx::query(&sql), args)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| sql_error(kind, "", e))?;
        let mut entities = Vec::with_capacity(rows.len());
        for row in rows {
            let data: sqlx::types::Json<Value> = row.try_get("Data").map_err(|e| sql_error(kind, "", e))?;
            entities.push(data.0);
        }
        let offset: usize = opts.cursor.parse().unwrap_or_default();
        let cursor = if opts.limit > 0 && entities.len() == opts.limit {
            (offset + entities.len()).to_string()
        } else {
            String::new()
        };
        Ok(Page { entities, cursor })
    }

    async fn get(&self, col: &dyn Collection, id: &str) -> Result<Value> {
        let kind = col.kind();
        let row = sqlx::query(&build_get_query(kind))
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| sql_error(kind, id, e))?;
        let data: sqlx::types::Json<Value> = row.try_get("Data").map_err(|e| sql_error(kind, id, e))?;
        Ok(data.0)
    }

    async fn create(&self, col: &dyn Collection, id: &str, entity: &Value) -> Result<()> {
        let kind = col.kind();
        sqlx::query(&build_create_query(kind))
            .bind(row_id(id))
            .bind(entity.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| sql_error(kind, id, e))?;
        Ok(())
    }

    async fn update(&self, col: &dyn Collection, id: &str, updater: Updater<'_>) -> Result<()> {
        let kind = col.kind();
        let mut tx = self.pool.begin().await.map_err(|e| sql_error(kind, id, e))?;
        let row = sqlx::query(&format!("{} FOR UPDATE", build_get_query(kind)))
            .bind(id)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| sql_error(kind, id, e))?;
        let raw: sqlx::types::Json<Value> = row.try_get("Data").map_err(|e| sql_error(kind, id, e))?;
        let mut entity = raw.0;
        // Dropping the transaction rolls it back
        updater(&mut entity)?;
        let encoded = serde_json::to_string(&entity).map_err(|e| decode_error(kind, id, &e))?;
        sqlx::query(&build_update_query(kind))
            .bind(encoded)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| sql_error(kind, id, e))?;
        tx.commit().await.map_err(|e| sql_error(kind, id, e))
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}
