//! Firestore driver over the REST API
//!
//! Documents live at `<namespace>/<environment>/<prefix><kind>/<id>`.
//! Entity JSON is converted to and from Firestore typed values; updates run
//! in a read-write transaction and are retried when the commit is aborted.

use crate::filter::normalize_field;
use crate::{Collection, DataStore, Direction, Filter, ListOptions, Operator, Page, Updater};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use pipecd_common::config::FirestoreConfig;
use pipecd_common::gcp::{SCOPE_DATASTORE, TokenSource};
use pipecd_common::{Error, Result};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tracing::{error, warn};

const FIRESTORE_BASE_URL: &str = "https://firestore.googleapis.com/v1";
const DEFAULT_NAMESPACE: &str = "pipecd";
const COMMIT_ATTEMPTS: usize = 3;

/// Encode JSON as a Firestore typed value
pub fn to_firestore(v: &Value) -> Value {
    match v {
        Value::Null => json!({"nullValue": null}),
        Value::Bool(b) => json!({"booleanValue": b}),
        Value::Number(n) => n.as_i64().map_or_else(
            || json!({"doubleValue": n.as_f64()}),
            |i| json!({"integerValue": i.to_string()}),
        ),
        Value::String(s) => json!({"stringValue": s}),
        Value::Array(items) => json!({"arrayValue": {"values": items.iter().map(to_firestore).collect::<Vec<_>>()}}),
        Value::Object(fields) => json!({"mapValue": {"fields": to_fields(fields)}}),
    }
}

fn to_fields(obj: &Map<String, Value>) -> Map<String, Value> {
    obj.iter().map(|(k, v)| (k.clone(), to_firestore(v))).collect()
}

/// Decode a Firestore typed value back into JSON
pub fn from_firestore(v: &Value) -> Value {
    let Some((tag, inner)) = v.as_object().and_then(|o| o.iter().next()) else {
        return Value::Null;
    };
    match tag.as_str() {
        "booleanValue" => inner.clone(),
        "integerValue" => inner
            .as_str()
            .and_then(|s| s.parse::<i64>().ok())
            .map_or_else(|| inner.clone(), Value::from),
        "doubleValue" => inner.clone(),
        "stringValue" | "timestampValue" | "referenceValue" | "bytesValue" => inner.clone(),
        "arrayValue" => Value::Array(
            inner
                .get("values")
                .and_then(Value::as_array)
                .map(|vs| vs.iter().map(from_firestore).collect())
                .unwrap_or_default(),
        ),
        "mapValue" => from_fields(inner.get("fields")),
        _ => Value::Null,
    }
}

fn from_fields(fields: Option<&Value>) -> Value {
    Value::Object(
        fields
            .and_then(Value::as_object)
            .map(|f| f.iter().map(|(k, v)| (k.clone(), from_firestore(v))).collect())
            .unwrap_or_default(),
    )
}

const fn operator_name(op: Operator) -> &'static str {
    match op {
        Operator::Equal => "EQUAL",
        Operator::NotEqual => "NOT_EQUAL",
        Operator::LessThan => "LESS_THAN",
        Operator::LessThanOrEqual => "LESS_THAN_OR_EQUAL",
        Operator::GreaterThan => "GREATER_THAN",
        Operator::GreaterThanOrEqual => "GREATER_THAN_OR_EQUAL",
        Operator::In => "IN",
        Operator::NotIn => "NOT_IN",
        Operator::Contains => "ARRAY_CONTAINS",
    }
}

fn field_filter(f: &Filter) -> Result<Value> {
    if matches!(f.operator, Operator::In | Operator::NotIn) && !f.value.is_array() {
        return Err(Error::invalid_argument(format!(
            "in/not-in filter on {} requires an array operand",
            f.field
        )));
    }
    Ok(json!({
        "fieldFilter": {
            "field": {"fieldPath": normalize_field(&f.field)},
            "op": operator_name(f.operator),
            "value": to_firestore(&f.value),
        }
    }))
}

/// `structuredQuery` for a page of `collection`
pub fn build_query(collection: &str, opts: &ListOptions) -> Result<Value> {
    if !opts.cursor.is_empty() && opts.orders.is_empty() {
        return Err(Error::invalid_argument("a cursor requires orders to be set"));
    }
    let mut query = Map::new();
    query.insert("from".into(), json!([{"collectionId": collection}]));

    let filters = opts.filters.iter().map(field_filter).collect::<Result<Vec<_>>>()?;
    match filters.len() {
        0 => {}
        1 => {
            query.insert("where".into(), filters.into_iter().next().unwrap_or_default());
        }
        _ => {
            query.insert(
                "where".into(),
                json!({"compositeFilter": {"op": "AND", "filters": filters}}),
            );
        }
    }

    if !opts.orders.is_empty() {
        let orders: Vec<Value> = opts
            .orders
            .iter()
            .map(|o| {
                json!({
                    "field": {"fieldPath": normalize_field(&o.field)},
                    "direction": match o.direction {
                        Direction::Asc => "ASCENDING",
                        Direction::Desc => "DESCENDING",
                    },
                })
            })
            .collect();
        query.insert("orderBy".into(), Value::Array(orders));
    }

    if !opts.cursor.is_empty() {
        let raw = URL_SAFE_NO_PAD
            .decode(&opts.cursor)
            .map_err(|e| Error::invalid_argument(format!("malformed cursor: {e}")))?;
        let values: Vec<Value> =
            serde_json::from_slice(&raw).map_err(|e| Error::invalid_argument(format!("malformed cursor: {e}")))?;
        if values.len() != opts.orders.len() {
            return Err(Error::invalid_argument("cursor does not match the ordering fields"));
        }
        query.insert(
            "startAt".into(),
            json!({"values": values.iter().map(to_firestore).collect::<Vec<_>>(), "before": false}),
        );
    }

    if opts.limit > 0 {
        query.insert("limit".into(), json!(opts.limit));
    }
    Ok(json!({ "structuredQuery": query }))
}

#[derive(Deserialize)]
struct Document {
    #[serde(default)]
    fields: Option<Value>,
}

#[derive(Deserialize)]
struct QueryResult {
    #[serde(default)]
    document: Option<Document>,
}

#[derive(Deserialize)]
struct BeginTransaction {
    transaction: String,
}

pub struct Firestore {
    http: reqwest::Client,
    base_url: String,
    /// `projects/<p>/databases/(default)/documents`
    root: String,
    namespace: String,
    environment: String,
    collection_prefix: String,
    tokens: Arc<TokenSource>,
}

impl Firestore {
    pub fn from_config(cfg: &FirestoreConfig) -> Result<Self> {
        if cfg.project.is_empty() {
            return Err(Error::configuration("firestore project must be set"));
        }
        let tokens = TokenSource::new(&cfg.credentials_file, &[SCOPE_DATASTORE])?;
        Ok(Self::new(FIRESTORE_BASE_URL, cfg, Arc::new(tokens)))
    }

    pub fn new(base_url: &str, cfg: &FirestoreConfig, tokens: Arc<TokenSource>) -> Self {
        let namespace = if cfg.namespace.is_empty() {
            DEFAULT_NAMESPACE.to_string()
        } else {
            cfg.namespace.clone()
        };
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            root: format!("projects/{}/databases/(default)/documents", cfg.project),
            namespace,
            environment: cfg.environment.clone(),
            collection_prefix: cfg.collection_name_prefix.clone(),
            tokens,
        }
    }

    fn parent(&self) -> String {
        format!("{}/{}/{}", self.root, self.namespace, self.environment)
    }

    fn collection_id(&self, kind: &str) -> String {
        format!("{}{kind}", self.collection_prefix)
    }

    fn doc_name(&self, kind: &str, id: &str) -> String {
        format!("{}/{}/{id}", self.parent(), self.collection_id(kind))
    }

    async fn post(&self, url: &str, body: &Value) -> Result<reqwest::Response> {
        let token = self.tokens.token().await?;
        self.http
            .post(url)
            .bearer_auth(token)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::internal(format!("firestore: {e}")))
    }

    async fn read_doc(&self, name: &str, transaction: Option<&str>) -> Result<Value> {
        let token = self.tokens.token().await?;
        let mut req = self.http.get(format!("{}/{name}", self.base_url)).bearer_auth(token);
        if let Some(tx) = transaction {
            req = req.query(&[("transaction", tx)]);
        }
        let resp = req.send().await.map_err(|e| Error::internal(format!("firestore: {e}")))?;
        let doc: Document = check(resp, name).await?.json().await.map_err(|e| Error::internal(e.to_string()))?;
        Ok(from_fields(doc.fields.as_ref()))
    }

    async fn rollback(&self, transaction: &str) {
        let url = format!("{}/{}:rollback", self.base_url, self.root);
        if let Err(e) = self.post(&url, &json!({ "transaction": transaction })).await {
            warn!(error = %e, "failed to roll back firestore transaction");
        }
    }

    /// One read-modify-write attempt; `Ok(false)` when the commit was aborted
    async fn try_update(&self, name: &str, updater: &mut Updater<'_>) -> Result<bool> {
        let url = format!("{}/{}:beginTransaction", self.base_url, self.root);
        let resp = self
            .post(&url, &json!({"options": {"readWrite": {}}}))
            .await?;
        let tx: BeginTransaction = check(resp, "beginTransaction")
            .await?
            .json()
            .await
            .map_err(|e| Error::internal(e.to_string()))?;

        let mut entity = match self.read_doc(name, Some(&tx.transaction)).await {
            Ok(v) => v,
            Err(e) => {
                self.rollback(&tx.transaction).await;
                return Err(e);
            }
        };
        if let Err(e) = updater(&mut entity) {
            self.rollback(&tx.transaction).await;
            return Err(e);
        }
        let Value::Object(obj) = &entity else {
            self.rollback(&tx.transaction).await;
            return Err(Error::internal("entity is not an object"));
        };

        let url = format!("{}/{}:commit", self.base_url, self.root);
        let body = json!({
            "writes": [{"update": {"name": name, "fields": to_fields(obj)}}],
            "transaction": tx.transaction,
        });
        let resp = self.post(&url, &body).await?;
        if resp.status() == reqwest::StatusCode::CONFLICT {
            return Ok(false);
        }
        check(resp, name).await?;
        Ok(true)
    }
}

async fn check(resp: reqwest::Response, what: &str) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(match status.as_u16() {
        404 => Error::not_found(what.to_string()),
        409 => Error::already_exists(what.to_string()),
        400 => Error::invalid_argument(format!("{what}: {body}")),
        401 => Error::unauthenticated(format!("{what}: {body}")),
        403 => Error::permission_denied(format!("{what}: {body}")),
        _ => {
            error!(what, %status, body, "firestore request failed");
            Error::internal(format!("{what}: unexpected status {status}"))
        }
    })
}

#[async_trait]
impl DataStore for Firestore {
    async fn find(&self, col: &dyn Collection, opts: &ListOptions) -> Result<Page> {
        let body = build_query(&self.collection_id(col.kind()), opts)?;
        let url = format!("{}/{}:runQuery", self.base_url, self.parent());
        let resp = check(self.post(&url, &body).await?, "runQuery").await?;
        let results: Vec<QueryResult> = resp.json().await.map_err(|e| Error::internal(e.to_string()))?;
        let entities: Vec<Value> = results
            .into_iter()
            .filter_map(|r| r.document)
            .map(|d| from_fields(d.fields.as_ref()))
            .collect();

        let cursor = match entities.last() {
            Some(last) if opts.limit > 0 && entities.len() == opts.limit && !opts.orders.is_empty() => {
                let values: Vec<Value> = opts
                    .orders
                    .iter()
                    .map(|o| last.get(normalize_field(&o.field)).cloned().unwrap_or(Value::Null))
                    .collect();
                URL_SAFE_NO_PAD.encode(serde_json::to_vec(&values)?)
            }
            _ => String::new(),
        };
        Ok(Page { entities, cursor })
    }

    async fn get(&self, col: &dyn Collection, id: &str) -> Result<Value> {
        self.read_doc(&self.doc_name(col.kind(), id), None).await
    }

    async fn create(&self, col: &dyn Collection, id: &str, entity: &Value) -> Result<()> {
        let Value::Object(obj) = entity else {
            return Err(Error::invalid_argument("entity is not an object"));
        };
        let url = format!(
            "{}/{}/{}?documentId={}",
            self.base_url,
            self.parent(),
            self.collection_id(col.kind()),
            urlencoding::encode(id)
        );
        let resp = self.post(&url, &json!({ "fields": to_fields(obj) })).await?;
        check(resp, &format!("{} {id}", col.kind())).await.map(|_| ())
    }

    async fn update(&self, col: &dyn Collection, id: &str, mut updater: Updater<'_>) -> Result<()> {
        let name = self.doc_name(col.kind(), id);
        for attempt in 1..=COMMIT_ATTEMPTS {
            if self.try_update(&name, &mut updater).await? {
                return Ok(());
            }
            warn!(kind = col.kind(), id, attempt, "firestore commit aborted, retrying");
        }
        Err(Error::internal(format!(
            "update of {} {id} aborted {COMMIT_ATTEMPTS} times",
            col.kind()
        )))
    }
}
