//! Firestore composite index ensurer
//!
//! Composite indexes are managed through `gcloud`: the extant set is listed
//! as JSON, compared with the embedded desired set by canonical id, and the
//! missing ones are created asynchronously.

use async_trait::async_trait;
use pipecd_common::config::FirestoreConfig;
use pipecd_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::info;

const DESIRED_INDEXES: &str = include_str!("firestore/indexes.json");

/// Implicit document-name field gcloud appends to every index
const NAME_FIELD: &str = "__name__";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IndexField {
    pub field_path: String,
    pub order: String,
    pub array_config: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Index {
    pub collection_group: String,
    pub query_scope: String,
    pub fields: Vec<IndexField>,
}

impl Index {
    /// `collection/scope/field-path:X/order:Y/array-config:Z/...`, in field order
    pub fn id(&self) -> String {
        let mut id = format!("{}/{}", self.collection_group, self.query_scope);
        for f in &self.fields {
            id.push_str(&format!(
                "/field-path:{}/order:{}/array-config:{}",
                f.field_path, f.order, f.array_config
            ));
        }
        id
    }

    /// Inverse of [`Index::id`]
    pub fn from_id(id: &str) -> Result<Self> {
        let parts: Vec<&str> = id.split('/').collect();
        if parts.len() < 2 || (parts.len() - 2) % 3 != 0 {
            return Err(Error::invalid_argument(format!("malformed index id {id}")));
        }
        let value = |segment: &str, key: &str| -> Result<String> {
            segment
                .strip_prefix(key)
                .and_then(|s| s.strip_prefix(':'))
                .map(str::to_string)
                .ok_or_else(|| Error::invalid_argument(format!("malformed index id {id}: expected {key}")))
        };
        let fields = parts[2..]
            .chunks(3)
            .map(|c| {
                Ok(IndexField {
                    field_path: value(c[0], "field-path")?,
                    order: value(c[1], "order")?,
                    array_config: value(c[2], "array-config")?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            collection_group: parts[0].to_string(),
            query_scope: parts[1].to_string(),
            fields,
        })
    }
}

#[derive(Deserialize)]
struct DesiredIndexes {
    indexes: Vec<Index>,
}

/// The embedded desired index set
pub fn desired_indexes() -> Result<Vec<Index>> {
    let parsed: DesiredIndexes = serde_json::from_str(DESIRED_INDEXES)?;
    Ok(parsed.indexes)
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ListedIndex {
    name: String,
    query_scope: String,
    fields: Vec<IndexField>,
}

/// Parse `gcloud firestore indexes composite list --format=json` output
///
/// The collection group comes from the resource name and the implicit
/// `__name__` field is dropped.
pub fn parse_listed_indexes(raw: &[u8]) -> Result<Vec<Index>> {
    let listed: Vec<ListedIndex> = serde_json::from_slice(raw)?;
    Ok(listed
        .into_iter()
        .map(|l| Index {
            collection_group: l
                .name
                .split_once("/collectionGroups/")
                .and_then(|(_, rest)| rest.split('/').next())
                .unwrap_or_default()
                .to_string(),
            query_scope: l.query_scope,
            fields: l.fields.into_iter().filter(|f| f.field_path != NAME_FIELD).collect(),
        })
        .collect())
}

/// Copy of `indexes` with every collection group prefixed; empty prefix is a no-op
pub fn prefix_indexes(indexes: &[Index], prefix: &str) -> Vec<Index> {
    indexes
        .iter()
        .map(|idx| Index {
            collection_group: format!("{prefix}{}", idx.collection_group),
            ..idx.clone()
        })
        .collect()
}

/// `indexes` minus those whose id appears in `excludes`, deduplicated
pub fn filter_indexes(indexes: &[Index], excludes: &[Index]) -> Vec<Index> {
    let mut seen: HashSet<String> = excludes.iter().map(Index::id).collect();
    indexes.iter().filter(|idx| seen.insert(idx.id())).cloned().collect()
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run the tool with `args` and return its stdout
    async fn run(&self, args: &[String]) -> Result<Vec<u8>>;
}

/// `gcloud` on the host
pub struct Gcloud {
    path: PathBuf,
}

impl Gcloud {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl CommandRunner for Gcloud {
    async fn run(&self, args: &[String]) -> Result<Vec<u8>> {
        let output = tokio::process::Command::new(&self.path)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::internal(format!("failed to run {}: {e}", self.path.display())))?;
        if !output.status.success() {
            return Err(Error::internal(format!(
                "{} {} exited with {}: {}",
                self.path.display(),
                args.first().map_or("", String::as_str),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output.stdout)
    }
}

pub struct IndexEnsurer<R> {
    runner: R,
    project: String,
    credentials_file: String,
    collection_prefix: String,
}

impl<R: CommandRunner> IndexEnsurer<R> {
    pub fn new(runner: R, cfg: &FirestoreConfig) -> Self {
        Self {
            runner,
            project: cfg.project.clone(),
            credentials_file: cfg.credentials_file.clone(),
            collection_prefix: cfg.collection_name_prefix.clone(),
        }
    }

    async fn authenticate(&self) -> Result<()> {
        if self.credentials_file.is_empty() {
            return Ok(());
        }
        let args = ["auth", "activate-service-account", "--key-file", self.credentials_file.as_str()];
        self.runner.run(&args.map(String::from)).await.map(|_| ())
    }

    async fn list(&self) -> Result<Vec<Index>> {
        let args = ["firestore", "indexes", "composite", "list", "--project", self.project.as_str(), "--format", "json"];
        let out = self.runner.run(&args.map(String::from)).await?;
        parse_listed_indexes(&out)
    }

    async fn create(&self, idx: &Index) -> Result<()> {
        let mut args: Vec<String> = [
            "firestore",
            "indexes",
            "composite",
            "create",
            "--project",
            self.project.as_str(),
            "--collection-group",
            idx.collection_group.as_str(),
            "--query-scope",
            idx.query_scope.as_str(),
        ]
        .map(String::from)
        .into();
        for f in &idx.fields {
            let mut config = format!("field-path={}", f.field_path);
            if !f.order.is_empty() {
                config.push_str(&format!(",order={}", f.order.to_lowercase()));
            }
            if !f.array_config.is_empty() {
                config.push_str(&format!(",array-config={}", f.array_config.to_lowercase()));
            }
            args.push("--field-config".into());
            args.push(config);
        }
        args.push("--async".into());
        self.runner.run(&args).await.map(|_| ())
    }

    /// Create every desired index that does not exist yet; returns how many were requested
    pub async fn ensure(&self) -> Result<usize> {
        self.authenticate().await?;
        let desired = prefix_indexes(&desired_indexes()?, &self.collection_prefix);
        let extant = self.list().await?;
        let missing = filter_indexes(&desired, &extant);
        for idx in &missing {
            info!(index = %idx.id(), "creating firestore composite index");
            self.create(idx).await?;
        }
        info!(created = missing.len(), extant = extant.len(), "firestore indexes are ensured");
        Ok(missing.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct FakeGcloud {
        listed: String,
        calls: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl CommandRunner for FakeGcloud {
        async fn run(&self, args: &[String]) -> Result<Vec<u8>> {
            self.calls.lock().push(args.to_vec());
            if args.get(3).map(String::as_str) == Some("list") {
                return Ok(self.listed.clone().into_bytes());
            }
            Ok(Vec::new())
        }
    }

    fn index(col: &str, fields: &[(&str, &str)]) -> Index {
        Index {
            collection_group: col.into(),
            query_scope: "COLLECTION".into(),
            fields: fields
                .iter()
                .map(|(p, o)| IndexField {
                    field_path: (*p).into(),
                    order: (*o).into(),
                    array_config: String::new(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_id_round_trip_keeps_field_order() {
        let idx = index("Event", &[("eventKey", "ASCENDING"), ("name", "ASCENDING"), ("createdAt", "DESCENDING")]);
        assert_eq!(
            idx.id(),
            "Event/COLLECTION/field-path:eventKey/order:ASCENDING/array-config:/field-path:name/order:ASCENDING/array-config:/field-path:createdAt/order:DESCENDING/array-config:"
        );
        assert_eq!(Index::from_id(&idx.id()).unwrap(), idx);
        assert!(Index::from_id("Event/COLLECTION/field-path:x").is_err());
    }

    #[test]
    fn test_parse_listed_drops_name_field() {
        let raw = br#"[{
            "name": "projects/p/databases/(default)/collectionGroups/Application/indexes/CICAgOi3",
            "queryScope": "COLLECTION",
            "state": "READY",
            "fields": [
                {"fieldPath": "disabled", "order": "ASCENDING"},
                {"fieldPath": "updatedAt", "order": "DESCENDING"},
                {"fieldPath": "__name__", "order": "DESCENDING"}
            ]
        }]"#;
        let got = parse_listed_indexes(raw).unwrap();
        assert_eq!(got, vec![index("Application", &[("disabled", "ASCENDING"), ("updatedAt", "DESCENDING")])]);
    }

    #[test]
    fn test_prefix_is_pure_and_composes() {
        let xs = vec![index("Application", &[("kind", "ASCENDING")])];
        let once = prefix_indexes(&xs, "dev-");
        assert_eq!(xs[0].collection_group, "Application");
        assert_eq!(once[0].collection_group, "dev-Application");
        assert_eq!(prefix_indexes(&xs, ""), xs);
        assert_eq!(prefix_indexes(&once, "q-"), prefix_indexes(&xs, "q-dev-"));
    }

    #[test]
    fn test_filter_indexes_dedupes() {
        let a = index("A", &[("x", "ASCENDING")]);
        let b = index("B", &[("y", "ASCENDING")]);
        assert_eq!(filter_indexes(&[a.clone(), b.clone(), b.clone()], &[a]), vec![b]);
    }

    #[test]
    fn test_desired_indexes_parse() {
        let desired = desired_indexes().unwrap();
        assert!(desired.iter().any(|i| i.collection_group == "Command"));
        assert_eq!(filter_indexes(&desired, &[]).len(), desired.len());
    }

    #[tokio::test]
    async fn test_ensure_creates_only_missing() {
        let desired = desired_indexes().unwrap();
        let first = &desired[0];
        let mut fields: Vec<serde_json::Value> = first
            .fields
            .iter()
            .map(|f| serde_json::json!({"fieldPath": f.field_path, "order": f.order}))
            .collect();
        fields.push(serde_json::json!({"fieldPath": "__name__", "order": "DESCENDING"}));
        let listed = serde_json::json!([{
            "name": format!("projects/p/databases/(default)/collectionGroups/{}/indexes/x", first.collection_group),
            "queryScope": first.query_scope,
            "fields": fields,
        }]);

        let runner = FakeGcloud {
            listed: listed.to_string(),
            calls: Mutex::new(Vec::new()),
        };
        let cfg = FirestoreConfig {
            project: "p".into(),
            ..FirestoreConfig::default()
        };
        let ensurer = IndexEnsurer::new(runner, &cfg);
        let created = ensurer.ensure().await.unwrap();
        assert_eq!(created, desired.len() - 1);

        let calls = ensurer.runner.calls.lock();
        let creates: Vec<&Vec<String>> = calls.iter().filter(|c| c[3] == "create").collect();
        assert_eq!(creates.len(), created);
        assert!(creates.iter().all(|c| c.last().map(String::as_str) == Some("--async")));
        assert!(creates[0].contains(&"--field-config".to_string()));
    }
}
