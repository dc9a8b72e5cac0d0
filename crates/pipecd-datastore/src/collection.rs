//! Collections: kind, shard plan and commander-gated writes
//!
//! Every shard blob stores the full entity. On read, a sharded collection
//! takes the fields a shard owns from that shard and everything else from the
//! client shard, then stamps the newest `updatedAt` seen across shards.

use crate::{Commander, Filter, Shard, filter};
use pipecd_common::model::{Application, Deployment, Entity, Piped};
use pipecd_common::{Error, Result};
use serde_json::{Map, Value};

const CLIENT_ONLY: &[Shard] = &[Shard::Client];
const AGENT_ONLY: &[Shard] = &[Shard::Agent];
const CLIENT_AND_AGENT: &[Shard] = &[Shard::Client, Shard::Agent];

/// Application fields written by pipeds
const APPLICATION_AGENT_FIELDS: &[&str] = &[
    "syncState",
    "deploying",
    "mostRecentlySuccessfulDeployment",
    "mostRecentlyTriggeredDeployment",
];

pub trait Collection: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Shards that hold a part of every entity
    fn shards(&self) -> &'static [Shard];

    /// Shard the bound commander may write
    fn updatable_shard(&self) -> Result<Shard>;

    /// Fields a non-client shard is authoritative for
    fn owned_fields(&self, _shard: Shard) -> &'static [&'static str] {
        &[]
    }

    /// One blob per shard
    fn encode(&self, entity: &Value) -> Result<Vec<(Shard, Vec<u8>)>> {
        let data = serde_json::to_vec(entity)?;
        Ok(self.shards().iter().map(|s| (*s, data.clone())).collect())
    }

    /// Merge shard parts into one entity
    fn decode(&self, mut parts: Vec<(Shard, Value)>) -> Result<Value> {
        if parts.is_empty() {
            return Err(Error::not_found(format!("{} has no shards", self.kind())));
        }
        parts.sort_by_key(|(s, _)| *s);
        let updated_at = parts
            .iter()
            .filter_map(|(_, v)| v.get("updatedAt").and_then(Value::as_i64))
            .max()
            .unwrap_or_default();

        let mut iter = parts.into_iter();
        let Some((_, mut merged)) = iter.next() else {
            return Err(Error::not_found(self.kind()));
        };
        for (shard, part) in iter {
            let owned = self.owned_fields(shard);
            let (Some(dst), Value::Object(src)) = (merged.as_object_mut(), part) else {
                return Err(Error::internal(format!("{} shard is not an object", self.kind())));
            };
            overlay(dst, src, owned);
        }
        if let Some(obj) = merged.as_object_mut() {
            obj.insert("updatedAt".to_string(), Value::from(updated_at));
        }
        Ok(merged)
    }

    fn matches(&self, entity: &Value, filters: &[Filter]) -> Result<bool> {
        filter::matches(entity, filters)
    }
}

/// Copy `owned` keys of `src` into `dst`; every key when `owned` is empty
fn overlay(dst: &mut Map<String, Value>, mut src: Map<String, Value>, owned: &[&str]) {
    if owned.is_empty() {
        dst.extend(src);
        return;
    }
    for k in owned {
        // An owned field absent from its shard was cleared there
        match src.remove(*k) {
            Some(v) => dst.insert((*k).to_string(), v),
            None => dst.remove(*k),
        };
    }
}

struct ApplicationCollection(Commander);

impl Collection for ApplicationCollection {
    fn kind(&self) -> &'static str {
        Application::KIND
    }

    fn shards(&self) -> &'static [Shard] {
        CLIENT_AND_AGENT
    }

    fn updatable_shard(&self) -> Result<Shard> {
        match self.0 {
            Commander::Piped => Ok(Shard::Agent),
            Commander::Web | Commander::Pipectl | Commander::Ops => Ok(Shard::Client),
        }
    }

    fn owned_fields(&self, shard: Shard) -> &'static [&'static str] {
        match shard {
            Shard::Agent => APPLICATION_AGENT_FIELDS,
            Shard::Client => &[],
        }
    }
}

struct DeploymentCollection(Commander);

impl Collection for DeploymentCollection {
    fn kind(&self) -> &'static str {
        Deployment::KIND
    }

    fn shards(&self) -> &'static [Shard] {
        AGENT_ONLY
    }

    fn updatable_shard(&self) -> Result<Shard> {
        match self.0 {
            Commander::Piped | Commander::Ops => Ok(Shard::Agent),
            c => Err(Error::unsupported(format!("{c} cannot update Deployment"))),
        }
    }
}

struct PipedCollection(Commander);

impl Collection for PipedCollection {
    fn kind(&self) -> &'static str {
        Piped::KIND
    }

    fn shards(&self) -> &'static [Shard] {
        CLIENT_ONLY
    }

    fn updatable_shard(&self) -> Result<Shard> {
        match self.0 {
            Commander::Web | Commander::Piped => Ok(Shard::Client),
            c => Err(Error::unsupported(format!("{c} cannot update Piped"))),
        }
    }
}

/// Single-shard collection writable by every commander
struct ClientCollection(&'static str);

impl Collection for ClientCollection {
    fn kind(&self) -> &'static str {
        self.0
    }

    fn shards(&self) -> &'static [Shard] {
        CLIENT_ONLY
    }

    fn updatable_shard(&self) -> Result<Shard> {
        Ok(Shard::Client)
    }
}

/// Collection for the entity of kind `E`, bound to `commander`
pub fn collection_for<E: Entity>(commander: Commander) -> Box<dyn Collection> {
    match E::KIND {
        k if k == Application::KIND => Box::new(ApplicationCollection(commander)),
        k if k == Deployment::KIND => Box::new(DeploymentCollection(commander)),
        k if k == Piped::KIND => Box::new(PipedCollection(commander)),
        other => Box::new(ClientCollection(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipecd_common::model::Command;
    use serde_json::json;

    #[test]
    fn test_application_shard_merge() {
        let col = collection_for::<Application>(Commander::Web);
        let client = json!({"id": "A", "name": "x", "updatedAt": 10});
        let agent = json!({"id": "A", "syncState": {"status": "SYNCED"}, "updatedAt": 20});

        for parts in [
            vec![(Shard::Client, client.clone()), (Shard::Agent, agent.clone())],
            vec![(Shard::Agent, agent.clone()), (Shard::Client, client.clone())],
        ] {
            let merged = col.decode(parts).unwrap();
            assert_eq!(merged["name"], "x");
            assert_eq!(merged["syncState"]["status"], "SYNCED");
            assert_eq!(merged["updatedAt"], 20);
        }
    }

    #[test]
    fn test_agent_shard_does_not_override_client_fields() {
        let col = collection_for::<Application>(Commander::Piped);
        let client = json!({"id": "A", "name": "renamed", "updatedAt": 30});
        let agent = json!({"id": "A", "name": "stale", "deploying": true, "updatedAt": 20});
        let merged = col
            .decode(vec![(Shard::Agent, agent), (Shard::Client, client)])
            .unwrap();
        assert_eq!(merged["name"], "renamed");
        assert_eq!(merged["deploying"], true);
        assert_eq!(merged["updatedAt"], 30);
    }

    #[test]
    fn test_updatable_shards() {
        assert_eq!(
            collection_for::<Application>(Commander::Piped).updatable_shard().unwrap(),
            Shard::Agent
        );
        assert_eq!(
            collection_for::<Application>(Commander::Web).updatable_shard().unwrap(),
            Shard::Client
        );
        assert!(
            collection_for::<Deployment>(Commander::Web)
                .updatable_shard()
                .unwrap_err()
                .is_unsupported()
        );
        assert!(
            collection_for::<Piped>(Commander::Ops)
                .updatable_shard()
                .unwrap_err()
                .is_unsupported()
        );
        assert_eq!(
            collection_for::<Command>(Commander::Ops).updatable_shard().unwrap(),
            Shard::Client
        );
    }

    #[test]
    fn test_encode_writes_every_shard() {
        let col = collection_for::<Application>(Commander::Web);
        let parts = col.encode(&json!({"id": "A"})).unwrap();
        let shards: Vec<Shard> = parts.iter().map(|(s, _)| *s).collect();
        assert_eq!(shards, vec![Shard::Client, Shard::Agent]);
    }
}
