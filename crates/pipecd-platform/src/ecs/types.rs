//! Wire shapes of the ECS JSON protocol
//!
//! Only the fields this crate reads are typed; everything else is carried in
//! `extra` so definitions round-trip to the API untouched.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentController {
    #[serde(rename = "type")]
    pub kind: String,
}

impl DeploymentController {
    pub const EXTERNAL: &'static str = "EXTERNAL";
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Service {
    pub service_name: String,
    #[serde(alias = "cluster", skip_serializing_if = "String::is_empty")]
    pub cluster_arn: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub service_arn: String,
    pub desired_count: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment_controller: Option<DeploymentController>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub launch_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_configuration: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<Tag>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub task_sets: Vec<TaskSet>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub status: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Service {
    pub fn uses_external_controller(&self) -> bool {
        self.deployment_controller
            .as_ref()
            .is_some_and(|c| c.kind == DeploymentController::EXTERNAL)
    }

    /// `clusterArn` when known, otherwise the cluster named in the definition
    pub fn cluster(&self) -> &str {
        &self.cluster_arn
    }

    /// ARN when the service exists, otherwise its name
    pub fn reference(&self) -> &str {
        if self.service_arn.is_empty() { &self.service_name } else { &self.service_arn }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContainerDefinition {
    pub name: String,
    pub image: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskDefinition {
    pub family: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub task_definition_arn: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub revision: i64,
    pub container_definitions: Vec<ContainerDefinition>,
    #[serde(deserialize_with = "string_or_number", skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    #[serde(deserialize_with = "string_or_number", skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn is_zero(n: &i64) -> bool {
    *n == 0
}

/// `cpu` and `memory` are strings on the wire but often written as numbers
fn string_or_number<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    match Option::<Value>::deserialize(d)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!("expected a string or a number, got {other}"))),
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scale {
    pub unit: String,
    pub value: f64,
}

impl Scale {
    pub fn percent(value: f64) -> Self {
        Self {
            unit: "PERCENT".to_string(),
            value,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskSet {
    pub id: String,
    pub task_set_arn: String,
    pub status: String,
    pub task_definition: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale: Option<Scale>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<Tag>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_definition_accepts_numeric_sizes() {
        let td: TaskDefinition = serde_yaml::from_str(
            "family: web\ncpu: 256\nmemory: \"512\"\nnetworkMode: awsvpc\ncontainerDefinitions:\n  - name: web\n    image: nginx:1.25\n    essential: true\n",
        )
        .unwrap();
        assert_eq!(td.cpu.as_deref(), Some("256"));
        assert_eq!(td.memory.as_deref(), Some("512"));
        assert_eq!(td.extra["networkMode"], "awsvpc");
        assert_eq!(td.container_definitions[0].extra["essential"], true);

        let json = serde_json::to_value(&td).unwrap();
        assert_eq!(json["cpu"], "256");
        assert!(json.get("taskDefinitionArn").is_none());
    }

    #[test]
    fn test_service_cluster_alias() {
        let svc: Service = serde_yaml::from_str(
            "cluster: arn:aws:ecs:ap-northeast-1:1:cluster/c\nserviceName: web\ndesiredCount: 2\ndeploymentController:\n  type: EXTERNAL\n",
        )
        .unwrap();
        assert_eq!(svc.cluster(), "arn:aws:ecs:ap-northeast-1:1:cluster/c");
        assert!(svc.uses_external_controller());
        assert_eq!(svc.reference(), "web");
    }
}
