use super::{impl_entity, require};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandStatus {
    #[default]
    CommandNotHandledYet,
    CommandSucceeded,
    CommandFailed,
    CommandTimeout,
}

impl CommandStatus {
    pub const fn is_handled(self) -> bool {
        !matches!(self, Self::CommandNotHandledYet)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandType {
    #[default]
    SyncApplication,
    UpdateApplicationConfig,
    CancelDeployment,
    ApproveStage,
    BuildPlanPreview,
    ChainSyncApplication,
    SkipStage,
    RestartPiped,
}

/// Imperative request addressed to a piped
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Command {
    pub id: String,
    pub piped_id: String,
    pub application_id: String,
    pub deployment_id: String,
    pub stage_id: String,
    pub project_id: String,
    /// Identity that issued the command
    pub commander: String,
    pub status: CommandStatus,
    pub metadata: BTreeMap<String, String>,
    pub handled_at: i64,
    #[serde(rename = "type")]
    pub kind: CommandType,
    /// Free form payload depending on `type`
    pub payload: serde_json::Value,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Command {
    fn validate_fields(&self) -> Result<()> {
        require(&self.id, "id")?;
        require(&self.piped_id, "pipedId")?;
        require(&self.project_id, "projectId")
    }

    pub fn is_handled(&self) -> bool {
        self.status.is_handled()
    }

    /// Record the handling result; a handled command never changes again
    pub fn handle(
        &mut self,
        status: CommandStatus,
        metadata: BTreeMap<String, String>,
        handled_at: i64,
    ) -> Result<()> {
        if self.is_handled() {
            return Err(Error::invalid_argument(format!("command {} was already handled", self.id)));
        }
        if !status.is_handled() {
            return Err(Error::invalid_argument("handled status must be terminal"));
        }
        self.status = status;
        self.metadata = metadata;
        self.handled_at = handled_at;
        Ok(())
    }
}

impl_entity!(Command, "Command");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_handle_terminal() {
        let mut c = Command { id: "c".into(), ..Default::default() };
        c.handle(CommandStatus::CommandTimeout, BTreeMap::new(), 10).unwrap();
        assert_eq!(c.status, CommandStatus::CommandTimeout);
        assert!(c.handle(CommandStatus::CommandSucceeded, BTreeMap::new(), 11).is_err());
    }

    #[test]
    fn test_command_type_field_name() {
        let c = Command { kind: CommandType::SkipStage, ..Default::default() };
        let v = serde_json::to_value(&c).unwrap();
        assert_eq!(v["type"], "SKIP_STAGE");
        assert_eq!(v["status"], "COMMAND_NOT_HANDLED_YET");
    }
}
