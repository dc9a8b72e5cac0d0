use super::EntityStore;
use crate::{ListOptions, Operator, Order};
use pipecd_common::model::{Command, CommandStatus};
use pipecd_common::Result;
use std::collections::BTreeMap;

impl EntityStore<Command> {
    /// Commands addressed to `piped_id` that are still waiting, oldest first
    pub async fn list_unhandled(&self, piped_id: &str) -> Result<Vec<Command>> {
        let opts = ListOptions::default()
            .filter("PipedId", Operator::Equal, piped_id)
            .filter("Status", Operator::Equal, "COMMAND_NOT_HANDLED_YET")
            .order(Order::asc("CreatedAt"));
        self.list_all(&opts).await
    }

    /// Unhandled commands created before `before`, across every piped
    pub async fn list_unhandled_before(&self, before: i64) -> Result<Vec<Command>> {
        let opts = ListOptions::default()
            .filter("Status", Operator::Equal, "COMMAND_NOT_HANDLED_YET")
            .filter("CreatedAt", Operator::LessThan, before);
        self.list_all(&opts).await
    }

    pub async fn update_handled(
        &self,
        id: &str,
        status: CommandStatus,
        metadata: &BTreeMap<String, String>,
        handled_at: i64,
    ) -> Result<Command> {
        self.update(id, |c| c.handle(status, metadata.clone(), handled_at)).await
    }
}
