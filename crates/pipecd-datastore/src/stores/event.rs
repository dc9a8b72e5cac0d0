use super::EntityStore;
use crate::{ListOptions, Operator, Order};
use pipecd_common::model::{Event, EventStatus, now_unix};
use pipecd_common::Result;

impl EntityStore<Event> {
    /// Latest events of a stream that still wait for a piped to pick them up
    pub async fn list_not_handled(&self, project_id: &str, event_key: &str) -> Result<Vec<Event>> {
        let opts = ListOptions::default()
            .filter("ProjectId", Operator::Equal, project_id)
            .filter("EventKey", Operator::Equal, event_key)
            .filter("Status", Operator::Equal, "EVENT_NOT_HANDLED")
            .order(Order::desc("CreatedAt"));
        self.list_all(&opts).await
    }

    pub async fn update_status(&self, id: &str, status: EventStatus, description: &str) -> Result<Event> {
        let now = now_unix();
        self.update(id, |e| {
            e.status = status;
            e.status_description = description.to_string();
            e.handled_at = now;
            Ok(())
        })
        .await
    }
}
