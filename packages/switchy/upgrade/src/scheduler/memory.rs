//! In-memory [`Scheduler`] queue.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{ScheduledAction, Scheduler, SchedulerError, TaskPayload};

#[derive(Debug, Default)]
pub struct MemoryScheduler {
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    next_id: i64,
    actions: Vec<ScheduledAction>,
}

impl MemoryScheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every pending action, soonest first.
    pub async fn pending(&self) -> Vec<ScheduledAction> {
        let mut actions = self.state.lock().await.actions.clone();
        actions.sort_by_key(|action| (action.run_at, action.id));
        actions
    }

    /// Remove and return every action due at or before `now`, soonest first.
    pub async fn take_due(&self, now: DateTime<Utc>) -> Vec<ScheduledAction> {
        let mut state = self.state.lock().await;
        let (mut due, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut state.actions)
            .into_iter()
            .partition(|action| action.run_at <= now);
        state.actions = pending;
        drop(state);

        due.sort_by_key(|action| (action.run_at, action.id));
        due
    }

    /// Drop every pending `task_name` in `group`. Returns how many were removed.
    pub async fn cancel(&self, task_name: &str, group: &str) -> usize {
        let mut state = self.state.lock().await;
        let before = state.actions.len();
        state
            .actions
            .retain(|action| action.task_name != task_name || action.group != group);
        before - state.actions.len()
    }
}

#[async_trait]
impl Scheduler for MemoryScheduler {
    async fn schedule(
        &self,
        run_at: DateTime<Utc>,
        task_name: &str,
        payload: &TaskPayload,
        group: &str,
    ) -> Result<(), SchedulerError> {
        log::debug!(
            "schedule: {task_name}({}) in {group} at {run_at}",
            payload.update_callback
        );

        let mut state = self.state.lock().await;
        state.next_id += 1;
        let id = state.next_id;
        state.actions.push(ScheduledAction {
            id,
            run_at,
            task_name: task_name.to_string(),
            payload: payload.clone(),
            group: group.to_string(),
        });

        Ok(())
    }

    async fn next_scheduled(
        &self,
        task_name: &str,
        group: &str,
    ) -> Result<Option<DateTime<Utc>>, SchedulerError> {
        Ok(self
            .state
            .lock()
            .await
            .actions
            .iter()
            .filter(|action| action.task_name == task_name && action.group == group)
            .map(|action| action.run_at)
            .min())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test_log::test(tokio::test)]
    async fn hands_out_due_actions_in_order() {
        let scheduler = MemoryScheduler::new();
        let now = Utc::now();

        for (offset, id) in [(2, "c"), (0, "a"), (1, "b"), (60, "later")] {
            scheduler
                .schedule(
                    now + TimeDelta::seconds(offset),
                    "shop_run_update_callback",
                    &TaskPayload::new(id),
                    "shop-db-updates",
                )
                .await
                .unwrap();
        }

        let due = scheduler.take_due(now + TimeDelta::seconds(5)).await;
        assert_eq!(
            due.iter()
                .map(|action| action.payload.update_callback.as_str())
                .collect::<Vec<_>>(),
            vec!["a", "b", "c"]
        );
        assert_eq!(scheduler.pending().await.len(), 1);
        assert_eq!(
            scheduler
                .next_scheduled("shop_run_update_callback", "shop-db-updates")
                .await
                .unwrap(),
            Some(now + TimeDelta::seconds(60))
        );
    }

    #[test_log::test(tokio::test)]
    async fn cancel_only_touches_the_matching_group() {
        let scheduler = MemoryScheduler::new();
        let now = Utc::now();
        let payload = TaskPayload::new("a");

        scheduler.schedule(now, "shop_run", &payload, "shop").await.unwrap();
        scheduler.schedule(now, "blog_run", &payload, "blog").await.unwrap();

        assert_eq!(scheduler.cancel("shop_run", "shop").await, 1);
        assert_eq!(scheduler.next_scheduled("shop_run", "shop").await.unwrap(), None);
        assert_eq!(
            scheduler.next_scheduled("blog_run", "blog").await.unwrap(),
            Some(now)
        );
    }
}
