//! Serialized drag-reorder per (project, completion-state) partition.
//!
//! Each partition has one slot: a flag for the save in flight and a single
//! pending move. A move issued while a save is in flight replaces the
//! pending one (last write wins) and is replayed after the save against the
//! store as it is then, not as it was when queued.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::{debug, warn};

use super::{Intent, Notice, SyncOrchestrator};
use crate::error::{Error, Result};
use crate::model::{is_temp_id, TaskPatch};
use crate::reorder::{plan_move, OrderUpdate, ReorderPlan};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct PartitionKey {
    project_id: Option<String>,
    completed: bool,
}

#[derive(Debug, Default)]
pub(crate) struct ReorderSlot {
    pending: Option<(usize, usize)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReorderOutcome {
    /// Equal indices, or nothing to rewrite.
    Unchanged,
    Saved(ReorderPlan),
    /// Another save is in flight; the move will be replayed after it.
    Queued,
}

type Slots = Mutex<HashMap<PartitionKey, ReorderSlot>>;

/// Marks a partition busy; frees the slot if the caller goes away mid-save.
struct InFlight<'a> {
    slots: &'a Slots,
    key: PartitionKey,
    armed: bool,
}

impl InFlight<'_> {
    /// Take the queued move, or release the slot when there is none.
    fn next_pending(&mut self) -> Option<(usize, usize)> {
        let mut slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let pending = slots
            .get_mut(&self.key)
            .and_then(|slot| slot.pending.take());
        if pending.is_none() {
            slots.remove(&self.key);
            self.armed = false;
        }
        pending
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            slots.remove(&self.key);
        }
    }
}

impl SyncOrchestrator {
    /// Move the item at `source` to `destination` within the active tasks of
    /// `project_id` with the given completion state.
    pub async fn reorder(
        &self,
        project_id: Option<&str>,
        source: usize,
        destination: usize,
        completed: bool,
    ) -> Result<ReorderOutcome> {
        if source == destination {
            return Ok(ReorderOutcome::Unchanged);
        }
        let key = PartitionKey {
            project_id: project_id.map(str::to_string),
            completed,
        };
        {
            let mut slots = self
                .reorder_slots
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(slot) = slots.get_mut(&key) {
                slot.pending = Some((source, destination));
                debug!(source, destination, "reorder queued behind in-flight save");
                return Ok(ReorderOutcome::Queued);
            }
            slots.insert(key.clone(), ReorderSlot::default());
        }

        let mut guard = InFlight {
            slots: &self.reorder_slots,
            key,
            armed: true,
        };
        let outcome = self
            .persist_move(project_id, source, destination, completed)
            .await;
        while let Some((source, destination)) = guard.next_pending() {
            if let Err(err) = self
                .persist_move(project_id, source, destination, completed)
                .await
            {
                warn!(source, destination, error = %err, "replayed reorder failed");
            }
        }
        outcome
    }

    async fn persist_move(
        &self,
        project_id: Option<&str>,
        source: usize,
        destination: usize,
        completed: bool,
    ) -> Result<ReorderOutcome> {
        let partition = self.store.ordering_partition(project_id, completed);
        let items: Vec<(String, f64)> = partition
            .iter()
            .map(|task| (task.id.clone(), task.sort_order))
            .collect();
        let Some(plan) = plan_move(&items, source, destination, self.step)? else {
            return Ok(ReorderOutcome::Unchanged);
        };
        if let Some(update) = plan.updates.iter().find(|update| is_temp_id(&update.id)) {
            return Err(Error::Validation(format!(
                "task {} is not saved yet",
                update.id
            )));
        }

        let previous: HashMap<String, f64> = items.into_iter().collect();
        for update in &plan.updates {
            self.store
                .update_task(&update.id, |task| task.sort_order = update.sort_order);
        }
        debug!(
            moved = %plan.moved_id,
            writes = plan.updates.len(),
            renumber = plan.is_renumber(),
            "optimistic reorder"
        );

        for (idx, update) in plan.updates.iter().enumerate() {
            let patch = TaskPatch::sort_order(update.sort_order);
            if let Err(err) = self.adapter.update_task(&update.id, &patch).await {
                let (saved, unsaved) = plan.updates.split_at(idx);
                let undone = self.undo_saved_orders(saved, &previous).await;
                self.revert_orders(&undone, &previous);
                self.revert_orders(unsaved, &previous);
                warn!(?err, intent = ?Intent::Reorder, "sort order not saved");
                self.notify(Notice::SortNotSaved {
                    project_id: project_id.map(str::to_string),
                    message: err.to_string(),
                });
                return Err(Error::SortNotSaved(err.to_string()));
            }
        }
        Ok(ReorderOutcome::Saved(plan))
    }

    /// Write the old keys of a partly saved move back, best effort.
    /// Returns the updates the backend took back; the rest keep their new key
    /// locally so the store matches what is stored.
    async fn undo_saved_orders(
        &self,
        saved: &[OrderUpdate],
        previous: &HashMap<String, f64>,
    ) -> Vec<OrderUpdate> {
        let mut undone = Vec::with_capacity(saved.len());
        for update in saved {
            let Some(old) = previous.get(&update.id).copied() else {
                continue;
            };
            match self
                .adapter
                .update_task(&update.id, &TaskPatch::sort_order(old))
                .await
            {
                Ok(_) => undone.push(update.clone()),
                Err(err) => warn!(id = %update.id, error = %err, "could not undo saved sort key"),
            }
        }
        undone
    }

    /// Put back keys that never reached the backend, unless edited since.
    fn revert_orders(&self, unsaved: &[OrderUpdate], previous: &HashMap<String, f64>) {
        for update in unsaved {
            let Some(old) = previous.get(&update.id).copied() else {
                continue;
            };
            self.store.update_task(&update.id, |task| {
                if task.sort_order == update.sort_order {
                    task.sort_order = old;
                }
            });
        }
    }
}
