//! Authoritative in-memory task state.
//!
//! One [`TaskStore`] is shared by every view. It holds three mutually
//! exclusive collections (active, trashed, abandoned), the task-tag
//! associations, a selection pointer and per-collection loading flags.
//! All access goes through its methods; every mutation bumps a revision on a
//! `watch` channel so subscribers observe the same snapshot.
//!
//! Invariants kept by every mutation:
//! - an id appears at most once across the three collections
//! - a task lives in the collection named by its `deleted`/`abandoned` flags
//! - the selection is cleared when its task leaves all three collections

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::watch;

use crate::model::{Partition, Tag, Task};
use crate::reorder::sort_by_order;

const PARTITIONS: [Partition; 3] = [Partition::Active, Partition::Trashed, Partition::Abandoned];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadState {
    pub loading: bool,
    pub loaded: bool,
}

#[derive(Debug, Default)]
struct StoreState {
    active: Vec<Task>,
    trashed: Vec<Task>,
    abandoned: Vec<Task>,
    task_tags: HashMap<String, Vec<Tag>>,
    selected: Option<String>,
    load: HashMap<Partition, LoadState>,
}

impl StoreState {
    fn collection(&self, partition: Partition) -> &Vec<Task> {
        match partition {
            Partition::Active => &self.active,
            Partition::Trashed => &self.trashed,
            Partition::Abandoned => &self.abandoned,
        }
    }

    fn collection_mut(&mut self, partition: Partition) -> &mut Vec<Task> {
        match partition {
            Partition::Active => &mut self.active,
            Partition::Trashed => &mut self.trashed,
            Partition::Abandoned => &mut self.abandoned,
        }
    }

    fn locate(&self, id: &str) -> Option<(Partition, usize)> {
        PARTITIONS.iter().find_map(|partition| {
            self.collection(*partition)
                .iter()
                .position(|task| task.id == id)
                .map(|idx| (*partition, idx))
        })
    }

    fn contains(&self, id: &str) -> bool {
        self.locate(id).is_some()
    }

    fn take(&mut self, id: &str) -> Option<(Partition, usize, Task)> {
        let (partition, idx) = self.locate(id)?;
        let task = self.collection_mut(partition).remove(idx);
        Some((partition, idx, task))
    }

    /// Insert right after `after`, or at `index` when that task is gone.
    fn reinsert(&mut self, partition: Partition, after: Option<&str>, index: usize, task: Task) {
        let collection = self.collection_mut(partition);
        let index = match after {
            None => 0,
            Some(prev) => collection
                .iter()
                .position(|task| task.id == prev)
                .map_or(index.min(collection.len()), |idx| idx + 1),
        };
        collection.insert(index, task);
    }

    fn clear_dangling_selection(&mut self) {
        if let Some(selected) = self.selected.clone() {
            if !self.contains(&selected) {
                self.selected = None;
            }
        }
    }
}

/// Copy of some collections taken before a speculative change.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreSnapshot {
    collections: Vec<(Partition, Vec<Task>)>,
    task_tags: Option<HashMap<String, Vec<Tag>>>,
    selected: Option<String>,
}

impl StoreSnapshot {
    pub fn tasks(&self, partition: Partition) -> Option<&[Task]> {
        self.collections
            .iter()
            .find(|(p, _)| *p == partition)
            .map(|(_, tasks)| tasks.as_slice())
    }
}

/// Pre-mutation copy of one task and where it sat.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSnapshot {
    partition: Partition,
    index: usize,
    after: Option<String>,
    task: Task,
    tags: Option<Vec<Tag>>,
    selected: bool,
}

impl TaskSnapshot {
    pub fn task(&self) -> &Task {
        &self.task
    }
}

/// Process-wide task state container.
#[derive(Debug)]
pub struct TaskStore {
    state: Mutex<StoreState>,
    revision: watch::Sender<u64>,
}

impl Default for TaskStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskStore {
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            state: Mutex::new(StoreState::default()),
            revision,
        }
    }

    /// Receiver that changes whenever the store is mutated.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut StoreState) -> R) -> R {
        let result = {
            let mut state = self.lock();
            let result = f(&mut state);
            state.clear_dangling_selection();
            result
        };
        self.revision.send_modify(|revision| *revision += 1);
        result
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn tasks(&self, partition: Partition) -> Vec<Task> {
        self.lock().collection(partition).clone()
    }

    pub fn active(&self) -> Vec<Task> {
        self.tasks(Partition::Active)
    }

    pub fn trashed(&self) -> Vec<Task> {
        self.tasks(Partition::Trashed)
    }

    pub fn abandoned(&self) -> Vec<Task> {
        self.tasks(Partition::Abandoned)
    }

    pub fn get(&self, id: &str) -> Option<Task> {
        self.locate(id).map(|(_, task)| task)
    }

    pub fn locate(&self, id: &str) -> Option<(Partition, Task)> {
        let state = self.lock();
        state
            .locate(id)
            .map(|(partition, idx)| (partition, state.collection(partition)[idx].clone()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains(id)
    }

    pub fn len(&self) -> usize {
        let state = self.lock();
        PARTITIONS
            .iter()
            .map(|partition| state.collection(*partition).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Active tasks of one (project, completion-state) partition, ordered by
    /// `sort_order`.
    pub fn ordering_partition(&self, project_id: Option<&str>, completed: bool) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .lock()
            .active
            .iter()
            .filter(|task| task.project_id.as_deref() == project_id && task.completed == completed)
            .cloned()
            .collect();
        sort_by_order(&mut tasks);
        tasks
    }

    pub fn selected(&self) -> Option<String> {
        self.lock().selected.clone()
    }

    pub fn selected_task(&self) -> Option<Task> {
        let selected = self.selected()?;
        self.get(&selected)
    }

    pub fn load_state(&self, partition: Partition) -> LoadState {
        self.lock().load.get(&partition).copied().unwrap_or_default()
    }

    pub fn tags_for(&self, task_id: &str) -> Vec<Tag> {
        self.lock().task_tags.get(task_id).cloned().unwrap_or_default()
    }

    pub fn task_tags(&self) -> HashMap<String, Vec<Tag>> {
        self.lock().task_tags.clone()
    }

    // =========================================================================
    // Whole-collection setters
    // =========================================================================

    /// Replace one collection. Ids present elsewhere are dropped from the
    /// other collections; duplicates within `tasks` keep the first entry.
    pub fn set_tasks(&self, partition: Partition, tasks: Vec<Task>) {
        self.mutate(|state| {
            let mut seen = std::collections::HashSet::new();
            let tasks: Vec<Task> = tasks
                .into_iter()
                .filter(|task| seen.insert(task.id.clone()))
                .collect();
            for other in PARTITIONS.iter().filter(|p| **p != partition) {
                state
                    .collection_mut(*other)
                    .retain(|task| !seen.contains(&task.id));
            }
            *state.collection_mut(partition) = tasks;
            let load = state.load.entry(partition).or_default();
            load.loading = false;
            load.loaded = true;
        });
    }

    pub fn set_loading(&self, partition: Partition, loading: bool) {
        self.mutate(|state| {
            state.load.entry(partition).or_default().loading = loading;
        });
    }

    pub fn set_task_tags(&self, task_tags: HashMap<String, Vec<Tag>>) {
        self.mutate(|state| state.task_tags = task_tags);
    }

    /// Point the selection at `id`; `None` clears it. Unknown ids are ignored.
    pub fn select(&self, id: Option<&str>) -> bool {
        self.mutate(|state| match id {
            Some(id) if state.contains(id) => {
                state.selected = Some(id.to_string());
                true
            }
            Some(_) => false,
            None => {
                state.selected = None;
                true
            }
        })
    }

    pub fn clear_selection_if(&self, id: &str) {
        self.mutate(|state| {
            if state.selected.as_deref() == Some(id) {
                state.selected = None;
            }
        });
    }

    // =========================================================================
    // Targeted helpers
    // =========================================================================

    /// Put `task` at the head of the collection matching its flags,
    /// replacing any existing entry with the same id.
    pub fn prepend_task(&self, task: Task) {
        self.mutate(|state| {
            state.take(&task.id);
            state.collection_mut(task.partition()).insert(0, task);
        });
    }

    /// Optimistic insert of an unconfirmed task at the head of active tasks.
    pub fn insert_optimistic_task(&self, task: Task) {
        self.prepend_task(task);
    }

    /// Swap the entry with `id` for `task` (which may carry a new id).
    ///
    /// Keeps the position when the collection does not change; otherwise the
    /// task moves to the head of its new collection. Tag associations follow
    /// an id change. Returns `false` when `id` is not present.
    pub fn replace_task_by_id(&self, id: &str, task: Task) -> bool {
        self.mutate(|state| {
            let Some((partition, idx, _)) = state.take(id) else {
                return false;
            };
            if task.id != id {
                state.take(&task.id);
                if let Some(tags) = state.task_tags.remove(id) {
                    state.task_tags.insert(task.id.clone(), tags);
                }
                if state.selected.as_deref() == Some(id) {
                    state.selected = Some(task.id.clone());
                }
            }
            let target = task.partition();
            let collection = state.collection_mut(target);
            if target == partition {
                let idx = idx.min(collection.len());
                collection.insert(idx, task);
            } else {
                collection.insert(0, task);
            }
            true
        })
    }

    /// Apply `f` to the task with `id`, relocating it if its flags changed.
    /// Returns the task as it was before and after the change.
    /// `f` must not change the id.
    pub fn update_task(&self, id: &str, f: impl FnOnce(&mut Task)) -> Option<(Task, Task)> {
        self.mutate(|state| {
            let (partition, idx) = state.locate(id)?;
            let before = state.collection(partition)[idx].clone();
            let mut after = before.clone();
            f(&mut after);
            let target = after.partition();
            if target == partition {
                state.collection_mut(partition)[idx] = after.clone();
            } else {
                state.collection_mut(partition).remove(idx);
                state.collection_mut(target).insert(0, after.clone());
            }
            Some((before, after))
        })
    }

    pub fn remove_task(&self, id: &str) -> Option<(Partition, Task)> {
        self.mutate(|state| {
            let (partition, _, task) = state.take(id)?;
            state.task_tags.remove(id);
            Some((partition, task))
        })
    }

    pub fn attach_tag(&self, task_id: &str, tag: Tag) {
        self.mutate(|state| {
            let tags = state.task_tags.entry(task_id.to_string()).or_default();
            if !tags.iter().any(|existing| existing.id == tag.id) {
                tags.push(tag);
            }
        });
    }

    /// Returns the removed tag and its position in the task's list.
    pub fn detach_tag(&self, task_id: &str, tag_id: &str) -> Option<(usize, Tag)> {
        self.mutate(|state| {
            let tags = state.task_tags.get_mut(task_id)?;
            let idx = tags.iter().position(|tag| tag.id == tag_id)?;
            Some((idx, tags.remove(idx)))
        })
    }

    /// Put one association back at `index` unless the task already has it.
    /// Ignored when the task has left the store.
    pub fn restore_tag_link(&self, task_id: &str, index: usize, tag: Tag) {
        self.mutate(|state| {
            if !state.contains(task_id) {
                return;
            }
            let tags = state.task_tags.entry(task_id.to_string()).or_default();
            if !tags.iter().any(|existing| existing.id == tag.id) {
                let index = index.min(tags.len());
                tags.insert(index, tag);
            }
        });
    }

    /// Remove a tag from every association; returns what went and where,
    /// in removal order.
    pub fn drop_tag(&self, tag_id: &str) -> Vec<(String, usize, Tag)> {
        self.mutate(|state| {
            let mut removed = Vec::new();
            for (task_id, tags) in state.task_tags.iter_mut() {
                if let Some(idx) = tags.iter().position(|tag| tag.id == tag_id) {
                    removed.push((task_id.clone(), idx, tags.remove(idx)));
                }
            }
            removed
        })
    }

    /// Rewrite or drop a tag across every association (rename, delete).
    pub fn retag(&self, tag_id: &str, replacement: Option<&Tag>) {
        self.mutate(|state| {
            for tags in state.task_tags.values_mut() {
                match replacement {
                    Some(tag) => {
                        for existing in tags.iter_mut().filter(|t| t.id == tag_id) {
                            *existing = tag.clone();
                        }
                    }
                    None => tags.retain(|t| t.id != tag_id),
                }
            }
        });
    }

    // =========================================================================
    // Snapshot / revert
    // =========================================================================

    /// Capture the given collections (and optionally the tag associations).
    pub fn snapshot(&self, partitions: &[Partition], include_tags: bool) -> StoreSnapshot {
        let state = self.lock();
        StoreSnapshot {
            collections: partitions
                .iter()
                .map(|partition| (*partition, state.collection(*partition).clone()))
                .collect(),
            task_tags: include_tags.then(|| state.task_tags.clone()),
            selected: state.selected.clone(),
        }
    }

    /// Capture one task with its position, tags and selection.
    pub fn snapshot_task(&self, id: &str) -> Option<TaskSnapshot> {
        let state = self.lock();
        let (partition, index) = state.locate(id)?;
        let collection = state.collection(partition);
        Some(TaskSnapshot {
            partition,
            index,
            after: index
                .checked_sub(1)
                .map(|prev| collection[prev].id.clone()),
            task: state.collection(partition)[index].clone(),
            tags: state.task_tags.get(id).cloned(),
            selected: state.selected.as_deref() == Some(id),
        })
    }

    /// Put one captured task back in its old collection, right after the
    /// task that preceded it (or at its old index when that one is gone).
    ///
    /// Only applies while the live entry still equals `expected`; `None`
    /// expects the task to be absent. Anything else means a later change owns
    /// the record and the revert is skipped. Returns whether it applied.
    pub fn revert_task(&self, snapshot: TaskSnapshot, expected: Option<&Task>) -> bool {
        let TaskSnapshot {
            partition: home,
            index,
            after,
            task,
            tags,
            selected,
        } = snapshot;
        self.mutate(|state| {
            let id = task.id.clone();
            match (state.locate(&id), expected) {
                (Some((partition, idx)), Some(expected))
                    if state.collection(partition)[idx] == *expected =>
                {
                    if partition == home {
                        state.collection_mut(partition)[idx] = task;
                    } else {
                        state.collection_mut(partition).remove(idx);
                        state.reinsert(home, after.as_deref(), index, task);
                    }
                }
                (None, None) => state.reinsert(home, after.as_deref(), index, task),
                _ => return false,
            }
            if let Some(tags) = tags {
                state.task_tags.entry(id.clone()).or_insert(tags);
            }
            if selected && state.selected.is_none() {
                state.selected = Some(id);
            }
            true
        })
    }

    /// Put captured collections back verbatim.
    pub fn restore(&self, snapshot: StoreSnapshot) {
        self.mutate(|state| {
            for (partition, tasks) in &snapshot.collections {
                for other in PARTITIONS.iter().filter(|p| *p != partition) {
                    if snapshot.collections.iter().any(|(p, _)| p == other) {
                        continue;
                    }
                    state
                        .collection_mut(*other)
                        .retain(|task| !tasks.iter().any(|restored| restored.id == task.id));
                }
            }
            for (partition, tasks) in snapshot.collections {
                *state.collection_mut(partition) = tasks;
            }
            if let Some(task_tags) = snapshot.task_tags {
                state.task_tags = task_tags;
            }
            if let Some(selected) = snapshot.selected {
                if state.contains(&selected) {
                    state.selected = Some(selected);
                }
            }
        });
    }
}
