//! Per-scope tag cache.
//!
//! Entries are keyed by [`TagScope::cache_key`]: `"global"` or a project id.
//! Reads prefer the cache and fill misses from the adapter; fills and
//! refetches are merged as a union by id where the entry already cached
//! wins. Writes go through [`TagCache::upsert`] / [`TagCache::evict`] and
//! then [`TagCache::invalidate`], which bumps a version counter on a `watch`
//! channel so views can detect staleness without comparing lists.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use tokio::sync::watch;

use crate::error::Result;
use crate::model::{Tag, TagScope};
use crate::storage::StorageAdapter;
use crate::store::TaskStore;

/// Append `incoming` to `existing`, skipping ids already present.
pub fn merge_by_id(existing: &mut Vec<Tag>, incoming: impl IntoIterator<Item = Tag>) {
    let mut seen: HashSet<String> = existing.iter().map(|tag| tag.id.clone()).collect();
    for tag in incoming {
        if seen.insert(tag.id.clone()) {
            existing.push(tag);
        }
    }
}

#[derive(Debug)]
pub struct TagCache {
    entries: Mutex<HashMap<String, Vec<Tag>>>,
    version: watch::Sender<u64>,
}

impl Default for TagCache {
    fn default() -> Self {
        Self::new()
    }
}

impl TagCache {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            entries: Mutex::new(HashMap::new()),
            version,
        }
    }

    pub fn version(&self) -> u64 {
        *self.version.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Vec<Tag>>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Signal a cache-affecting change (including association changes).
    pub fn touch(&self) {
        self.version.send_modify(|version| *version += 1);
    }

    pub fn cached(&self, scope: &TagScope) -> Option<Vec<Tag>> {
        self.entries().get(scope.cache_key()).cloned()
    }

    pub fn find(&self, tag_id: &str) -> Option<Tag> {
        self.entries()
            .values()
            .flat_map(|tags| tags.iter())
            .find(|tag| tag.id == tag_id)
            .cloned()
    }

    fn merge(&self, scope: &TagScope, incoming: Vec<Tag>) -> Vec<Tag> {
        let mut entries = self.entries();
        let entry = entries.entry(scope.cache_key().to_string()).or_default();
        merge_by_id(entry, incoming);
        entry.clone()
    }

    /// Tags of exactly one scope, cache first.
    pub async fn tags_for_scope(
        &self,
        adapter: &dyn StorageAdapter,
        scope: &TagScope,
    ) -> Result<Vec<Tag>> {
        if let Some(tags) = self.cached(scope) {
            return Ok(tags);
        }
        let fetched = adapter.list_tags(Some(scope)).await?;
        Ok(self.merge(scope, fetched))
    }

    /// Everything visible from `project_id`: its own tags plus global ones.
    pub async fn list_all_tags(
        &self,
        adapter: &dyn StorageAdapter,
        project_id: Option<&str>,
    ) -> Result<Vec<Tag>> {
        let mut tags = Vec::new();
        if let Some(project_id) = project_id {
            let scope = TagScope::Project(project_id.to_string());
            tags = self.tags_for_scope(adapter, &scope).await?;
        }
        let global = self.tags_for_scope(adapter, &TagScope::Global).await?;
        merge_by_id(&mut tags, global);
        Ok(tags)
    }

    /// Every tag in the system, unscoped and uncached.
    pub async fn list_every_tag(&self, adapter: &dyn StorageAdapter) -> Result<Vec<Tag>> {
        adapter.list_tags(None).await
    }

    /// Refetch `scopes`, merge the results, then bump the version.
    pub async fn invalidate(&self, adapter: &dyn StorageAdapter, scopes: &[TagScope]) -> Result<()> {
        let mut done = HashSet::new();
        for scope in scopes {
            if !done.insert(scope.cache_key().to_string()) {
                continue;
            }
            let fetched = adapter.list_tags(Some(scope)).await?;
            self.merge(scope, fetched);
        }
        self.touch();
        Ok(())
    }

    /// Write a confirmed tag into its scope, replacing any older copy
    /// (including one cached under a previous scope).
    pub fn upsert(&self, tag: &Tag) {
        let mut entries = self.entries();
        for tags in entries.values_mut() {
            tags.retain(|existing| existing.id != tag.id);
        }
        entries
            .entry(tag.scope().cache_key().to_string())
            .or_default()
            .push(tag.clone());
    }

    /// Drop a tag from every scope; returns the scope it was cached under.
    pub fn evict(&self, tag_id: &str) -> Option<TagScope> {
        let mut entries = self.entries();
        let mut found = None;
        for tags in entries.values_mut() {
            if let Some(idx) = tags.iter().position(|tag| tag.id == tag_id) {
                found = Some(tags.remove(idx).scope());
            }
        }
        found
    }

    /// Forget every entry (refresh, mode change).
    pub fn clear(&self) {
        self.entries().clear();
        self.touch();
    }

    /// Usage per tag id over open tasks. Computed on every call.
    pub fn usage_counts(&self, store: &TaskStore) -> HashMap<String, usize> {
        let task_tags = store.task_tags();
        let mut counts = HashMap::new();
        for task in store.active().iter().filter(|task| task.is_open()) {
            for tag in task_tags.get(&task.id).into_iter().flatten() {
                *counts.entry(tag.id.clone()).or_insert(0) += 1;
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NewTask, Partition};
    use crate::storage::LocalAdapter;
    use chrono::Utc;

    fn tag(id: &str, name: &str, project: Option<&str>) -> Tag {
        Tag {
            id: id.to_string(),
            user_id: "u".to_string(),
            name: name.to_string(),
            project_id: project.map(str::to_string),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn merge_keeps_first_seen_entry() {
        let mut tags = vec![tag("a", "old", None)];
        merge_by_id(&mut tags, vec![tag("a", "new", None), tag("b", "b", None)]);
        assert_eq!(tags.len(), 2);
        assert_eq!(tags[0].name, "old");
    }

    #[tokio::test]
    async fn miss_fills_from_adapter_and_hit_skips_it() {
        let adapter = LocalAdapter::in_memory().expect("db");
        let created = adapter
            .create_tag("home", &TagScope::Global)
            .await
            .expect("tag");
        let cache = TagCache::new();

        let first = cache
            .tags_for_scope(&adapter, &TagScope::Global)
            .await
            .expect("fill");
        assert_eq!(first, vec![created.clone()]);

        adapter
            .create_tag("work", &TagScope::Global)
            .await
            .expect("tag");
        let second = cache
            .tags_for_scope(&adapter, &TagScope::Global)
            .await
            .expect("hit");
        assert_eq!(second, vec![created]);
    }

    #[tokio::test]
    async fn project_view_unions_global_tags() {
        let adapter = LocalAdapter::in_memory().expect("db");
        let global = adapter
            .create_tag("home", &TagScope::Global)
            .await
            .expect("tag");
        let scoped = adapter
            .create_tag("aisle", &TagScope::Project("p".to_string()))
            .await
            .expect("tag");
        adapter
            .create_tag("other", &TagScope::Project("q".to_string()))
            .await
            .expect("tag");
        let cache = TagCache::new();

        let visible = cache
            .list_all_tags(&adapter, Some("p"))
            .await
            .expect("visible");
        let ids: Vec<&str> = visible.iter().map(|tag| tag.id.as_str()).collect();
        assert_eq!(ids, vec![scoped.id.as_str(), global.id.as_str()]);
        assert_eq!(cache.list_every_tag(&adapter).await.expect("all").len(), 3);
    }

    #[tokio::test]
    async fn invalidate_bumps_version_once() {
        let adapter = LocalAdapter::in_memory().expect("db");
        let cache = TagCache::new();
        let rx = cache.subscribe();
        cache
            .invalidate(&adapter, &[TagScope::Global, TagScope::Global])
            .await
            .expect("invalidate");
        assert_eq!(cache.version(), 1);
        assert_eq!(*rx.borrow(), 1);
    }

    #[test]
    fn upsert_moves_tag_between_scopes() {
        let cache = TagCache::new();
        cache.upsert(&tag("a", "home", None));
        cache.upsert(&tag("a", "home", Some("p")));
        assert!(cache
            .cached(&TagScope::Global)
            .expect("global entry")
            .is_empty());
        assert_eq!(cache.find("a").expect("found").project_id.as_deref(), Some("p"));
        assert_eq!(cache.evict("a"), Some(TagScope::Project("p".to_string())));
        assert!(cache.find("a").is_none());
    }

    #[test]
    fn usage_counts_only_open_tasks() {
        let store = TaskStore::new();
        let now = Utc::now();
        let open = NewTask::titled("open").into_task("t1".into(), "u".into(), now);
        let mut done = NewTask::titled("done").into_task("t2".into(), "u".into(), now);
        done.completed = true;
        let mut abandoned = NewTask::titled("gone").into_task("t3".into(), "u".into(), now);
        abandoned.abandoned = true;
        store.set_tasks(Partition::Active, vec![open, done]);
        store.set_tasks(Partition::Abandoned, vec![abandoned]);
        for id in ["t1", "t2", "t3"] {
            store.attach_tag(id, tag("home", "home", None));
        }

        let counts = TagCache::new().usage_counts(&store);
        assert_eq!(counts.get("home"), Some(&1));
    }
}
