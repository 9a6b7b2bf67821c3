//! Backup archives.
//!
//! An archive is a gzip-compressed tar with five JSON entries at its root:
//! `manifest.json` plus one flat record array per kind. Import checks that
//! every entry is present and parses before it touches any data.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::model::{Project, Tag, Task, TaskTagLink};
use crate::storage::{StorageAdapter, TaskFilter};

/// Newest archive format this build reads and the one it writes.
pub const BACKUP_VERSION: u32 = 1;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const PROJECTS_FILE: &str = "projects.json";
pub const TASKS_FILE: &str = "tasks.json";
pub const TAGS_FILE: &str = "tags.json";
pub const TASK_TAGS_FILE: &str = "task_tags.json";

const REQUIRED_FILES: [&str; 5] = [
    MANIFEST_FILE,
    PROJECTS_FILE,
    TASKS_FILE,
    TAGS_FILE,
    TASK_TAGS_FILE,
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupCounts {
    pub projects: usize,
    pub tasks: usize,
    pub tags: usize,
    pub task_tags: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub app_version: String,
    pub counts: BackupCounts,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Backup {
    pub manifest: Manifest,
    pub projects: Vec<Project>,
    pub tasks: Vec<Task>,
    pub tags: Vec<Tag>,
    pub task_tags: Vec<TaskTagLink>,
}

impl Backup {
    pub fn new(
        projects: Vec<Project>,
        tasks: Vec<Task>,
        tags: Vec<Tag>,
        task_tags: Vec<TaskTagLink>,
    ) -> Self {
        let manifest = Manifest {
            version: BACKUP_VERSION,
            created_at: Utc::now(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            counts: BackupCounts {
                projects: projects.len(),
                tasks: tasks.len(),
                tags: tags.len(),
                task_tags: task_tags.len(),
            },
        };
        Self {
            manifest,
            projects,
            tasks,
            tags,
            task_tags,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportMode {
    /// Delete everything first.
    Replace,
    /// Upsert by id and keep everything else.
    Merge,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub mode: ImportMode,
    pub projects: usize,
    pub tasks: usize,
    pub tags: usize,
    pub task_tags: usize,
    /// Links whose task or tag does not exist.
    pub skipped_links: usize,
}

/// Read every record the session can see.
pub async fn collect(adapter: &dyn StorageAdapter) -> Result<Backup> {
    let projects = adapter.list_projects().await?;
    let tasks = adapter.list_tasks(&TaskFilter::all()).await?;
    let tags = adapter.list_tags(None).await?;
    let task_tags = adapter.list_task_tags().await?;
    Ok(Backup::new(projects, tasks, tags, task_tags))
}

fn append_json<W: Write, T: Serialize + ?Sized>(
    builder: &mut tar::Builder<W>,
    name: &str,
    value: &T,
    mtime: u64,
) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let mut header = tar::Header::new_gnu();
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(mtime);
    header.set_cksum();
    builder.append_data(&mut header, name, bytes.as_slice())?;
    Ok(())
}

/// Write `backup` as a `.tar.gz` stream into `writer`.
pub fn write_archive<W: Write>(backup: &Backup, writer: W) -> Result<W> {
    let mtime = backup.manifest.created_at.timestamp().max(0) as u64;
    let mut builder = tar::Builder::new(GzEncoder::new(writer, Compression::default()));
    append_json(&mut builder, MANIFEST_FILE, &backup.manifest, mtime)?;
    append_json(&mut builder, PROJECTS_FILE, &backup.projects, mtime)?;
    append_json(&mut builder, TASKS_FILE, &backup.tasks, mtime)?;
    append_json(&mut builder, TAGS_FILE, &backup.tags, mtime)?;
    append_json(&mut builder, TASK_TAGS_FILE, &backup.task_tags, mtime)?;
    let encoder = builder.into_inner()?;
    Ok(encoder.finish()?)
}

fn read_entries<R: Read>(reader: R) -> std::io::Result<HashMap<String, Vec<u8>>> {
    let mut archive = tar::Archive::new(GzDecoder::new(reader));
    let mut files = HashMap::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.to_string_lossy().into_owned();
        let name = path.trim_start_matches("./").to_string();
        let mut contents = Vec::new();
        entry.read_to_end(&mut contents)?;
        files.insert(name, contents);
    }
    Ok(files)
}

fn parse_entry<T: DeserializeOwned>(files: &HashMap<String, Vec<u8>>, name: &str) -> Result<T> {
    let bytes = files
        .get(name)
        .ok_or_else(|| Error::InvalidBackup(format!("missing {name}")))?;
    serde_json::from_slice(bytes).map_err(|err| Error::InvalidBackup(format!("{name}: {err}")))
}

/// Parse and validate an archive without touching storage.
pub fn read_archive<R: Read>(reader: R) -> Result<Backup> {
    let files = read_entries(reader)
        .map_err(|err| Error::InvalidBackup(format!("unreadable archive: {err}")))?;
    let missing: Vec<&str> = REQUIRED_FILES
        .iter()
        .copied()
        .filter(|name| !files.contains_key(*name))
        .collect();
    if !missing.is_empty() {
        return Err(Error::InvalidBackup(format!(
            "missing {}",
            missing.join(", ")
        )));
    }

    let manifest: Manifest = parse_entry(&files, MANIFEST_FILE)?;
    if manifest.version > BACKUP_VERSION {
        return Err(Error::InvalidBackup(format!(
            "backup version {} is newer than supported version {BACKUP_VERSION}",
            manifest.version
        )));
    }
    Ok(Backup {
        manifest,
        projects: parse_entry(&files, PROJECTS_FILE)?,
        tasks: parse_entry(&files, TASKS_FILE)?,
        tags: parse_entry(&files, TAGS_FILE)?,
        task_tags: parse_entry(&files, TASK_TAGS_FILE)?,
    })
}

/// Collect and write an archive to `path` atomically.
pub async fn export_to(adapter: &dyn StorageAdapter, path: &Path) -> Result<Manifest> {
    let backup = collect(adapter).await?;
    let bytes = write_archive(&backup, Vec::new())?;
    crate::lock::write_atomic(path, &bytes)?;
    info!(
        path = %path.display(),
        tasks = backup.manifest.counts.tasks,
        tags = backup.manifest.counts.tags,
        "backup exported"
    );
    Ok(backup.manifest)
}

pub async fn import_from(
    adapter: &dyn StorageAdapter,
    path: &Path,
    mode: ImportMode,
) -> Result<ImportReport> {
    let bytes = std::fs::read(path)?;
    let backup = read_archive(bytes.as_slice())?;
    let report = restore(adapter, &backup, mode).await?;
    info!(
        path = %path.display(),
        mode = ?mode,
        tasks = report.tasks,
        skipped_links = report.skipped_links,
        "backup imported"
    );
    Ok(report)
}

async fn clear_all(adapter: &dyn StorageAdapter) -> Result<()> {
    for task in adapter.list_tasks(&TaskFilter::all()).await? {
        adapter.delete_task(&task.id).await?;
    }
    for tag in adapter.list_tags(None).await? {
        adapter.delete_tag(&tag.id).await?;
    }
    for project in adapter.list_projects().await? {
        adapter.delete_project(&project.id).await?;
    }
    Ok(())
}

/// Write a parsed backup into storage. Records are re-owned by the session.
pub async fn restore(
    adapter: &dyn StorageAdapter,
    backup: &Backup,
    mode: ImportMode,
) -> Result<ImportReport> {
    if mode == ImportMode::Replace {
        clear_all(adapter).await?;
    }
    let owner = adapter.owner_id().to_string();

    for project in &backup.projects {
        let mut project = project.clone();
        project.user_id = owner.clone();
        adapter.put_project(&project).await?;
    }
    for tag in &backup.tags {
        let mut tag = tag.clone();
        tag.user_id = owner.clone();
        adapter.put_tag(&tag).await?;
    }
    for task in &backup.tasks {
        let mut task = task.clone();
        task.user_id = owner.clone();
        adapter.put_task(&task).await?;
    }

    let mut linked = 0;
    let mut skipped_links = 0;
    for link in &backup.task_tags {
        match adapter.attach_tag(&link.task_id, &link.tag_id).await {
            Ok(()) => linked += 1,
            Err(err) if err.is_not_found() => skipped_links += 1,
            Err(err) => return Err(err),
        }
    }

    Ok(ImportReport {
        mode,
        projects: backup.projects.len(),
        tasks: backup.tasks.len(),
        tags: backup.tags.len(),
        task_tags: linked,
        skipped_links,
    })
}
