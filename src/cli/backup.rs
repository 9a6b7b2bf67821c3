//! snail backup command implementations.

use crate::backup::{export_to, import_from, ImportMode};
use crate::cli::{BackupCommands, Session};
use crate::error::Result;
use crate::output::{emit_success, HumanOutput};

pub(crate) fn run(session: Session, cmd: BackupCommands) -> Result<()> {
    let adapter = session.sync.adapter().clone();
    match cmd {
        BackupCommands::Export { path } => {
            let manifest = session.block_on(export_to(adapter.as_ref(), &path))?;
            let mut human = HumanOutput::new("Backup exported");
            human.push_summary("Path", path.display().to_string());
            human.push_summary("Projects", manifest.counts.projects.to_string());
            human.push_summary("Tasks", manifest.counts.tasks.to_string());
            human.push_summary("Tags", manifest.counts.tags.to_string());
            emit_success(session.output(), "backup export", &manifest, Some(&human))
        }
        BackupCommands::Import { path, mode } => {
            let mode = ImportMode::from(mode);
            let report = session.block_on(import_from(adapter.as_ref(), &path, mode))?;
            let mut human = HumanOutput::new("Backup imported");
            human.push_summary("Path", path.display().to_string());
            human.push_summary("Mode", format!("{mode:?}").to_lowercase());
            human.push_summary("Projects", report.projects.to_string());
            human.push_summary("Tasks", report.tasks.to_string());
            human.push_summary("Tags", report.tags.to_string());
            if report.skipped_links > 0 {
                human.push_warning(format!(
                    "{} task-tag links skipped (missing task or tag)",
                    report.skipped_links
                ));
            }
            emit_success(session.output(), "backup import", &report, Some(&human))
        }
    }
}
