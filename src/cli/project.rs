//! snail project command implementations.

use crate::cli::task::resolve_project;
use crate::cli::{short_id, ProjectCommands, Session};
use crate::error::Result;
use crate::model::NewProject;
use crate::output::{emit_success, HumanOutput};

pub(crate) fn run(session: Session, cmd: ProjectCommands) -> Result<()> {
    match cmd {
        ProjectCommands::Add { name, icon, color } => {
            let project = session.block_on(session.sync.adapter().create_project(NewProject {
                name,
                icon,
                color,
                sort_order: 0,
            }))?;
            let mut human = HumanOutput::new("Project created");
            human.push_summary("ID", project.id.clone());
            human.push_summary("Name", project.name.clone());
            human.push_next_step(format!(
                "snail task add \"...\" --project {}",
                short_id(&project.id)
            ));
            emit_success(session.output(), "project add", &project, Some(&human))
        }
        ProjectCommands::List => {
            let projects = session.block_on(session.sync.adapter().list_projects())?;
            let mut human = HumanOutput::new("Projects");
            human.push_summary("Count", projects.len().to_string());
            for project in &projects {
                let open = session
                    .sync
                    .store()
                    .ordering_partition(Some(&project.id), false)
                    .len();
                human.push_detail(format!(
                    "{} {} ({open} open)",
                    short_id(&project.id),
                    project.name
                ));
            }
            emit_success(session.output(), "project list", &projects, Some(&human))
        }
        ProjectCommands::Rm { id } => {
            let id = resolve_project(&session, &id)?;
            session.block_on(session.sync.delete_project(&id))?;
            let mut human = HumanOutput::new("Project deleted");
            human.push_summary("ID", id.clone());
            emit_success(
                session.output(),
                "project rm",
                &serde_json::json!({ "id": id }),
                Some(&human),
            )
        }
    }
}
