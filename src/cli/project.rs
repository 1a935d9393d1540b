//! sg project command implementations

use serde::Serialize;

use crate::error::{Error, Result};
use crate::model::{Priority, Project, ProjectStatus, TaskStatus};
use crate::output::{emit_success, project_line, stage_line, task_line, HumanOutput};
use crate::workflow::{DeleteReport, NewProject, NewStage, ProjectReport};

use super::{outcome_header, settle, Globals};

const APPROVAL_SUFFIX: &str = ":approval";

/// Options for `sg project new`
pub struct NewOptions {
    pub name: String,
    pub description: String,
    pub priority: String,
    pub stages: Vec<String>,
    pub globals: Globals,
}

#[derive(Serialize)]
struct ProjectSummary<'a> {
    project: &'a Project,
    stages: usize,
    tasks: usize,
    completed_tasks: usize,
}

#[derive(Serialize)]
struct ListReport<'a> {
    projects: Vec<ProjectSummary<'a>>,
}

pub fn run_new(options: NewOptions) -> Result<()> {
    let ctx = options.globals.context()?;
    let priority: Priority = options.priority.parse()?;
    let stages = options
        .stages
        .iter()
        .map(|raw| parse_stage_arg(raw))
        .collect::<Result<Vec<_>>>()?;

    let request = NewProject {
        name: options.name,
        description: options.description,
        priority,
        stages,
    };
    let (report, applied) = settle(ctx.workflow.create_project(&ctx.actor, request)?)?;

    let mut human = project_human(&outcome_header("project new", applied), &report);
    human.push_next_step(format!("sg stage add {} <name>", report.project.id));
    emit_success(options.globals.output(), "project new", &report, Some(&human))
}

pub fn run_list(globals: &Globals, status: Option<String>) -> Result<()> {
    let ctx = globals.context()?;
    let status = status
        .as_deref()
        .map(str::parse::<ProjectStatus>)
        .transpose()?;
    let board = ctx.workflow.load_board()?;

    let projects: Vec<ProjectSummary<'_>> = board
        .projects_by_recency()
        .into_iter()
        .filter(|project| status.map_or(true, |wanted| project.status == wanted))
        .map(|project| {
            let tasks = board.project_tasks(&project.id);
            ProjectSummary {
                project,
                stages: board.stages_of(&project.id).len(),
                completed_tasks: tasks
                    .iter()
                    .filter(|task| task.status == TaskStatus::Completed)
                    .count(),
                tasks: tasks.len(),
            }
        })
        .collect();

    let mut human = HumanOutput::new(format!("sg project list: {} project(s)", projects.len()));
    for summary in &projects {
        human.push_detail(format!(
            "{} - {} stage(s), {}/{} task(s) completed",
            project_line(summary.project),
            summary.stages,
            summary.completed_tasks,
            summary.tasks
        ));
    }
    if projects.is_empty() {
        human.push_next_step("sg project new <name>");
    }

    emit_success(
        globals.output(),
        "project list",
        &ListReport { projects },
        Some(&human),
    )
}

pub fn run_show(globals: &Globals, project: &str) -> Result<()> {
    let ctx = globals.context()?;
    let report = ctx.workflow.project_details(project)?;
    let human = project_human(&format!("sg project show: {}", report.project.name), &report);
    emit_success(globals.output(), "project show", &report, Some(&human))
}

pub fn run_close(globals: &Globals, project: &str) -> Result<()> {
    let ctx = globals.context()?;
    let (report, applied) = settle(ctx.workflow.close_project(&ctx.actor, project)?)?;
    let human = project_human(&outcome_header("project close", applied), &report);
    emit_success(globals.output(), "project close", &report, Some(&human))
}

pub fn run_delete(globals: &Globals, project: &str) -> Result<()> {
    let ctx = globals.context()?;
    let (report, applied) = settle(ctx.workflow.delete_project(&ctx.actor, project)?)?;
    let human = delete_human(&outcome_header("project delete", applied), &report);
    emit_success(globals.output(), "project delete", &report, Some(&human))
}

/// Shared rendering for delete reports.
pub(super) fn delete_human(header: &str, report: &DeleteReport) -> HumanOutput {
    let mut human = HumanOutput::new(header);
    human.push_summary(report.kind.to_string(), report.id.clone());
    human.push_summary("stages removed", report.removed_stages.to_string());
    human.push_summary("tasks removed", report.removed_tasks.to_string());
    human.push_summary("comments removed", report.removed_comments.to_string());
    for dependent in &report.detached_dependents {
        human.push_warning(format!("{dependent} no longer has a predecessor"));
    }
    if let Some(stage) = &report.stage {
        human.push_summary("stage", stage_line(stage));
    }
    if let Some(project) = &report.project {
        human.push_summary("project", project_line(project));
    }
    human
}

fn project_human(header: &str, report: &ProjectReport) -> HumanOutput {
    let mut human = HumanOutput::new(header);
    human.push_summary("project", project_line(&report.project));
    if !report.project.description.is_empty() {
        human.push_summary("description", report.project.description.clone());
    }
    for stage in &report.stages {
        human.push_detail(stage_line(stage));
        for task in report.tasks.iter().filter(|task| task.stage_id == stage.id) {
            human.push_detail(format!("  {}", task_line(task)));
        }
    }
    human
}

/// `Name` or `Name:approval`.
fn parse_stage_arg(raw: &str) -> Result<NewStage> {
    let trimmed = raw.trim();
    let (name, requires_approval) = match trimmed.strip_suffix(APPROVAL_SUFFIX) {
        Some(name) => (name.trim(), true),
        None => (trimmed, false),
    };
    if name.is_empty() {
        return Err(Error::InvalidArgument(format!(
            "invalid --stage '{raw}' (expected NAME or NAME{APPROVAL_SUFFIX})"
        )));
    }
    let mut stage = NewStage::new(name);
    stage.requires_approval = requires_approval;
    Ok(stage)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_arg_marks_approval_gate() {
        let plain = parse_stage_arg("Design").expect("plain");
        assert_eq!(plain.name, "Design");
        assert!(!plain.requires_approval);

        let gated = parse_stage_arg(" Sign-off:approval ").expect("gated");
        assert_eq!(gated.name, "Sign-off");
        assert!(gated.requires_approval);

        assert!(parse_stage_arg(":approval").is_err());
    }
}
