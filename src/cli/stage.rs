//! sg stage command implementations

use crate::error::Result;
use crate::output::{emit_success, project_line, stage_line, task_line, HumanOutput};
use crate::workflow::{NewStage, StageReport};

use super::project::delete_human;
use super::{outcome_header, settle, Globals};

/// Options for `sg stage add`
pub struct AddOptions {
    pub project: String,
    pub name: String,
    pub description: String,
    pub order: Option<i32>,
    pub approval: bool,
    pub globals: Globals,
}

pub fn run_add(options: AddOptions) -> Result<()> {
    let ctx = options.globals.context()?;
    let mut request = NewStage::new(options.name);
    request.description = options.description;
    request.order = options.order;
    request.requires_approval = options.approval;

    let (report, applied) =
        settle(ctx.workflow.add_stage(&ctx.actor, &options.project, request)?)?;
    let mut human = stage_human(&outcome_header("stage add", applied), &report);
    human.push_next_step(format!(
        "sg task add {} <title> --assign <user>",
        report.stage.id
    ));
    emit_success(options.globals.output(), "stage add", &report, Some(&human))
}

pub fn run_show(globals: &Globals, stage: &str) -> Result<()> {
    let ctx = globals.context()?;
    let report = ctx.workflow.stage_details(stage)?;
    let human = stage_human(&format!("sg stage show: {}", report.stage.name), &report);
    emit_success(globals.output(), "stage show", &report, Some(&human))
}

pub fn run_approve(globals: &Globals, stage: &str) -> Result<()> {
    let ctx = globals.context()?;
    let (report, applied) = settle(ctx.workflow.approve_stage(&ctx.actor, stage)?)?;
    let human = stage_human(&outcome_header("stage approve", applied), &report);
    emit_success(globals.output(), "stage approve", &report, Some(&human))
}

pub fn run_delete(globals: &Globals, stage: &str) -> Result<()> {
    let ctx = globals.context()?;
    let (report, applied) = settle(ctx.workflow.delete_stage(&ctx.actor, stage)?)?;
    let human = delete_human(&outcome_header("stage delete", applied), &report);
    emit_success(globals.output(), "stage delete", &report, Some(&human))
}

fn stage_human(header: &str, report: &StageReport) -> HumanOutput {
    let mut human = HumanOutput::new(header);
    human.push_summary("stage", stage_line(&report.stage));
    if let Some(project) = &report.project {
        human.push_summary("project", project_line(project));
    }
    for task in &report.tasks {
        human.push_detail(task_line(task));
    }
    human
}
