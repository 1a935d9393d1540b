//! sg task command implementations
//!
//! Status changes go through the workflow engine; this module only parses
//! arguments and renders reports.

use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};

use crate::error::{Error, Result};
use crate::model::{Assignees, Priority, TaskStatus};
use crate::output::{emit_success, project_line, stage_line, task_line, HumanOutput};
use crate::workflow::{CommentReport, NewComment, NewTask, TaskDetails, TaskReport, TransitionRequest};

use super::project::delete_human;
use super::{outcome_header, settle, Globals};

/// Options for `sg task add`
pub struct AddOptions {
    pub stage: String,
    pub title: String,
    pub assignees: Vec<String>,
    pub description: String,
    pub priority: String,
    pub start: Option<String>,
    pub due: Option<String>,
    pub approval: bool,
    pub after: Option<String>,
    pub globals: Globals,
}

/// Options for `sg task status`
pub struct StatusOptions {
    pub task: String,
    pub status: String,
    pub comment: Option<String>,
    pub op_id: Option<String>,
    pub globals: Globals,
}

/// Options for `sg task comment`
pub struct CommentOptions {
    pub task: String,
    pub content: String,
    pub reply_to: Option<String>,
    pub mention: Option<String>,
    pub attachment: Option<String>,
    pub globals: Globals,
}

pub fn run_add(options: AddOptions) -> Result<()> {
    let ctx = options.globals.context()?;
    let mut request = NewTask::new(options.title, Assignees::new(&options.assignees)?);
    request.description = options.description;
    request.priority = options.priority.parse::<Priority>()?;
    request.start_date = options
        .start
        .as_deref()
        .map(|raw| parse_date(raw, false))
        .transpose()?;
    request.due_date = options
        .due
        .as_deref()
        .map(|raw| parse_date(raw, true))
        .transpose()?;
    request.requires_approval = options.approval;
    request.parent_task_id = options.after;

    let (report, applied) = settle(ctx.workflow.add_task(&ctx.actor, &options.stage, request)?)?;
    let mut human = task_human(&outcome_header("task add", applied), &report);
    human.push_next_step(format!("sg task start {}", report.task.id));
    emit_success(options.globals.output(), "task add", &report, Some(&human))
}

pub fn run_show(globals: &Globals, task: &str) -> Result<()> {
    let ctx = globals.context()?;
    let details = ctx.workflow.task_details(task)?;
    let human = details_human(&details);
    emit_success(globals.output(), "task show", &details, Some(&human))
}

pub fn run_status(options: StatusOptions) -> Result<()> {
    let ctx = options.globals.context()?;
    let to: TaskStatus = options.status.parse()?;
    let mut request = TransitionRequest::new(options.task, to);
    request.comment = options.comment;
    request.op_id = options.op_id;

    let (report, applied) = settle(ctx.workflow.transition(&ctx.actor, request)?)?;
    let mut human = task_human(&outcome_header("task status", applied), &report);
    if report.task.status == TaskStatus::WaitingApproval {
        human.push_next_step("sg approvals");
    }
    emit_success(options.globals.output(), "task status", &report, Some(&human))
}

pub fn run_start(globals: &Globals, task: &str) -> Result<()> {
    let ctx = globals.context()?;
    let (report, applied) = settle(ctx.workflow.start_task(&ctx.actor, task)?)?;
    let human = task_human(&outcome_header("task start", applied), &report);
    emit_success(globals.output(), "task start", &report, Some(&human))
}

pub fn run_approve(globals: &Globals, task: &str, comment: Option<&str>) -> Result<()> {
    let ctx = globals.context()?;
    let (report, applied) = settle(ctx.workflow.approve_task(&ctx.actor, task, comment)?)?;
    let mut human = task_human(&outcome_header("task approve", applied), &report);
    human.push_next_step(format!("sg task status {} completed", report.task.id));
    emit_success(globals.output(), "task approve", &report, Some(&human))
}

pub fn run_reject(globals: &Globals, task: &str, reason: &str) -> Result<()> {
    let ctx = globals.context()?;
    let (report, applied) = settle(ctx.workflow.reject_task(&ctx.actor, task, reason)?)?;
    let mut human = task_human(&outcome_header("task reject", applied), &report);
    human.push_next_step(format!("sg task start {}", report.task.id));
    emit_success(globals.output(), "task reject", &report, Some(&human))
}

pub fn run_transfer(
    globals: &Globals,
    task: &str,
    assignees: Vec<String>,
    reason: Option<&str>,
) -> Result<()> {
    let ctx = globals.context()?;
    let assignees = Assignees::new(assignees)?;
    let (report, applied) =
        settle(ctx.workflow.transfer_task(&ctx.actor, task, assignees, reason)?)?;
    let human = task_human(&outcome_header("task transfer", applied), &report);
    emit_success(globals.output(), "task transfer", &report, Some(&human))
}

pub fn run_depend(globals: &Globals, task: &str, predecessor: Option<&str>) -> Result<()> {
    let ctx = globals.context()?;
    let (report, applied) = settle(ctx.workflow.set_predecessor(&ctx.actor, task, predecessor)?)?;
    let human = task_human(&outcome_header("task depend", applied), &report);
    emit_success(globals.output(), "task depend", &report, Some(&human))
}

pub fn run_comment(options: CommentOptions) -> Result<()> {
    let ctx = options.globals.context()?;
    let request = NewComment {
        content: options.content,
        parent_id: options.reply_to,
        mentioned_user_id: options.mention,
        attachment_url: options.attachment,
    };
    let report = ctx.workflow.add_comment(&ctx.actor, &options.task, request)?;
    let human = comment_human(&report);
    emit_success(options.globals.output(), "task comment", &report, Some(&human))
}

pub fn run_delete(globals: &Globals, task: &str) -> Result<()> {
    let ctx = globals.context()?;
    let (report, applied) = settle(ctx.workflow.delete_task(&ctx.actor, task)?)?;
    let human = delete_human(&outcome_header("task delete", applied), &report);
    emit_success(globals.output(), "task delete", &report, Some(&human))
}

/// Parse `YYYY-MM-DD` or RFC 3339. Bare dates land at the start of the day,
/// or its last second when `end_of_day` is set.
fn parse_date(raw: &str, end_of_day: bool) -> Result<DateTime<Utc>> {
    let trimmed = raw.trim();
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(timestamp.with_timezone(&Utc));
    }

    let date = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d").map_err(|_| {
        Error::InvalidArgument(format!(
            "invalid date '{trimmed}' (expected YYYY-MM-DD or RFC 3339)"
        ))
    })?;
    let time = if end_of_day {
        NaiveTime::from_hms_opt(23, 59, 59)
    } else {
        NaiveTime::from_hms_opt(0, 0, 0)
    }
    .ok_or_else(|| Error::InvalidArgument(format!("invalid date '{trimmed}'")))?;
    Ok(Utc.from_utc_datetime(&date.and_time(time)))
}

fn task_human(header: &str, report: &TaskReport) -> HumanOutput {
    let mut human = HumanOutput::new(header);
    human.push_summary("task", task_line(&report.task));
    if let Some(previous) = report.previous_status {
        human.push_summary("status", format!("{previous} -> {}", report.task.status));
    }
    if let Some(stage) = &report.stage {
        human.push_summary("stage", stage_line(stage));
    }
    if let Some(project) = &report.project {
        human.push_summary("project", project_line(project));
    }
    if let Some(comment) = &report.comment {
        human.push_detail(format!("comment {}: {}", comment.id, comment.content));
    }
    for note in &report.notifications {
        human.push_detail(format!("notified {} ({})", note.recipient_user_id, note.kind));
    }
    human
}

fn details_human(details: &TaskDetails) -> HumanOutput {
    let mut human = HumanOutput::new(format!("sg task show: {}", details.task.title));
    human.push_summary("task", task_line(&details.task));
    if !details.task.description.is_empty() {
        human.push_summary("description", details.task.description.clone());
    }
    if let Some(stage) = &details.stage {
        human.push_summary("stage", stage_line(stage));
    }
    if let Some(project) = &details.project {
        human.push_summary("project", project_line(project));
    }
    if !details.dependents.is_empty() {
        human.push_summary("dependents", details.dependents.join(", "));
    }
    for entry in &details.task.status_history {
        human.push_detail(format!(
            "{} {} by {}",
            entry.timestamp.format("%Y-%m-%d %H:%M"),
            entry.status,
            entry.user_name
        ));
    }
    for comment in &details.comments {
        let thread = match &comment.parent_id {
            Some(parent) => format!(" (reply to {parent})"),
            None => String::new(),
        };
        human.push_detail(format!(
            "comment {} by {}{}: {}",
            comment.id, comment.author_id, thread, comment.content
        ));
    }
    if let Some(reason) = &details.start_blocked_by {
        human.push_warning(format!("cannot start yet: {reason}"));
    }
    human
}

fn comment_human(report: &CommentReport) -> HumanOutput {
    let mut human = HumanOutput::new("sg task comment: applied");
    human.push_summary("comment", report.comment.id.clone());
    human.push_summary("task", report.comment.task_id.clone());
    if let Some(parent) = &report.comment.parent_id {
        human.push_summary("reply to", parent.clone());
    }
    for note in &report.notifications {
        human.push_detail(format!("notified {} ({})", note.recipient_user_id, note.kind));
    }
    human
}
