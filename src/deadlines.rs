//! Deadline scan.
//!
//! Produces `deadline-approaching` and `overdue` notifications for open
//! tasks. Scheduling the scan is left to whoever calls it.

use chrono::{DateTime, Duration, Utc};

use crate::board::Board;
use crate::error::{Error, Result};
use crate::events::{Notification, NotificationKind};
use crate::model::ProjectStatus;

/// Parse a duration string like "30m", "2h", "3d".
///
/// A bare number is read as minutes.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();

    if s.is_empty() {
        return Err(Error::InvalidArgument("Duration cannot be empty".to_string()));
    }

    let (num_str, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(pos) => (&s[..pos], s[pos..].trim()),
        None => (s, "m"),
    };

    let num: i64 = num_str
        .parse()
        .map_err(|_| Error::InvalidArgument(format!("Invalid duration number: {num_str:?}")))?;

    let duration = match unit.to_lowercase().as_str() {
        "s" | "sec" | "second" | "seconds" => Duration::try_seconds(num),
        "m" | "min" | "minute" | "minutes" => Duration::try_minutes(num),
        "h" | "hr" | "hour" | "hours" => Duration::try_hours(num),
        "d" | "day" | "days" => Duration::try_days(num),
        "w" | "week" | "weeks" => Duration::try_weeks(num),
        _ => {
            return Err(Error::InvalidArgument(format!(
                "Invalid duration unit '{unit}'. Expected: s, m, h, d, w"
            )));
        }
    };

    duration.ok_or_else(|| Error::InvalidArgument(format!("Duration {s:?} is out of range")))
}

/// Notifications for every open task due within `window` of `now`, or
/// already past due.
///
/// Completed tasks and tasks of closed projects are skipped. A window
/// reaching past the representable calendar is an invalid argument.
pub fn scan_deadlines(
    board: &Board,
    now: DateTime<Utc>,
    window: Duration,
) -> Result<Vec<Notification>> {
    let horizon = now.checked_add_signed(window).ok_or_else(|| {
        Error::InvalidArgument(format!("deadline window {window} is out of range"))
    })?;
    let mut tasks: Vec<_> = board
        .tasks
        .iter()
        .filter(|task| !task.is_completed())
        .filter(|task| {
            board
                .project_of_task(task)
                .map_or(true, |project| project.status != ProjectStatus::Closed)
        })
        .filter_map(|task| task.due_date.map(|due| (due, task)))
        .filter(|(due, _)| *due <= horizon)
        .collect();
    tasks.sort_by(|(a_due, a), (b_due, b)| a_due.cmp(b_due).then_with(|| a.id.cmp(&b.id)));

    let notifications = tasks
        .into_iter()
        .flat_map(|(due, task)| {
            let due_label = due.format("%Y-%m-%d %H:%M UTC");
            if due < now {
                Notification::for_assignees(
                    task,
                    NotificationKind::Overdue,
                    "Task overdue",
                    &format!("\"{}\" was due {due_label}", task.title),
                )
            } else {
                Notification::for_assignees(
                    task,
                    NotificationKind::DeadlineApproaching,
                    "Deadline approaching",
                    &format!("\"{}\" is due {due_label}", task.title),
                )
            }
        })
        .collect();
    Ok(notifications)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::model::{Assignees, Priority, Task, TaskStatus};

    fn task(id: &str, status: TaskStatus, due: Option<DateTime<Utc>>) -> Task {
        Task {
            id: id.to_string(),
            stage_id: "stg-1".to_string(),
            title: id.to_string(),
            description: String::new(),
            status,
            priority: Priority::Medium,
            assigned_to: Assignees::new(["u-1", "u-2"]).expect("assignees"),
            created_by: "u-1".to_string(),
            created_at: Utc::now(),
            start_date: None,
            due_date: due,
            completed_at: None,
            approved_by: None,
            approved_at: None,
            requires_approval: false,
            parent_task_id: None,
            status_history: Vec::new(),
        }
    }

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("30").expect("bare"), Duration::minutes(30));
        assert_eq!(parse_duration("2h").expect("hours"), Duration::hours(2));
        assert_eq!(parse_duration("3 days").expect("days"), Duration::days(3));
        assert_eq!(parse_duration("1w").expect("weeks"), Duration::weeks(1));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("5y").is_err());
    }

    #[test]
    fn oversized_durations_are_rejected() {
        for input in ["9999999999999w", "9223372036854775807s", "99999999999999d"] {
            assert!(
                matches!(parse_duration(input), Err(Error::InvalidArgument(_))),
                "{input}"
            );
        }
        assert!(matches!(
            parse_duration("99999999999999999999"),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn window_past_the_calendar_is_rejected() {
        let window = parse_duration("100000000d").expect("representable duration");
        assert!(matches!(
            scan_deadlines(&Board::default(), Utc::now(), window),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn scan_splits_approaching_and_overdue() {
        let now = Utc::now();
        let board = Board {
            tasks: vec![
                task("late", TaskStatus::InProgress, Some(now - Duration::hours(1))),
                task("soon", TaskStatus::Pending, Some(now + Duration::hours(3))),
                task("later", TaskStatus::Pending, Some(now + Duration::days(5))),
                task("done", TaskStatus::Completed, Some(now - Duration::hours(1))),
                task("open", TaskStatus::Pending, None),
            ],
            ..Board::default()
        };

        let notes = scan_deadlines(&board, now, Duration::hours(48)).expect("scan");
        assert_eq!(notes.len(), 4);
        assert!(notes[..2].iter().all(|n| n.kind == NotificationKind::Overdue));
        assert!(notes[2..]
            .iter()
            .all(|n| n.kind == NotificationKind::DeadlineApproaching));
        assert_eq!(notes[2].related_task_id.as_deref(), Some("soon"));
    }
}
