//! Predecessor gate for starting a task.
//!
//! A task whose `parentTaskId` names another task may only enter
//! `in-progress` once that predecessor is completed. The check reads the
//! predecessor's state at call time; callers must not cache the answer.

use std::collections::{HashMap, HashSet};

use tracing::warn;

use crate::board::Board;
use crate::error::BlockReason;
use crate::model::{Task, TaskStatus};

/// Something that can find a task by id.
pub trait PredecessorLookup {
    fn find_task(&self, id: &str) -> Option<&Task>;
}

impl PredecessorLookup for Board {
    fn find_task(&self, id: &str) -> Option<&Task> {
        self.task(id)
    }
}

impl PredecessorLookup for HashMap<&str, &Task> {
    fn find_task(&self, id: &str) -> Option<&Task> {
        self.get(id).copied()
    }
}

impl PredecessorLookup for HashMap<String, Task> {
    fn find_task(&self, id: &str) -> Option<&Task> {
        self.get(id)
    }
}

/// Whether `task` may enter `in-progress`.
///
/// A predecessor id that resolves to nothing is allowed through and logged.
pub fn can_start<L>(task: &Task, lookup: &L) -> Result<(), BlockReason>
where
    L: PredecessorLookup + ?Sized,
{
    let Some(predecessor_id) = task.predecessor_id() else {
        return Ok(());
    };

    let Some(predecessor) = lookup.find_task(predecessor_id) else {
        warn!(
            task_id = %task.id,
            predecessor_id,
            "predecessor task not found; allowing start"
        );
        return Ok(());
    };

    if predecessor.status == TaskStatus::Completed {
        return Ok(());
    }

    Err(BlockReason::DependencyPending {
        task_id: task.id.clone(),
        task_title: task.title.clone(),
        predecessor_id: predecessor.id.clone(),
        predecessor_title: predecessor.title.clone(),
        predecessor_status: predecessor.status,
    })
}

/// Whether making `candidate_parent` the predecessor of `task_id` would
/// close a loop in the predecessor chain.
pub fn would_cycle<L>(task_id: &str, candidate_parent: &str, lookup: &L) -> bool
where
    L: PredecessorLookup + ?Sized,
{
    let mut seen = HashSet::new();
    let mut cursor = Some(candidate_parent.to_string());
    while let Some(current) = cursor {
        if current == task_id {
            return true;
        }
        if !seen.insert(current.clone()) {
            // Existing loop not involving task_id.
            return false;
        }
        cursor = lookup
            .find_task(&current)
            .and_then(|task| task.predecessor_id())
            .map(str::to_string);
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::model::{Assignees, Priority};

    fn task(id: &str, status: TaskStatus, parent: Option<&str>) -> Task {
        Task {
            id: id.to_string(),
            stage_id: "stg-1".to_string(),
            title: format!("Task {id}"),
            description: String::new(),
            status,
            priority: Priority::Medium,
            assigned_to: Assignees::single("u-1").expect("assignees"),
            created_by: "u-1".to_string(),
            created_at: Utc::now(),
            start_date: None,
            due_date: None,
            completed_at: None,
            approved_by: None,
            approved_at: None,
            requires_approval: false,
            parent_task_id: parent.map(str::to_string),
            status_history: Vec::new(),
        }
    }

    fn index(tasks: &[Task]) -> HashMap<&str, &Task> {
        tasks.iter().map(|task| (task.id.as_str(), task)).collect()
    }

    #[test]
    fn no_predecessor_always_starts() {
        let task = task("a", TaskStatus::Pending, None);
        assert!(can_start(&task, &HashMap::<&str, &Task>::new()).is_ok());
    }

    #[test]
    fn missing_predecessor_fails_open() {
        let task = task("a", TaskStatus::Pending, Some("ghost"));
        assert!(can_start(&task, &HashMap::<&str, &Task>::new()).is_ok());
    }

    #[test]
    fn pending_predecessor_blocks_with_its_name() {
        let tasks = vec![
            task("a", TaskStatus::Pending, Some("b")),
            task("b", TaskStatus::Pending, None),
        ];
        let lookup = index(&tasks);
        let reason = can_start(&tasks[0], &lookup).expect_err("blocked");
        match &reason {
            BlockReason::DependencyPending {
                predecessor_id,
                predecessor_status,
                ..
            } => {
                assert_eq!(predecessor_id, "b");
                assert_eq!(*predecessor_status, TaskStatus::Pending);
            }
            other => panic!("unexpected reason: {other:?}"),
        }
        let message = reason.to_string();
        assert!(message.contains("Task b"));
        assert!(message.contains("(b)"));
    }

    #[test]
    fn only_completed_predecessor_unblocks() {
        for status in TaskStatus::ALL.iter().copied() {
            let tasks = vec![
                task("a", TaskStatus::Pending, Some("b")),
                task("b", status, None),
            ];
            let result = can_start(&tasks[0], &index(&tasks));
            assert_eq!(result.is_ok(), status == TaskStatus::Completed, "{status}");
        }
    }

    #[test]
    fn cycle_detection_walks_chain() {
        let tasks = vec![
            task("a", TaskStatus::Pending, None),
            task("b", TaskStatus::Pending, Some("a")),
            task("c", TaskStatus::Pending, Some("b")),
        ];
        let lookup = index(&tasks);
        assert!(would_cycle("a", "c", &lookup));
        assert!(would_cycle("a", "a", &lookup));
        assert!(!would_cycle("c", "a", &lookup));
        assert!(!would_cycle("new", "c", &lookup));
    }
}
