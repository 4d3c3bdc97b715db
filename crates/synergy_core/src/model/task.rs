//! Task domain model.
//!
//! # Responsibility
//! - Define the stored task record and the write payloads accepted by stores.
//! - Provide the blank-text check applied before any create call.
//!
//! # Invariants
//! - `id` and `created_at_ms` are assigned by the store, never by clients.
//! - `text` is stored as typed and is never blank.
//! - A patch can only express a change to `completed`.

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Store-assigned task identifier.
pub type TaskId = Uuid;

/// One task document as delivered by a task store subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Serialized as `uid` to match the remote document schema.
    #[serde(rename = "uid")]
    pub owner_uid: String,
    pub text: String,
    pub completed: bool,
    /// Unix epoch milliseconds assigned by the store at creation.
    #[serde(rename = "createdAt")]
    pub created_at_ms: i64,
}

/// Create payload for a task.
///
/// `completed = false` and the creation timestamp are implied and filled in
/// by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTask {
    pub owner_uid: String,
    pub text: String,
}

impl NewTask {
    /// Builds a create payload. `text` is kept as typed.
    ///
    /// # Errors
    /// - Returns `TaskValidationError::EmptyText` for whitespace-only input.
    /// - Returns `TaskValidationError::EmptyOwner` when `owner_uid` is blank.
    pub fn new(
        owner_uid: impl Into<String>,
        text: &str,
    ) -> Result<Self, TaskValidationError> {
        let owner_uid = owner_uid.into();
        if owner_uid.trim().is_empty() {
            return Err(TaskValidationError::EmptyOwner);
        }
        if is_blank_task_text(text) {
            return Err(TaskValidationError::EmptyText);
        }
        Ok(Self {
            owner_uid,
            text: text.to_string(),
        })
    }
}

/// Partial update for one task.
///
/// Only `completed` is representable, so an update can never touch
/// `owner_uid`, `text` or `created_at_ms`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskPatch {
    pub completed: Option<bool>,
}

impl TaskPatch {
    pub fn set_completed(completed: bool) -> Self {
        Self {
            completed: Some(completed),
        }
    }

    /// Applies this patch to an in-memory task copy.
    pub fn apply_to(&self, task: &mut Task) {
        if let Some(completed) = self.completed {
            task.completed = completed;
        }
    }
}

/// Task payload validation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskValidationError {
    EmptyText,
    EmptyOwner,
}

impl Display for TaskValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyText => write!(f, "task text cannot be empty"),
            Self::EmptyOwner => write!(f, "task owner cannot be empty"),
        }
    }
}

impl Error for TaskValidationError {}

/// Returns whether `text` has nothing but whitespace.
pub fn is_blank_task_text(text: &str) -> bool {
    text.trim().is_empty()
}

#[cfg(test)]
mod tests {
    use super::{is_blank_task_text, NewTask, Task, TaskPatch, TaskValidationError};
    use uuid::Uuid;

    #[test]
    fn new_task_keeps_text_as_typed() {
        let task = NewTask::new("u1", "  Buy milk \n").expect("valid task");
        assert_eq!(task.text, "  Buy milk \n");
        assert_eq!(task.owner_uid, "u1");
    }

    #[test]
    fn new_task_rejects_blank_text_and_owner() {
        assert_eq!(
            NewTask::new("u1", " \t ").unwrap_err(),
            TaskValidationError::EmptyText
        );
        assert_eq!(
            NewTask::new("  ", "text").unwrap_err(),
            TaskValidationError::EmptyOwner
        );
        assert!(is_blank_task_text(""));
        assert!(!is_blank_task_text(" a "));
    }

    #[test]
    fn patch_only_changes_completed() {
        let mut task = Task {
            id: Uuid::new_v4(),
            owner_uid: "u1".to_string(),
            text: "write report".to_string(),
            completed: false,
            created_at_ms: 42,
        };
        let before = task.clone();

        TaskPatch::default().apply_to(&mut task);
        assert_eq!(task, before);

        TaskPatch::set_completed(true).apply_to(&mut task);
        assert!(task.completed);
        assert_eq!(task.owner_uid, before.owner_uid);
        assert_eq!(task.text, before.text);
        assert_eq!(task.created_at_ms, before.created_at_ms);
    }

    #[test]
    fn task_serializes_with_document_field_names() {
        let task = Task {
            id: Uuid::nil(),
            owner_uid: "u1".to_string(),
            text: "x".to_string(),
            completed: true,
            created_at_ms: 7,
        };
        let value = serde_json::to_value(&task).expect("serializable");
        assert_eq!(value["uid"], "u1");
        assert_eq!(value["createdAt"], 7);
        assert_eq!(value["completed"], true);
    }
}
