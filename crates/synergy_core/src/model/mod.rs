//! Domain model for the personal task tracker.
//!
//! # Responsibility
//! - Define the identity (`Principal`) and task records used by core logic.
//! - Keep write payloads (`NewTask`, `TaskPatch`) separate from stored rows.
//!
//! # Invariants
//! - Every task is identified by a store-assigned `TaskId`.
//! - `Task::owner_uid` never changes after creation.

pub mod principal;
pub mod task;
