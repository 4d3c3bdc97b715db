//! SQLite reference implementations of the store contracts.
//!
//! # Responsibility
//! - `account_repo`: credential store over the `accounts` table.
//! - `task_repo`: task store over the `tasks` table with live subscriptions.
//!
//! # Invariants
//! - SQL details never leave this module; callers see only store traits and
//!   semantic errors (`NotFound`, `PermissionDenied`, ...).

pub mod account_repo;
pub mod task_repo;
