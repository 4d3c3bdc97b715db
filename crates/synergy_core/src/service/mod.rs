//! Core use-case services.
//!
//! # Responsibility
//! - `session_service`: own the authenticated principal.
//! - `task_sync`: keep a live task snapshot for that principal.
//! - Keep view layers decoupled from store details.

pub mod session_service;
pub mod task_sync;
