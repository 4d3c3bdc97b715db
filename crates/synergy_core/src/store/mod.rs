//! External collaborator contracts: credential store and task store.
//!
//! # Responsibility
//! - Define the traits the session manager and sync engine depend on.
//! - Define the cancellable `Subscription` handle shared by both stores.
//!
//! # Invariants
//! - Every store callback is invoked without any store lock held.
//! - Cancelling a `Subscription` stops all deliveries that start afterwards.

pub mod credential;
pub mod subscription;
pub mod task;
