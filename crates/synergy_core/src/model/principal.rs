//! Authenticated identity model.

use serde::{Deserialize, Serialize};

/// Authenticated identity of the current user.
///
/// `uid` is stable for the lifetime of the account and is the only value
/// used for task ownership. `email` is display metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub uid: String,
    pub email: String,
}

impl Principal {
    pub fn new(uid: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            email: email.into(),
        }
    }
}
