//! Credential store contract.
//!
//! # Responsibility
//! - Verify identity and issue a session `Principal`.
//! - Notify listeners of every session change, in occurrence order.
//!
//! # Invariants
//! - `subscribe_session_changes` delivers the current session state once,
//!   immediately, then every later change.
//! - Failures are typed; implementations never panic on bad input.

use crate::model::principal::Principal;
use crate::store::subscription::{Observer, Subscription};
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type CredentialResult<T> = Result<T, CredentialError>;

/// Listener receiving the new session state (`None` when signed out).
pub type SessionListener = Observer<Option<Principal>>;

/// Credential store failures surfaced to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    /// Unknown email or wrong password.
    InvalidCredentials,
    /// Email does not look like `local@domain.tld`.
    InvalidEmail,
    /// Registration for an email that already has an account.
    EmailInUse,
    /// Password shorter than the accepted minimum.
    WeakPassword { min_len: usize },
    /// Transient transport failure; the same call may be retried.
    Network(String),
}

impl CredentialError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    /// Stable machine-readable code for logs and callers.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidCredentials => "invalid_credentials",
            Self::InvalidEmail => "invalid_email",
            Self::EmailInUse => "email_in_use",
            Self::WeakPassword { .. } => "weak_password",
            Self::Network(_) => "network_error",
        }
    }
}

impl Display for CredentialError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidCredentials => write!(f, "Incorrect email or password."),
            Self::InvalidEmail => write!(f, "Please enter a valid email address."),
            Self::EmailInUse => write!(f, "An account with this email already exists."),
            Self::WeakPassword { min_len } => {
                write!(f, "Password should be at least {min_len} characters.")
            }
            Self::Network(details) => {
                write!(f, "Could not reach the account service: {details}")
            }
        }
    }
}

impl Error for CredentialError {}

/// Identity provider used by the session manager.
pub trait CredentialStore: Send + Sync {
    /// Signs in an existing account and makes it the active session.
    fn authenticate(&self, email: &str, password: &str) -> CredentialResult<Principal>;

    /// Creates an account and immediately makes it the active session.
    fn register(&self, email: &str, password: &str) -> CredentialResult<Principal>;

    /// Ends the active session. Ending an absent session succeeds.
    fn end_session(&self) -> CredentialResult<()>;

    /// Returns the active session principal.
    fn current_principal(&self) -> Option<Principal>;

    /// Registers a session-change listener.
    fn subscribe_session_changes(&self, listener: SessionListener) -> Subscription;
}
