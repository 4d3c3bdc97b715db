//! SQLite-backed credential store.
//!
//! # Responsibility
//! - Register and authenticate email/password accounts.
//! - Hold the single active session of this store instance and notify
//!   listeners whenever it changes.
//!
//! # Invariants
//! - Emails are stored trimmed and lowercased.
//! - Passwords are never stored or logged; only Argon2id digests with a
//!   per-account random salt are persisted.
//! - Session listeners run without any store lock held and see session
//!   changes in the order they happened, even across threads.

use crate::db::{open_db, open_db_in_memory, DbError, DbResult};
use crate::model::principal::Principal;
use crate::store::credential::{
    CredentialError, CredentialResult, CredentialStore, SessionListener,
};
use crate::store::subscription::{lock_or_recover, ListenerSet, OrderedDelivery, Subscription};
use argon2::Argon2;
use log::{info, warn};
use once_cell::sync::Lazy;
use rand::rngs::OsRng;
use rand::RngCore;
use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use subtle::ConstantTimeEq;
use uuid::Uuid;

/// Minimum accepted password length, in characters.
pub const MIN_PASSWORD_LEN: usize = 6;

const PASSWORD_HASH_LEN: usize = 32;
const SALT_LEN: usize = 16;

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("valid email regex"));

struct AccountRow {
    uid: String,
    email: String,
    salt: Vec<u8>,
    hash: Vec<u8>,
}

/// Credential store over one SQLite connection.
pub struct SqliteCredentialStore {
    conn: Mutex<Connection>,
    session: Mutex<Option<Principal>>,
    listeners: Arc<ListenerSet<SessionListener>>,
    notifications: OrderedDelivery<Option<Principal>>,
}

impl SqliteCredentialStore {
    /// Opens (or creates) a file-backed store.
    ///
    /// Several instances may share one file; each keeps its own session.
    pub fn open(path: impl AsRef<Path>) -> DbResult<Self> {
        Ok(Self::from_connection(open_db(path)?))
    }

    /// Opens a private in-memory store.
    pub fn open_in_memory() -> DbResult<Self> {
        Ok(Self::from_connection(open_db_in_memory()?))
    }

    /// Wraps a connection that already has migrations applied.
    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
            session: Mutex::new(None),
            listeners: ListenerSet::new(),
            notifications: OrderedDelivery::new(),
        }
    }

    /// Ends the active session from outside the user's control, e.g. an
    /// expired or revoked token.
    pub fn invalidate_session(&self) {
        if self.replace_session(None) {
            warn!("event=session_invalidated module=credential_store status=ok");
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    fn find_account(&self, email: &str) -> CredentialResult<Option<AccountRow>> {
        let conn = lock_or_recover(&self.conn);
        conn.query_row(
            "SELECT uid, email, password_salt, password_hash FROM accounts WHERE email = ?1;",
            [email],
            |row| {
                Ok(AccountRow {
                    uid: row.get(0)?,
                    email: row.get(1)?,
                    salt: row.get(2)?,
                    hash: row.get(3)?,
                })
            },
        )
        .optional()
        .map_err(network_error)
    }

    /// Swaps the active session and notifies listeners when it changed.
    ///
    /// Signing in again as the same principal still notifies, so no
    /// sign-in is coalesced away.
    fn replace_session(&self, next: Option<Principal>) -> bool {
        let seq = {
            let mut session = lock_or_recover(&self.session);
            if next.is_none() && session.is_none() {
                return false;
            }
            *session = next.clone();
            self.notifications.push(next)
        };
        self.notifications
            .deliver_until(seq, |principal| self.listeners.emit(principal));
        true
    }
}

impl CredentialStore for SqliteCredentialStore {
    fn authenticate(&self, email: &str, password: &str) -> CredentialResult<Principal> {
        let email = normalize_email(email)?;
        let account = self.find_account(&email)?.ok_or_else(|| {
            info!("event=auth_login module=credential_store status=rejected error_code=invalid_credentials");
            CredentialError::InvalidCredentials
        })?;

        let digest = hash_password(password, &account.salt)?;
        if !bool::from(digest.as_slice().ct_eq(account.hash.as_slice())) {
            info!("event=auth_login module=credential_store status=rejected error_code=invalid_credentials");
            return Err(CredentialError::InvalidCredentials);
        }

        let principal = Principal::new(account.uid, account.email);
        info!(
            "event=auth_login module=credential_store status=ok uid={}",
            principal.uid
        );
        self.replace_session(Some(principal.clone()));
        Ok(principal)
    }

    fn register(&self, email: &str, password: &str) -> CredentialResult<Principal> {
        let email = normalize_email(email)?;
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(CredentialError::WeakPassword {
                min_len: MIN_PASSWORD_LEN,
            });
        }
        if self.find_account(&email)?.is_some() {
            return Err(CredentialError::EmailInUse);
        }

        let uid = Uuid::new_v4().simple().to_string();
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let digest = hash_password(password, &salt)?;

        {
            let conn = lock_or_recover(&self.conn);
            conn.execute(
                "INSERT INTO accounts (uid, email, password_salt, password_hash)
                 VALUES (?1, ?2, ?3, ?4);",
                params![uid, email, salt.as_slice(), digest.as_slice()],
            )
            .map_err(|err| {
                let err = DbError::from(err);
                if err.is_constraint_violation() {
                    CredentialError::EmailInUse
                } else {
                    CredentialError::Network(err.to_string())
                }
            })?;
        }

        let principal = Principal::new(uid, email);
        info!(
            "event=auth_register module=credential_store status=ok uid={}",
            principal.uid
        );
        self.replace_session(Some(principal.clone()));
        Ok(principal)
    }

    fn end_session(&self) -> CredentialResult<()> {
        if self.replace_session(None) {
            info!("event=auth_logout module=credential_store status=ok");
        }
        Ok(())
    }

    fn current_principal(&self) -> Option<Principal> {
        lock_or_recover(&self.session).clone()
    }

    fn subscribe_session_changes(&self, listener: SessionListener) -> Subscription {
        let subscription = self.listeners.register(Arc::clone(&listener));
        let current = self.current_principal();
        listener(&current);
        subscription
    }
}

/// Trims, lowercases and validates an email address.
pub fn normalize_email(email: &str) -> CredentialResult<String> {
    let normalized = email.trim().to_ascii_lowercase();
    if EMAIL_RE.is_match(&normalized) {
        Ok(normalized)
    } else {
        Err(CredentialError::InvalidEmail)
    }
}

fn hash_password(password: &str, salt: &[u8]) -> CredentialResult<[u8; PASSWORD_HASH_LEN]> {
    let mut digest = [0u8; PASSWORD_HASH_LEN];
    Argon2::default()
        .hash_password_into(password.as_bytes(), salt, &mut digest)
        .map_err(|err| CredentialError::Network(format!("password hashing failed: {err}")))?;
    Ok(digest)
}

fn network_error(err: rusqlite::Error) -> CredentialError {
    CredentialError::Network(DbError::Sqlite(err).to_string())
}
