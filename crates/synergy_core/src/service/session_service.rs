//! Session use-case service.
//!
//! # Responsibility
//! - Own the current authenticated principal for this process.
//! - Delegate login/signup/logout to the credential store and surface its
//!   failures as displayable messages.
//! - Forward every session change, in order, to attached components and
//!   view observers.
//!
//! # Invariants
//! - Exactly one credential-store subscription is held from `new` until
//!   `shutdown` (or drop).
//! - `current_principal` reflects the latest session notification.
//! - Session listeners run before view observers for the same change.

use crate::model::principal::Principal;
use crate::store::credential::{CredentialError, CredentialStore, SessionListener};
use crate::store::subscription::{
    lock_or_recover, ListenerSet, Observer, OrderedDelivery, Subscription,
};
use log::{info, warn};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex, Weak};

/// Which credential call `submit` performs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AuthMode {
    #[default]
    Login,
    Signup,
}

impl AuthMode {
    pub fn toggled(self) -> Self {
        match self {
            Self::Login => Self::Signup,
            Self::Signup => Self::Login,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Login => "Log In",
            Self::Signup => "Sign Up",
        }
    }
}

/// Renderable session state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionView {
    pub principal: Option<Principal>,
    /// Last displayable failure of a login/signup/logout attempt.
    pub auth_error: Option<String>,
    pub mode: AuthMode,
}

/// Session operation failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    Credential(CredentialError),
    /// The manager was shut down and no longer tracks sessions.
    ShutDown,
}

impl SessionError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Credential(err) if err.is_retryable())
    }
}

impl Display for SessionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Credential(err) => write!(f, "{err}"),
            Self::ShutDown => write!(f, "session manager is shut down"),
        }
    }
}

impl Error for SessionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Credential(err) => Some(err),
            Self::ShutDown => None,
        }
    }
}

impl From<CredentialError> for SessionError {
    fn from(value: CredentialError) -> Self {
        Self::Credential(value)
    }
}

struct SessionShared {
    view: Mutex<SessionView>,
    session_listeners: Arc<ListenerSet<SessionListener>>,
    changes: OrderedDelivery<Option<Principal>>,
    observers: Arc<ListenerSet<Observer<SessionView>>>,
}

impl SessionShared {
    fn handle_change(&self, principal: &Option<Principal>) {
        let seq = {
            let mut view = lock_or_recover(&self.view);
            if principal.is_some() {
                view.auth_error = None;
            }
            view.principal = principal.clone();
            self.changes.push(principal.clone())
        };
        info!(
            "event=session_changed module=session status=ok signed_in={}",
            principal.is_some()
        );

        self.changes.deliver_until(seq, |principal| {
            self.session_listeners.emit(principal);
            self.emit_view();
        });
    }

    fn emit_view(&self) {
        let view = lock_or_recover(&self.view).clone();
        self.observers.emit(&view);
    }

    /// Applies `update` to the view and notifies observers if it changed.
    fn update_view(&self, update: impl FnOnce(&mut SessionView)) {
        let changed = {
            let mut view = lock_or_recover(&self.view);
            let before = view.clone();
            update(&mut view);
            *view != before
        };
        if changed {
            self.emit_view();
        }
    }
}

/// Owner of the authenticated principal.
pub struct SessionManager {
    credentials: Arc<dyn CredentialStore>,
    shared: Arc<SessionShared>,
    subscription: Mutex<Option<Subscription>>,
}

impl SessionManager {
    /// Creates the manager and opens its single session-change subscription.
    ///
    /// The credential store's current session is applied before this returns.
    pub fn new(credentials: Arc<dyn CredentialStore>) -> Self {
        let shared = Arc::new(SessionShared {
            view: Mutex::new(SessionView::default()),
            session_listeners: ListenerSet::new(),
            changes: OrderedDelivery::new(),
            observers: ListenerSet::new(),
        });

        let weak: Weak<SessionShared> = Arc::downgrade(&shared);
        let subscription = credentials.subscribe_session_changes(Arc::new(
            move |principal: &Option<Principal>| {
                if let Some(shared) = weak.upgrade() {
                    shared.handle_change(principal);
                }
            },
        ));

        Self {
            credentials,
            shared,
            subscription: Mutex::new(Some(subscription)),
        }
    }

    /// Signs in with email and password.
    ///
    /// On success the new principal is already current when this returns.
    pub fn login(&self, email: &str, password: &str) -> Result<Principal, SessionError> {
        self.begin_attempt()?;
        let result = self.credentials.authenticate(email, password);
        self.finish_attempt("login", result)
    }

    /// Creates an account and signs in immediately.
    pub fn signup(&self, email: &str, password: &str) -> Result<Principal, SessionError> {
        self.begin_attempt()?;
        let result = self.credentials.register(email, password);
        self.finish_attempt("signup", result)
    }

    /// Performs login or signup depending on the current mode.
    pub fn submit(&self, email: &str, password: &str) -> Result<Principal, SessionError> {
        match self.mode() {
            AuthMode::Login => self.login(email, password),
            AuthMode::Signup => self.signup(email, password),
        }
    }

    /// Ends the current session.
    pub fn logout(&self) -> Result<(), SessionError> {
        self.begin_attempt()?;
        let result = self.credentials.end_session();
        self.finish_attempt("logout", result)
    }

    pub fn current_principal(&self) -> Option<Principal> {
        lock_or_recover(&self.shared.view).principal.clone()
    }

    pub fn auth_error(&self) -> Option<String> {
        lock_or_recover(&self.shared.view).auth_error.clone()
    }

    pub fn mode(&self) -> AuthMode {
        lock_or_recover(&self.shared.view).mode
    }

    pub fn view(&self) -> SessionView {
        lock_or_recover(&self.shared.view).clone()
    }

    /// Selects the submit mode. Switching modes clears the last error.
    pub fn set_mode(&self, mode: AuthMode) {
        self.shared.update_view(|view| {
            if view.mode != mode {
                view.mode = mode;
                view.auth_error = None;
            }
        });
    }

    pub fn toggle_mode(&self) -> AuthMode {
        let next = self.mode().toggled();
        self.set_mode(next);
        next
    }

    /// Registers a principal listener.
    ///
    /// The current principal is delivered immediately, then every change.
    pub fn on_session_change(&self, listener: SessionListener) -> Subscription {
        let subscription = self
            .shared
            .session_listeners
            .register(Arc::clone(&listener));
        let current = self.current_principal();
        listener(&current);
        subscription
    }

    /// Registers a view observer, called after every session view change.
    pub fn observe(&self, observer: Observer<SessionView>) -> Subscription {
        self.shared.observers.register(observer)
    }

    pub fn is_running(&self) -> bool {
        lock_or_recover(&self.subscription).is_some()
    }

    /// Cancels the credential-store subscription.
    ///
    /// Later operations fail with `SessionError::ShutDown`.
    pub fn shutdown(&self) {
        let subscription = lock_or_recover(&self.subscription).take();
        if let Some(subscription) = subscription {
            subscription.cancel();
            info!("event=session_shutdown module=session status=ok");
        }
    }

    fn begin_attempt(&self) -> Result<(), SessionError> {
        if !self.is_running() {
            return Err(SessionError::ShutDown);
        }
        self.shared.update_view(|view| view.auth_error = None);
        Ok(())
    }

    fn finish_attempt<T>(
        &self,
        action: &str,
        result: Result<T, CredentialError>,
    ) -> Result<T, SessionError> {
        result.map_err(|err| {
            warn!(
                "event=session_{action} module=session status=error error_code={}",
                err.code()
            );
            let message = err.to_string();
            self.shared
                .update_view(|view| view.auth_error = Some(message));
            SessionError::Credential(err)
        })
    }
}
