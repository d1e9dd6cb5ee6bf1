//! Routing for server-initiated session termination.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinHandle;

use crate::config::SessionConfig;
use crate::connection::ConnectionManager;
use crate::credentials::CredentialStore;
use crate::error::Error;
use crate::listeners::ListenerId;
use crate::types::{Event, EventKind, ForcedLogout};

const DEFAULT_LOGOUT_MESSAGE: &str = "Your session has ended. Please sign in again.";

/// How the embedding application tells the user their session ended.
pub trait SessionNotifier: Send + Sync {
    fn notify(&self, message: &str);
    fn navigate_to_login(&self);
}

/// Listens for `forced_logout` and either reconnects (token rotation) or
/// tears the session down and sends the user to the login screen.
pub struct SessionGuard {
    manager: ConnectionManager,
    listener: Option<ListenerId>,
    redirect: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SessionGuard {
    pub fn install(
        manager: &ConnectionManager,
        credentials: Arc<dyn CredentialStore>,
        notifier: Arc<dyn SessionNotifier>,
        config: SessionConfig,
    ) -> Self {
        let redirect: Arc<Mutex<Option<JoinHandle<()>>>> = Arc::new(Mutex::new(None));
        let weak = manager.downgrade();
        let pending = Arc::clone(&redirect);

        let listener = manager.on(EventKind::ForcedLogout, move |event| {
            let Event::ForcedLogout(logout) = event else {
                return;
            };
            let Some(manager) = weak.upgrade() else {
                return;
            };
            handle_forced_logout(
                &manager,
                credentials.as_ref(),
                &notifier,
                &config,
                &pending,
                logout,
            );
        });

        Self {
            manager: manager.clone(),
            listener: Some(listener),
            redirect,
        }
    }

    /// `true` while a login redirect is scheduled.
    pub fn redirect_pending(&self) -> bool {
        self.redirect
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    pub fn uninstall(&mut self) {
        if let Some(id) = self.listener.take() {
            self.manager.off(&EventKind::ForcedLogout, Some(id));
        }
        if let Some(task) = self
            .redirect
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.uninstall();
    }
}

fn handle_forced_logout(
    manager: &ConnectionManager,
    credentials: &dyn CredentialStore,
    notifier: &Arc<dyn SessionNotifier>,
    config: &SessionConfig,
    redirect: &Mutex<Option<JoinHandle<()>>>,
    logout: &ForcedLogout,
) {
    if logout.reason == config.token_refresh_reason {
        tracing::info!(reason = %logout.reason, "Server rotated credentials, reconnecting");
        manager.reconnect();
        return;
    }

    let err = Error::ForcedTermination {
        reason: logout.reason.clone(),
        message: logout.message.clone(),
    };
    tracing::warn!("{err}");

    credentials.clear();
    manager.disconnect();
    notifier.notify(logout.message.as_deref().unwrap_or(DEFAULT_LOGOUT_MESSAGE));

    let mut slot = redirect.lock().unwrap_or_else(PoisonError::into_inner);
    if slot.as_ref().is_some_and(|task| !task.is_finished()) {
        tracing::debug!("Login redirect already pending");
        return;
    }
    let delay = config.logout_redirect_delay();
    let notifier = Arc::clone(notifier);
    *slot = Some(tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        notifier.navigate_to_login();
    }));
}
