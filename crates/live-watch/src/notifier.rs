use live_channel::SessionNotifier;
use tokio::sync::Notify;

/// Terminal rendition of the session notifier: the notice goes to stderr and
/// "navigate to login" ends the process so the user can sign in again.
#[derive(Default)]
pub struct ConsoleNotifier {
    logged_out: Notify,
}

impl ConsoleNotifier {
    /// Resolves once the login redirect fires.
    pub async fn logged_out(&self) {
        self.logged_out.notified().await;
    }
}

impl SessionNotifier for ConsoleNotifier {
    fn notify(&self, message: &str) {
        eprintln!("session ended: {message}");
    }

    fn navigate_to_login(&self) {
        tracing::info!("Login required, stopping");
        self.logged_out.notify_one();
    }
}
