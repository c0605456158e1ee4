use std::fmt;
use std::sync::Arc;

use serde_json::{Value, json};
use tokio::sync::mpsc;

pub type LaunchFn = Arc<dyn Fn(&str) -> std::io::Result<()> + Send + Sync>;

/// Outbound JSON-RPC notification sink shared with the stdio writer.
#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::UnboundedSender<Value>,
}

impl Notifier {
    pub fn new(tx: mpsc::UnboundedSender<Value>) -> Self {
        Self { tx }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue a notification. Returns false when the transport is already gone.
    pub fn notify(&self, method: &str, params: Value) -> bool {
        self.tx
            .send(json!({
                "jsonrpc": "2.0",
                "method": method,
                "params": params
            }))
            .is_ok()
    }
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryOutcome {
    BrowserOpened,
    /// The launcher failed; the URL is still logged so a human can open it.
    BrowserFailed,
    Notified,
    /// Push delivery was selected but the transport dropped the message.
    NotificationDropped,
}

impl DeliveryOutcome {
    pub fn is_notification_only(self) -> bool {
        matches!(
            self,
            DeliveryOutcome::Notified | DeliveryOutcome::NotificationDropped
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryOutcome::BrowserOpened => "browser_opened",
            DeliveryOutcome::BrowserFailed => "browser_failed",
            DeliveryOutcome::Notified => "notified",
            DeliveryOutcome::NotificationDropped => "notification_dropped",
        }
    }
}

/// How a session URL reaches the human. Chosen once when the coordinator is built.
#[derive(Clone)]
pub enum Delivery {
    Browser { launch: LaunchFn },
    PushNotification { notifier: Notifier },
}

impl Delivery {
    pub fn browser() -> Self {
        Delivery::Browser {
            launch: Arc::new(|url: &str| open::that_detached(url)),
        }
    }

    pub fn with_launcher(launch: impl Fn(&str) -> std::io::Result<()> + Send + Sync + 'static) -> Self {
        Delivery::Browser {
            launch: Arc::new(launch),
        }
    }

    pub fn push(notifier: Notifier) -> Self {
        Delivery::PushNotification { notifier }
    }

    pub fn deliver(&self, url: &str) -> DeliveryOutcome {
        match self {
            Delivery::Browser { launch } => match launch(url) {
                Ok(()) => {
                    tracing::info!(url = %url, "opened interactive page in browser");
                    DeliveryOutcome::BrowserOpened
                }
                Err(err) => {
                    tracing::warn!(
                        url = %url,
                        error = %err,
                        "could not open browser; open the interactive page manually"
                    );
                    DeliveryOutcome::BrowserFailed
                }
            },
            Delivery::PushNotification { notifier } => {
                let delivered = notifier.notify(
                    "notifications/message",
                    json!({
                        "level": "info",
                        "logger": "cloudkit-interactive",
                        "data": { "type": "openUrl", "url": url }
                    }),
                );
                if delivered {
                    tracing::info!(url = %url, "sent openUrl notification instead of opening a browser");
                    DeliveryOutcome::Notified
                } else {
                    tracing::warn!(url = %url, "openUrl notification dropped: transport closed");
                    DeliveryOutcome::NotificationDropped
                }
            }
        }
    }

    pub fn mode(&self) -> &'static str {
        match self {
            Delivery::Browser { .. } => "browser",
            Delivery::PushNotification { .. } => "push_notification",
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mode())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn browser_delivery_reports_launcher_outcome() {
        let opened = Arc::new(Mutex::new(Vec::new()));
        let seen = opened.clone();
        let delivery = Delivery::with_launcher(move |url| {
            seen.lock().unwrap().push(url.to_string());
            Ok(())
        });
        assert_eq!(
            delivery.deliver("http://127.0.0.1:3721/env-setup/a"),
            DeliveryOutcome::BrowserOpened
        );
        assert_eq!(
            opened.lock().unwrap().as_slice(),
            ["http://127.0.0.1:3721/env-setup/a".to_string()]
        );

        let failing = Delivery::with_launcher(|_| {
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "no browser"))
        });
        assert_eq!(
            failing.deliver("http://127.0.0.1:3721/env-setup/b"),
            DeliveryOutcome::BrowserFailed
        );
    }

    #[test]
    fn push_delivery_emits_open_url_notification() {
        let (notifier, mut rx) = Notifier::channel();
        let delivery = Delivery::push(notifier);
        assert_eq!(
            delivery.deliver("http://127.0.0.1:3721/env-setup/c"),
            DeliveryOutcome::Notified
        );
        let message = rx.try_recv().expect("notification should be queued");
        assert_eq!(message["method"], "notifications/message");
        assert_eq!(message["params"]["data"]["type"], "openUrl");
        assert_eq!(
            message["params"]["data"]["url"],
            "http://127.0.0.1:3721/env-setup/c"
        );
    }

    #[test]
    fn push_delivery_with_closed_transport_is_still_notification_only() {
        let (notifier, rx) = Notifier::channel();
        drop(rx);
        let outcome = Delivery::push(notifier).deliver("http://127.0.0.1:1/x");
        assert_eq!(outcome, DeliveryOutcome::NotificationDropped);
        assert!(outcome.is_notification_only());
    }
}
