/// Sink for operator-facing alerts.
///
/// Callers only decide whether to alert and with what text; delivery (mail,
/// chat, pager) belongs to the implementation.
pub trait Notifier: Send + Sync {
    fn notify(&self, subject: &str, body: &str);
}

/// Emits notifications as warn-level log events.
#[derive(Debug, Clone, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, subject: &str, body: &str) {
        tracing::warn!(subject, body, "Notification");
    }
}
