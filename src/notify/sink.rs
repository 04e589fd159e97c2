//! Notification sink interface and fire-and-forget dispatch.

use crate::GateError;
use std::sync::Arc;
use tracing::{info, warn};

/// Best-effort delivery of a message to a subject.
///
/// Implementations may block; the dispatcher runs them off the async
/// workers.
pub trait NotificationSink: Send + Sync {
    /// Deliver one message.
    fn notify(&self, subject: &str, message: &str) -> Result<(), GateError>;
}

/// Sink that only writes notifications to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn notify(&self, subject: &str, message: &str) -> Result<(), GateError> {
        info!(subject, text = message, "notification");
        Ok(())
    }
}

/// Fire-and-forget dispatcher shared by the ledger and the sweeper.
///
/// Delivery failures are logged and never reach the caller.
#[derive(Clone)]
pub struct Notifier {
    sink: Arc<dyn NotificationSink>,
}

impl Notifier {
    /// Dispatcher over a sink.
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self { sink }
    }

    /// Queue a message for delivery and return immediately.
    ///
    /// Inside a tokio runtime delivery runs on the blocking pool; outside one
    /// it runs inline.
    pub fn send(&self, subject: &str, message: String) {
        let sink = Arc::clone(&self.sink);
        let subject = subject.to_string();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || deliver(sink.as_ref(), &subject, &message));
            }
            Err(_) => deliver(sink.as_ref(), &subject, &message),
        }
    }
}

fn deliver(sink: &dyn NotificationSink, subject: &str, message: &str) {
    if let Err(e) = sink.notify(subject, message) {
        warn!(subject, error = %e, "notification delivery failed");
    }
}

/// Sink that records messages in memory.
#[cfg(any(test, feature = "test-seams"))]
#[derive(Debug, Default)]
pub struct RecordingSink {
    sent: std::sync::Mutex<Vec<(String, String)>>,
}

#[cfg(any(test, feature = "test-seams"))]
impl RecordingSink {
    /// Empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything delivered so far, as `(subject, message)` pairs.
    pub fn messages(&self) -> Vec<(String, String)> {
        self.sent.lock().expect("recording sink lock").clone()
    }

    /// Messages delivered to one subject.
    pub fn messages_for(&self, subject: &str) -> Vec<String> {
        self.messages()
            .into_iter()
            .filter(|(s, _)| s == subject)
            .map(|(_, m)| m)
            .collect()
    }

    /// Wait until at least `count` messages arrived or two seconds pass.
    pub async fn wait_for(&self, count: usize) -> Vec<(String, String)> {
        for _ in 0..200 {
            if self.messages().len() >= count {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        self.messages()
    }
}

#[cfg(any(test, feature = "test-seams"))]
impl NotificationSink for RecordingSink {
    fn notify(&self, subject: &str, message: &str) -> Result<(), GateError> {
        self.sent
            .lock()
            .expect("recording sink lock")
            .push((subject.to_string(), message.to_string()));
        Ok(())
    }
}
