//! User-facing notifications for mutation outcomes and terminal read failures.

use tracing::{error, info};

/// Sink for user-visible messages (toasts, status bar, ...).
///
/// Calls are fire-and-forget; implementations must not block.
pub trait Notifier: Send + Sync {
  fn success(&self, message: &str);
  fn error(&self, message: &str);
}

/// Notifier that only writes to the log.
///
/// Used when the host has no notification surface of its own.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
  fn success(&self, message: &str) {
    info!(target: "clinic_cache::notify", "{}", message);
  }

  fn error(&self, message: &str) {
    error!(target: "clinic_cache::notify", "{}", message);
  }
}

#[cfg(test)]
pub(crate) mod testing {
  use super::Notifier;
  use std::sync::Mutex;

  /// Notifier that records every message for assertions
  #[derive(Default)]
  pub struct RecordingNotifier {
    pub successes: Mutex<Vec<String>>,
    pub errors: Mutex<Vec<String>>,
  }

  impl Notifier for RecordingNotifier {
    fn success(&self, message: &str) {
      self.successes.lock().unwrap().push(message.to_string());
    }

    fn error(&self, message: &str) {
      self.errors.lock().unwrap().push(message.to_string());
    }
  }
}
