use tokio::sync::broadcast;
use tracing::trace;

/// Host lifecycle signals that can trigger background revalidation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
  /// The application window gained focus
  FocusGained,
  /// Network reachability came back after being offline
  Reconnected,
  /// The document or view became visible again
  BecameVisible,
}

/// Fan-out channel for lifecycle events.
///
/// The host publishes into the bus; the refresh scheduler and any other
/// observer hold their own receiver.
#[derive(Debug, Clone)]
pub struct LifecycleBus {
  tx: broadcast::Sender<LifecycleEvent>,
}

impl LifecycleBus {
  pub fn new() -> Self {
    let (tx, _rx) = broadcast::channel(64);
    Self { tx }
  }

  /// Publish an event to every current subscriber.
  ///
  /// Publishing with no subscribers is not an error; the event is dropped.
  pub fn publish(&self, event: LifecycleEvent) {
    trace!(?event, "lifecycle event");
    let _ = self.tx.send(event);
  }

  /// Create a new receiver that observes events published from now on
  pub fn subscribe(&self) -> LifecycleReceiver {
    LifecycleReceiver {
      rx: self.tx.subscribe(),
    }
  }
}

impl Default for LifecycleBus {
  fn default() -> Self {
    Self::new()
  }
}

/// Receiving half of a [`LifecycleBus`]
pub struct LifecycleReceiver {
  rx: broadcast::Receiver<LifecycleEvent>,
}

impl LifecycleReceiver {
  /// Receive the next event, or `None` once the bus is gone.
  ///
  /// A receiver that fell behind skips the missed events; lifecycle signals
  /// are level-like, so only the latest ones matter.
  pub async fn next(&mut self) -> Option<LifecycleEvent> {
    loop {
      match self.rx.recv().await {
        Ok(event) => return Some(event),
        Err(broadcast::error::RecvError::Lagged(_)) => continue,
        Err(broadcast::error::RecvError::Closed) => return None,
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_subscribers_receive_published_events() {
    let bus = LifecycleBus::new();
    let mut first = bus.subscribe();
    let mut second = bus.subscribe();

    bus.publish(LifecycleEvent::FocusGained);
    bus.publish(LifecycleEvent::Reconnected);

    assert_eq!(first.next().await, Some(LifecycleEvent::FocusGained));
    assert_eq!(first.next().await, Some(LifecycleEvent::Reconnected));
    assert_eq!(second.next().await, Some(LifecycleEvent::FocusGained));
  }

  #[tokio::test]
  async fn test_receiver_ends_when_bus_dropped() {
    let bus = LifecycleBus::new();
    let mut rx = bus.subscribe();
    drop(bus);
    assert_eq!(rx.next().await, None);
  }
}
