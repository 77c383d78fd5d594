//! Best-effort network quality classification from host signals.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::event::{LifecycleBus, LifecycleEvent};

/// Coarse connection quality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
  Fast,
  Slow,
  Offline,
}

/// Current network conditions as seen by the monitor
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionState {
  pub quality: ConnectionQuality,
  pub is_online: bool,
  /// When the classification last changed
  pub changed_at: DateTime<Utc>,
}

/// Link type reported by the host (Network Information API style)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectiveType {
  Slow2g,
  TwoG,
  ThreeG,
  FourG,
}

impl EffectiveType {
  /// Parse the host's string form ("slow-2g", "2g", "3g", "4g").
  pub fn parse(s: &str) -> Option<Self> {
    match s.trim().to_lowercase().as_str() {
      "slow-2g" => Some(Self::Slow2g),
      "2g" => Some(Self::TwoG),
      "3g" => Some(Self::ThreeG),
      "4g" => Some(Self::FourG),
      _ => None,
    }
  }

  fn is_constrained(self) -> bool {
    !matches!(self, Self::FourG)
  }
}

/// Link-quality hints; every field is optional because hosts expose few of them
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkInfo {
  pub effective_type: Option<EffectiveType>,
  /// Estimated downlink throughput in Mbit/s
  pub downlink_mbps: Option<f64>,
  /// Estimated round-trip time
  pub rtt: Option<Duration>,
}

/// Thresholds below/above which a reachable link counts as slow
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct ConnectionThresholds {
  pub low_bandwidth_mbps: f64,
  pub high_latency_ms: u64,
}

impl Default for ConnectionThresholds {
  fn default() -> Self {
    Self {
      low_bandwidth_mbps: 1.5,
      high_latency_ms: 500,
    }
  }
}

/// Classify a link.
///
/// Offline if unreachable; slow if any hint says the link is constrained;
/// fast otherwise (including when no hints are available).
pub fn classify(
  online: bool,
  link: &LinkInfo,
  thresholds: &ConnectionThresholds,
) -> ConnectionQuality {
  if !online {
    return ConnectionQuality::Offline;
  }

  let constrained_type = link.effective_type.is_some_and(EffectiveType::is_constrained);
  let low_bandwidth = link
    .downlink_mbps
    .is_some_and(|mbps| mbps < thresholds.low_bandwidth_mbps);
  let high_latency = link
    .rtt
    .is_some_and(|rtt| rtt > Duration::from_millis(thresholds.high_latency_ms));

  if constrained_type || low_bandwidth || high_latency {
    ConnectionQuality::Slow
  } else {
    ConnectionQuality::Fast
  }
}

struct Signals {
  online: bool,
  link: LinkInfo,
}

struct MonitorInner {
  signals: Mutex<Signals>,
  thresholds: ConnectionThresholds,
  tx: watch::Sender<ConnectionState>,
  bus: Mutex<Option<LifecycleBus>>,
}

/// Observes reachability and link-change signals.
///
/// The host forwards its signals through [`set_online`](Self::set_online) and
/// [`update_link`](Self::update_link). Subscribers are notified synchronously,
/// and only when the classification actually changes.
#[derive(Clone)]
pub struct ConnectionMonitor {
  inner: Arc<MonitorInner>,
}

impl ConnectionMonitor {
  /// Create a monitor that starts out online with no link hints.
  pub fn new(thresholds: ConnectionThresholds) -> Self {
    let link = LinkInfo::default();
    let state = ConnectionState {
      quality: classify(true, &link, &thresholds),
      is_online: true,
      changed_at: Utc::now(),
    };
    let (tx, _rx) = watch::channel(state);

    Self {
      inner: Arc::new(MonitorInner {
        signals: Mutex::new(Signals { online: true, link }),
        thresholds,
        tx,
        bus: Mutex::new(None),
      }),
    }
  }

  /// Publish `Reconnected` on `bus` whenever the monitor goes from offline to online.
  pub fn attach_lifecycle_bus(&self, bus: LifecycleBus) {
    *self.inner.bus.lock().unwrap_or_else(PoisonError::into_inner) = Some(bus);
  }

  /// Latest classification; never blocks on the network.
  pub fn current_state(&self) -> ConnectionState {
    self.inner.tx.borrow().clone()
  }

  pub fn quality(&self) -> ConnectionQuality {
    self.inner.tx.borrow().quality
  }

  /// Receive a notification on every classification change
  pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
    self.inner.tx.subscribe()
  }

  /// Reachability-change signal
  pub fn set_online(&self, online: bool) {
    self.update(|signals| signals.online = online);
  }

  /// Link-change signal
  pub fn update_link(&self, link: LinkInfo) {
    self.update(|signals| signals.link = link);
  }

  fn update(&self, apply: impl FnOnce(&mut Signals)) {
    let (online, quality) = {
      let mut signals = self.inner.signals.lock().unwrap_or_else(PoisonError::into_inner);
      apply(&mut signals);
      let quality = classify(signals.online, &signals.link, &self.inner.thresholds);
      (signals.online, quality)
    };

    let mut reconnected = false;
    let changed = self.inner.tx.send_if_modified(|state| {
      if state.quality == quality && state.is_online == online {
        return false;
      }
      reconnected = !state.is_online && online;
      state.quality = quality;
      state.is_online = online;
      state.changed_at = Utc::now();
      true
    });

    if !changed {
      return;
    }
    debug!(?quality, online, "connection classification changed");

    if reconnected {
      info!("connectivity restored");
      let bus = self.inner.bus.lock().unwrap_or_else(PoisonError::into_inner).clone();
      if let Some(bus) = bus {
        bus.publish(LifecycleEvent::Reconnected);
      }
    }
  }
}

impl Default for ConnectionMonitor {
  fn default() -> Self {
    Self::new(ConnectionThresholds::default())
  }
}
