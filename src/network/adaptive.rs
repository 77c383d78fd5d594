//! Cache and retry tunables derived from connection quality.

use serde::Deserialize;
use std::time::Duration;

use super::monitor::{ConnectionMonitor, ConnectionQuality};

/// Tunables for one connection quality
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdaptiveConfig {
  /// How long fetched data counts as fresh
  pub freshness_window: Duration,
  /// How long fetched data is kept at all
  pub retention_window: Duration,
  /// Retries allowed for transient failures
  pub retry_budget: u32,
  /// Whether speculative prefetching is allowed
  pub preloading_enabled: bool,
}

impl AdaptiveConfig {
  /// Built-in table. Slow links keep data longer and retry less.
  pub const fn for_quality(quality: ConnectionQuality) -> Self {
    match quality {
      ConnectionQuality::Offline => Self {
        freshness_window: Duration::from_secs(15 * 60),
        retention_window: Duration::from_secs(30 * 60),
        retry_budget: 0,
        preloading_enabled: false,
      },
      ConnectionQuality::Slow => Self {
        freshness_window: Duration::from_secs(5 * 60),
        retention_window: Duration::from_secs(15 * 60),
        retry_budget: 1,
        preloading_enabled: false,
      },
      ConnectionQuality::Fast => Self {
        freshness_window: Duration::from_secs(2 * 60),
        retention_window: Duration::from_secs(10 * 60),
        retry_budget: 3,
        preloading_enabled: true,
      },
    }
  }
}

/// Partial override of one table row, as read from the config file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct AdaptiveOverride {
  pub freshness_secs: Option<u64>,
  pub retention_secs: Option<u64>,
  pub retry_budget: Option<u32>,
  pub preloading: Option<bool>,
}

impl AdaptiveOverride {
  fn apply(&self, mut config: AdaptiveConfig) -> AdaptiveConfig {
    if let Some(secs) = self.freshness_secs {
      config.freshness_window = Duration::from_secs(secs);
    }
    if let Some(secs) = self.retention_secs {
      config.retention_window = Duration::from_secs(secs);
    }
    if let Some(budget) = self.retry_budget {
      config.retry_budget = budget;
    }
    if let Some(preloading) = self.preloading {
      config.preloading_enabled = preloading;
    }
    config
  }
}

/// Per-quality overrides for the built-in table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AdaptiveOverrides {
  pub fast: AdaptiveOverride,
  pub slow: AdaptiveOverride,
  pub offline: AdaptiveOverride,
}

/// Maps the monitor's current quality to an [`AdaptiveConfig`].
///
/// Nothing is cached: every call reflects the latest classification.
#[derive(Clone)]
pub struct AdaptiveConfigProvider {
  monitor: ConnectionMonitor,
  overrides: AdaptiveOverrides,
}

impl AdaptiveConfigProvider {
  pub fn new(monitor: ConnectionMonitor) -> Self {
    Self {
      monitor,
      overrides: AdaptiveOverrides::default(),
    }
  }

  pub fn with_overrides(mut self, overrides: AdaptiveOverrides) -> Self {
    self.overrides = overrides;
    self
  }

  /// Tunables for an explicit quality, overrides applied
  pub fn config_for(&self, quality: ConnectionQuality) -> AdaptiveConfig {
    let row = match quality {
      ConnectionQuality::Fast => &self.overrides.fast,
      ConnectionQuality::Slow => &self.overrides.slow,
      ConnectionQuality::Offline => &self.overrides.offline,
    };
    row.apply(AdaptiveConfig::for_quality(quality))
  }

  /// Tunables for the current connection
  pub fn current(&self) -> AdaptiveConfig {
    self.config_for(self.monitor.quality())
  }

  pub fn monitor(&self) -> &ConnectionMonitor {
    &self.monitor
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_table_orders_windows_by_quality() {
    let fast = AdaptiveConfig::for_quality(ConnectionQuality::Fast);
    let slow = AdaptiveConfig::for_quality(ConnectionQuality::Slow);
    let offline = AdaptiveConfig::for_quality(ConnectionQuality::Offline);

    assert!(fast.freshness_window < slow.freshness_window);
    assert!(slow.freshness_window < offline.freshness_window);
    assert!(offline.retention_window >= Duration::from_secs(30 * 60));
    assert_eq!(offline.retry_budget, 0);
    assert_eq!(slow.retry_budget, 1);
    assert_eq!(fast.retry_budget, 3);
    assert!(fast.preloading_enabled);
    assert!(!slow.preloading_enabled && !offline.preloading_enabled);

    for config in [fast, slow, offline] {
      assert!(config.freshness_window < config.retention_window);
    }
  }

  #[test]
  fn test_provider_follows_monitor() {
    let monitor = ConnectionMonitor::default();
    let provider = AdaptiveConfigProvider::new(monitor.clone());
    assert_eq!(provider.current().retry_budget, 3);

    monitor.set_online(false);
    assert_eq!(provider.current(), AdaptiveConfig::for_quality(ConnectionQuality::Offline));
  }

  #[test]
  fn test_overrides_replace_only_given_fields() {
    let overrides = AdaptiveOverrides {
      fast: AdaptiveOverride {
        freshness_secs: Some(30),
        ..Default::default()
      },
      ..Default::default()
    };
    let provider = AdaptiveConfigProvider::new(ConnectionMonitor::default()).with_overrides(overrides);
    let config = provider.current();

    assert_eq!(config.freshness_window, Duration::from_secs(30));
    assert_eq!(config.retention_window, Duration::from_secs(10 * 60));
    assert_eq!(config.retry_budget, 3);
  }
}
