//! Network quality observation and the tunables derived from it.

mod adaptive;
mod monitor;

pub use adaptive::{AdaptiveConfig, AdaptiveConfigProvider, AdaptiveOverride, AdaptiveOverrides};
pub use monitor::{
  classify, ConnectionMonitor, ConnectionQuality, ConnectionState, ConnectionThresholds,
  EffectiveType, LinkInfo,
};
