//! Operator configuration (§6).

use crate::request::RequestMode;

/// Validated configuration for a [`PrefetchOperator`](crate::operator::PrefetchOperator).
///
/// Build with [`PrefetchConfig::new`] (or [`PrefetchConfig::builder`] for
/// the fluent form); `build()` validates `prefetch > 0` and `low_tide <=
/// prefetch` once, up front, instead of deferring the check to first use.
#[derive(Debug, Clone, Copy)]
pub struct PrefetchConfig {
    prefetch: usize,
    low_tide: usize,
    request_mode: RequestMode,
}

/// Error returned by [`PrefetchConfigBuilder::build`] when the
/// configuration is invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("prefetch must be greater than zero")]
    ZeroPrefetch,
    #[error("low_tide ({low_tide}) must not exceed prefetch ({prefetch})")]
    LowTideExceedsPrefetch { low_tide: usize, prefetch: usize },
}

impl PrefetchConfig {
    /// Shorthand for `PrefetchConfig::builder(prefetch).build()` with the
    /// default low-tide (`prefetch - prefetch/4`) and [`RequestMode::Eager`].
    pub fn new(prefetch: usize) -> Result<Self, ConfigError> {
        Self::builder(prefetch).build()
    }

    pub fn builder(prefetch: usize) -> PrefetchConfigBuilder {
        PrefetchConfigBuilder {
            prefetch,
            low_tide: None,
            request_mode: RequestMode::default(),
        }
    }

    pub fn prefetch(&self) -> usize {
        self.prefetch
    }

    pub fn low_tide(&self) -> usize {
        self.low_tide
    }

    /// The replenish threshold: §3's `limit` field, §6's "lowTide" —
    /// upstream is asked for `limit` more elements once this many have
    /// been drained since the last replenish. `low_tide` already *is*
    /// this threshold (defaulting to `prefetch - prefetch/4`, §3's
    /// formula); there is no further arithmetic here.
    pub fn limit(&self) -> usize {
        self.low_tide
    }

    pub fn request_mode(&self) -> RequestMode {
        self.request_mode
    }
}

/// Fluent builder for [`PrefetchConfig`].
#[derive(Debug, Clone, Copy)]
pub struct PrefetchConfigBuilder {
    prefetch: usize,
    low_tide: Option<usize>,
    request_mode: RequestMode,
}

impl PrefetchConfigBuilder {
    /// Overrides the default low-tide (`prefetch - prefetch/4`).
    pub fn low_tide(mut self, low_tide: usize) -> Self {
        self.low_tide = Some(low_tide);
        self
    }

    pub fn request_mode(mut self, mode: RequestMode) -> Self {
        self.request_mode = mode;
        self
    }

    pub fn build(self) -> Result<PrefetchConfig, ConfigError> {
        if self.prefetch == 0 {
            return Err(ConfigError::ZeroPrefetch);
        }
        let low_tide = self.low_tide.unwrap_or_else(|| {
            if self.prefetch == usize::MAX {
                self.prefetch
            } else {
                self.prefetch - self.prefetch / 4
            }
        });
        if low_tide > self.prefetch {
            return Err(ConfigError::LowTideExceedsPrefetch {
                low_tide,
                prefetch: self.prefetch,
            });
        }
        Ok(PrefetchConfig {
            prefetch: self.prefetch,
            low_tide,
            request_mode: self.request_mode,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_low_tide_is_three_quarters_prefetch() {
        let cfg = PrefetchConfig::new(32).unwrap();
        assert_eq!(cfg.low_tide(), 24);
        assert_eq!(cfg.limit(), 24);
    }

    #[test]
    fn explicit_low_tide_is_used_as_the_replenish_threshold_directly() {
        let cfg = PrefetchConfig::builder(32).low_tide(4).build().unwrap();
        assert_eq!(cfg.limit(), 4);
    }

    #[test]
    fn zero_prefetch_rejected() {
        assert_eq!(PrefetchConfig::new(0).unwrap_err(), ConfigError::ZeroPrefetch);
    }

    #[test]
    fn low_tide_above_prefetch_rejected() {
        let err = PrefetchConfig::builder(4).low_tide(5).build().unwrap_err();
        assert_eq!(
            err,
            ConfigError::LowTideExceedsPrefetch {
                low_tide: 5,
                prefetch: 4
            }
        );
    }

    #[test]
    fn unbounded_prefetch_has_unbounded_low_tide() {
        let cfg = PrefetchConfig::new(usize::MAX).unwrap();
        assert_eq!(cfg.low_tide(), usize::MAX);
        // §3: limit is ∞ when prefetch is ∞ — the engine reads this as
        // "never replenish" rather than a literal zero threshold.
        assert_eq!(cfg.limit(), usize::MAX);
    }
}
