//! Adaptive polling interval policies
//!
//! A strategy looks at a user's current interval and recent sync counts
//! (oldest first) and decides how long to wait before the next sync.

use chrono::{Local, Timelike};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{PollingConfig, PollingStrategyKind};

pub trait PollingStrategy: Send + Sync + Debug {
    /// Interval to use after a sync cycle
    fn next_interval(&self, current: Duration, recent_counts: &[u64]) -> Duration;

    /// Interval for a user with no sync history
    fn initial_interval(&self) -> Duration;

    fn name(&self) -> &'static str;
}

/// Build the strategy selected in the configuration
pub fn strategy_from_config(config: &PollingConfig) -> Arc<dyn PollingStrategy> {
    match config.strategy {
        PollingStrategyKind::Volume => Arc::new(VolumeBasedPolling::new(config.clone())),
        PollingStrategyKind::Time => Arc::new(TimeBasedPolling::new(config.clone())),
        PollingStrategyKind::Hybrid => Arc::new(HybridPolling::new(config.clone())),
    }
}

fn average(counts: &[u64]) -> Option<f64> {
    if counts.is_empty() {
        None
    } else {
        Some(counts.iter().sum::<u64>() as f64 / counts.len() as f64)
    }
}

/// Shrinks the interval under high volume and grows it when quiet
#[derive(Debug, Clone)]
pub struct VolumeBasedPolling {
    config: PollingConfig,
}

impl VolumeBasedPolling {
    pub fn new(config: PollingConfig) -> Self {
        Self { config }
    }
}

impl PollingStrategy for VolumeBasedPolling {
    fn next_interval(&self, current: Duration, recent_counts: &[u64]) -> Duration {
        let Some(avg) = average(recent_counts) else {
            return self.config.default_interval();
        };

        if avg > self.config.high_volume_threshold {
            current
                .mul_f64(self.config.shrink_factor)
                .max(self.config.min_interval())
        } else if avg < self.config.low_volume_threshold {
            current
                .mul_f64(self.config.grow_factor)
                .clamp(self.config.min_interval(), self.config.max_interval())
        } else {
            self.config.default_interval()
        }
    }

    fn initial_interval(&self) -> Duration {
        self.config.default_interval()
    }

    fn name(&self) -> &'static str {
        "volume"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayPeriod {
    Business,
    Evening,
    Night,
}

/// Fixed intervals by local time of day
#[derive(Debug, Clone)]
pub struct TimeBasedPolling {
    config: PollingConfig,
}

impl TimeBasedPolling {
    pub fn new(config: PollingConfig) -> Self {
        Self { config }
    }

    pub fn period_at(&self, hour: u32) -> DayPeriod {
        if (self.config.business_hours_start..self.config.business_hours_end).contains(&hour) {
            DayPeriod::Business
        } else if (self.config.business_hours_end..self.config.evening_end).contains(&hour) {
            DayPeriod::Evening
        } else {
            DayPeriod::Night
        }
    }

    pub fn interval_at(&self, hour: u32) -> Duration {
        let secs = match self.period_at(hour) {
            DayPeriod::Business => self.config.business_interval_secs,
            DayPeriod::Evening => self.config.evening_interval_secs,
            DayPeriod::Night => self.config.night_interval_secs,
        };
        Duration::from_secs(secs)
    }
}

impl PollingStrategy for TimeBasedPolling {
    fn next_interval(&self, _current: Duration, _recent_counts: &[u64]) -> Duration {
        self.interval_at(Local::now().hour())
    }

    fn initial_interval(&self) -> Duration {
        self.interval_at(Local::now().hour())
    }

    fn name(&self) -> &'static str {
        "time"
    }
}

/// Volume policy adjusted by time of day
///
/// During business hours the shorter of the two intervals wins, otherwise
/// the longer one.
#[derive(Debug, Clone)]
pub struct HybridPolling {
    volume: VolumeBasedPolling,
    time: TimeBasedPolling,
}

impl HybridPolling {
    pub fn new(config: PollingConfig) -> Self {
        Self {
            volume: VolumeBasedPolling::new(config.clone()),
            time: TimeBasedPolling::new(config),
        }
    }

    pub fn interval_at(&self, current: Duration, recent_counts: &[u64], hour: u32) -> Duration {
        let by_volume = self.volume.next_interval(current, recent_counts);
        let by_time = self.time.interval_at(hour);

        match self.time.period_at(hour) {
            DayPeriod::Business => by_volume.min(by_time),
            DayPeriod::Evening | DayPeriod::Night => by_volume.max(by_time),
        }
    }
}

impl PollingStrategy for HybridPolling {
    fn next_interval(&self, current: Duration, recent_counts: &[u64]) -> Duration {
        self.interval_at(current, recent_counts, Local::now().hour())
    }

    fn initial_interval(&self) -> Duration {
        self.volume.initial_interval()
    }

    fn name(&self) -> &'static str {
        "hybrid"
    }
}
