//! Per-request decision threshold from ambient brightness and the user's
//! recent confidence history.

use crate::history::{HistoryStore, RollingStats};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    pub normal: f32,
    pub low_light: f32,
    pub very_low_light: f32,
    /// Brightness below this uses `very_low_light`.
    pub very_low_light_below: f32,
    /// Brightness below this uses `low_light`.
    pub low_light_below: f32,
    /// Brightness from this up is reported as bright light.
    pub bright_light_from: f32,
    /// Attempts required before history adjusts the threshold.
    pub min_history: u64,
    pub high_average: f32,
    pub low_average: f32,
    pub step: f32,
    pub floor: f32,
    pub ceiling: f32,
    /// Weight of the newest sample in the rolling average.
    pub smoothing: f32,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            normal: 0.8,
            low_light: 0.7,
            very_low_light: 0.6,
            very_low_light_below: 50.0,
            low_light_below: 100.0,
            bright_light_from: 180.0,
            min_history: 4,
            high_average: 0.9,
            low_average: 0.7,
            step: 0.05,
            floor: 0.5,
            ceiling: 0.95,
            smoothing: 0.2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LightingCondition {
    VeryLowLight,
    LowLight,
    NormalLight,
    BrightLight,
}

pub struct AdaptiveThresholdPolicy {
    config: ThresholdConfig,
    history: HistoryStore,
}

impl AdaptiveThresholdPolicy {
    pub fn new(config: ThresholdConfig) -> Self {
        let history = HistoryStore::new(config.smoothing);
        Self { config, history }
    }

    pub fn config(&self) -> &ThresholdConfig {
        &self.config
    }

    /// Threshold from brightness alone.
    pub fn base_threshold(&self, brightness: f32) -> f32 {
        if brightness < self.config.very_low_light_below {
            self.config.very_low_light
        } else if brightness < self.config.low_light_below {
            self.config.low_light
        } else {
            self.config.normal
        }
    }

    /// Threshold for a request at `brightness` by `user`, history applied.
    pub fn threshold_for(&self, brightness: f32, user: Option<&str>) -> f32 {
        let base = self.base_threshold(brightness);
        match user.and_then(|u| self.history.get(u)) {
            Some(stats) => self.adjust(base, stats),
            None => base,
        }
    }

    fn adjust(&self, base: f32, stats: RollingStats) -> f32 {
        if stats.attempts < self.config.min_history {
            return base;
        }
        if stats.average > self.config.high_average {
            (base - self.config.step).max(self.config.floor)
        } else if stats.average < self.config.low_average {
            (base + self.config.step).min(self.config.ceiling)
        } else {
            base
        }
    }

    pub fn record_attempt(&self, user: &str, confidence: f32) -> RollingStats {
        self.history.record(user, confidence)
    }

    pub fn history(&self, user: &str) -> Option<RollingStats> {
        self.history.get(user)
    }

    pub fn reset(&self, user: &str) -> bool {
        self.history.reset(user)
    }

    pub fn reset_all(&self) {
        self.history.clear();
    }

    /// Lighting band for `brightness`, using the same edges as the threshold.
    pub fn lighting_condition(&self, brightness: f32) -> LightingCondition {
        if brightness < self.config.very_low_light_below {
            LightingCondition::VeryLowLight
        } else if brightness < self.config.low_light_below {
            LightingCondition::LowLight
        } else if brightness < self.config.bright_light_from {
            LightingCondition::NormalLight
        } else {
            LightingCondition::BrightLight
        }
    }
}
