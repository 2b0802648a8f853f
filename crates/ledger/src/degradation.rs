//! Degradation levels under budget pressure, with hysteresis.

use serde::{Deserialize, Serialize};

/// Fallback execution policy activated as spend approaches the allocation.
///
/// Ordered by severity; the scheduler consults the current level before
/// every dispatch.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum DegradationLevel {
    /// Normal operation
    None,
    /// Executors should prefer cheaper models
    CheaperModel,
    /// At most one dispatch per org per scheduling pass
    ReducedFrequency,
    /// No dispatch at all; tasks stay queued
    QueueOnly,
}

impl std::fmt::Display for DegradationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::CheaperModel => "cheaper-model",
            Self::ReducedFrequency => "reduced-frequency",
            Self::QueueOnly => "queue-only",
        };
        write!(f, "{name}")
    }
}

impl DegradationLevel {
    fn step_down(self) -> Self {
        match self {
            Self::QueueOnly => Self::ReducedFrequency,
            Self::ReducedFrequency => Self::CheaperModel,
            Self::CheaperModel | Self::None => Self::None,
        }
    }
}

/// A raise/clear threshold pair for one degradation level.
///
/// The level is raised once the spend ratio reaches `high` and clears only
/// once the ratio falls below `low`, so a ratio hovering around a single
/// threshold cannot flap the level.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Watermark {
    /// Spend ratio at which the level engages
    pub high: f64,
    /// Spend ratio below which the level clears
    pub low: f64,
}

/// Watermarks for all three degradation levels.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DegradationThresholds {
    /// Thresholds for `CheaperModel`
    pub cheaper_model: Watermark,
    /// Thresholds for `ReducedFrequency`
    pub reduced_frequency: Watermark,
    /// Thresholds for `QueueOnly`
    pub queue_only: Watermark,
}

impl Default for DegradationThresholds {
    fn default() -> Self {
        Self {
            cheaper_model: Watermark { high: 0.80, low: 0.70 },
            reduced_frequency: Watermark { high: 0.90, low: 0.80 },
            queue_only: Watermark { high: 0.95, low: 0.85 },
        }
    }
}

impl DegradationThresholds {
    fn watermark(&self, level: DegradationLevel) -> Option<Watermark> {
        match level {
            DegradationLevel::None => None,
            DegradationLevel::CheaperModel => Some(self.cheaper_model),
            DegradationLevel::ReducedFrequency => Some(self.reduced_frequency),
            DegradationLevel::QueueOnly => Some(self.queue_only),
        }
    }

    /// Compute the level that follows `current` at the given spend ratio.
    pub(crate) fn next_level(
        &self,
        current: DegradationLevel,
        ratio: f64,
    ) -> DegradationLevel {
        // Highest level whose raise threshold the ratio has crossed.
        let mut target = DegradationLevel::None;
        for level in [
            DegradationLevel::CheaperModel,
            DegradationLevel::ReducedFrequency,
            DegradationLevel::QueueOnly,
        ] {
            if self.watermark(level).map(|w| ratio >= w.high).unwrap_or(false) {
                target = level;
            }
        }
        if target > current {
            return target;
        }

        // Hysteresis: step down only while below the low water of the level
        // currently held.
        let mut held = current;
        while let Some(watermark) = self.watermark(held) {
            if ratio < watermark.low {
                held = held.step_down();
            } else {
                break;
            }
        }
        held.max(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use DegradationLevel::*;

    #[test]
    fn test_level_raises_at_high_water() {
        let t = DegradationThresholds::default();
        assert_eq!(t.next_level(None, 0.79), None);
        assert_eq!(t.next_level(None, 0.80), CheaperModel);
        assert_eq!(t.next_level(None, 0.90), ReducedFrequency);
        assert_eq!(t.next_level(None, 0.97), QueueOnly);
    }

    #[test]
    fn test_level_holds_between_watermarks() {
        let t = DegradationThresholds::default();
        // Raised at 0.80, a dip to 0.75 does not clear it.
        assert_eq!(t.next_level(CheaperModel, 0.75), CheaperModel);
        // Only below the low water does it clear.
        assert_eq!(t.next_level(CheaperModel, 0.69), None);
    }

    #[test]
    fn test_no_single_sample_flapping() {
        let t = DegradationThresholds::default();
        let mut level = None;
        // Hover right around the raise threshold.
        for ratio in [0.80, 0.79, 0.80, 0.78, 0.79] {
            level = t.next_level(level, ratio);
            assert_eq!(level, CheaperModel);
        }
    }

    #[test]
    fn test_step_down_is_gradual() {
        let t = DegradationThresholds::default();
        // From QueueOnly, a ratio of 0.82 clears only down to
        // ReducedFrequency (its low water is 0.80).
        assert_eq!(t.next_level(QueueOnly, 0.82), ReducedFrequency);
        // A collapse in ratio clears everything.
        assert_eq!(t.next_level(QueueOnly, 0.10), None);
    }
}
