//! Batch planning: accelerator memory → batch ratio.
//!
//! The ratio approximates how many pages' worth of activation memory fit
//! next to the model weights. The thresholds are empirical safety margins,
//! so they live in [`BatchThresholds`] and can be tuned per deployment.
//!
//! | capacity (GB) | eligible | ratio |
//! |---------------|----------|-------|
//! | < 8           | no       | 1     |
//! | 8 ≤ c < 10    | yes      | 2     |
//! | 10 ≤ c < 16   | yes      | 4     |
//! | ≥ 16          | yes      | 8     |

use serde::{Deserialize, Serialize};
use tracing::info;

/// Capacity floors (GB) for each batch tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchThresholds {
    /// Below this, batching is disabled.
    pub min_gb: u32,
    /// At or above this, ratio 4.
    pub mid_gb: u32,
    /// At or above this, ratio 8.
    pub high_gb: u32,
}

impl Default for BatchThresholds {
    fn default() -> Self {
        Self {
            min_gb: 8,
            mid_gb: 10,
            high_gb: 16,
        }
    }
}

impl BatchThresholds {
    /// `true` when the floors are strictly increasing.
    pub fn is_monotonic(&self) -> bool {
        self.min_gb < self.mid_gb && self.mid_gb < self.high_gb
    }
}

/// Whether to batch, and by how much.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchPlan {
    pub eligible: bool,
    /// One of 1, 2, 4, 8. Always 1 when `eligible` is false.
    pub ratio: usize,
}

impl BatchPlan {
    /// Single-page inference.
    pub const SINGLE: BatchPlan = BatchPlan {
        eligible: false,
        ratio: 1,
    };
}

impl Default for BatchPlan {
    fn default() -> Self {
        Self::SINGLE
    }
}

/// Map a capacity onto a batch plan.
///
/// Without an accelerator the plan is always [`BatchPlan::SINGLE`].
pub fn plan(capacity_gb: u32, has_accelerator: bool, thresholds: &BatchThresholds) -> BatchPlan {
    if !has_accelerator || capacity_gb < thresholds.min_gb {
        return BatchPlan::SINGLE;
    }

    let ratio = if capacity_gb >= thresholds.high_gb {
        8
    } else if capacity_gb >= thresholds.mid_gb {
        4
    } else {
        2
    };

    info!("Accelerator memory: {} GB, batch_ratio: {}", capacity_gb, ratio);
    BatchPlan {
        eligible: true,
        ratio,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(c: u32) -> BatchPlan {
        plan(c, true, &BatchThresholds::default())
    }

    #[test]
    fn decision_table() {
        assert_eq!(p(0), BatchPlan::SINGLE);
        assert_eq!(p(7), BatchPlan::SINGLE);
        assert_eq!(p(8), BatchPlan { eligible: true, ratio: 2 });
        assert_eq!(p(9), BatchPlan { eligible: true, ratio: 2 });
        assert_eq!(p(10), BatchPlan { eligible: true, ratio: 4 });
        assert_eq!(p(15), BatchPlan { eligible: true, ratio: 4 });
        assert_eq!(p(16), BatchPlan { eligible: true, ratio: 8 });
        assert_eq!(p(80), BatchPlan { eligible: true, ratio: 8 });
    }

    #[test]
    fn ratio_is_monotonic_and_one_when_ineligible() {
        let mut prev = 0;
        for c in 0..=64 {
            let plan = p(c);
            assert!(plan.ratio >= prev, "ratio dropped at {c} GB");
            if !plan.eligible {
                assert_eq!(plan.ratio, 1);
            }
            assert!([1, 2, 4, 8].contains(&plan.ratio));
            prev = plan.ratio;
        }
    }

    #[test]
    fn no_accelerator_never_batches() {
        for c in [0, 8, 16, 128] {
            assert_eq!(plan(c, false, &BatchThresholds::default()), BatchPlan::SINGLE);
        }
    }

    #[test]
    fn custom_thresholds() {
        let t = BatchThresholds {
            min_gb: 4,
            mid_gb: 6,
            high_gb: 12,
        };
        assert!(t.is_monotonic());
        assert_eq!(plan(5, true, &t).ratio, 2);
        assert_eq!(plan(6, true, &t).ratio, 4);
        assert_eq!(plan(12, true, &t).ratio, 8);
    }
}
