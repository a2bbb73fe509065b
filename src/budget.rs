//! Per-frame raycast admission control.
//!
//! Line-of-sight and hit-scan work is the only unbounded cost in a
//! frame, so each consumer draws from a fixed budget instead. Denied
//! casts are skipped for the tick and show up in telemetry, keeping
//! frame time flat while combatant count grows.

use bevy_ecs::prelude::*;
use serde::Serialize;

use crate::config::SimConfig;

/// One admission counter. `try_consume` either grants a cast or
/// records the denial; `reset` runs once per frame.
#[derive(Debug, Clone)]
pub struct RayBudget {
    max_per_frame: u32,
    remaining: u32,
    requested: u64,
    denied: u64,
    exhausted_frames: u64,
    consumed_this_frame: u32,
    consumed_last_frame: u32,
}

/// Telemetry snapshot of a single budget.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct BudgetStats {
    pub max_per_frame: u32,
    pub requested: u64,
    pub denied: u64,
    pub exhausted_frames: u64,
    /// denied / requested over the whole run.
    pub denial_rate: f64,
    /// consumed / max for the most recently completed frame.
    pub last_frame_saturation: f32,
}

impl RayBudget {
    pub fn new(max_per_frame: u32) -> Self {
        let max = max_per_frame.max(1);
        Self {
            max_per_frame: max,
            remaining: max,
            requested: 0,
            denied: 0,
            exhausted_frames: 0,
            consumed_this_frame: 0,
            consumed_last_frame: 0,
        }
    }

    /// Ask for one cast. Grants decrement the remaining budget;
    /// refusals only touch the counters.
    pub fn try_consume(&mut self) -> bool {
        self.requested += 1;
        if self.remaining > 0 {
            self.remaining -= 1;
            self.consumed_this_frame += 1;
            true
        } else {
            self.denied += 1;
            false
        }
    }

    /// Restore the budget for a new frame. A frame that drained the
    /// budget to zero counts as exhausted whether or not anything was
    /// actually denied.
    pub fn reset(&mut self) {
        if self.remaining == 0 {
            self.exhausted_frames += 1;
        }
        self.consumed_last_frame = self.consumed_this_frame;
        self.consumed_this_frame = 0;
        self.remaining = self.max_per_frame;
    }

    /// Reconfigure capacity; takes effect immediately, floor of 1.
    pub fn set_max(&mut self, max_per_frame: u32) {
        self.max_per_frame = max_per_frame.max(1);
        self.remaining = self.remaining.min(self.max_per_frame);
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub fn stats(&self) -> BudgetStats {
        BudgetStats {
            max_per_frame: self.max_per_frame,
            requested: self.requested,
            denied: self.denied,
            exhausted_frames: self.exhausted_frames,
            denial_rate: if self.requested == 0 {
                0.0
            } else {
                self.denied as f64 / self.requested as f64
            },
            last_frame_saturation: self.consumed_last_frame as f32 / self.max_per_frame as f32,
        }
    }
}

/// The two independent budgets: AI perception casts and weapon-fire
/// validation casts. One does not starve the other.
#[derive(Resource, Debug, Clone)]
pub struct RayBudgets {
    pub perception: RayBudget,
    pub fire: RayBudget,
}

impl RayBudgets {
    pub fn from_config(config: &SimConfig) -> Self {
        Self {
            perception: RayBudget::new(config.perception_rays_per_frame),
            fire: RayBudget::new(config.fire_rays_per_frame),
        }
    }

    /// Frame boundary: restore both budgets.
    pub fn begin_frame(&mut self) {
        self.perception.reset();
        self.fire.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admits_exactly_max_then_denies_until_reset() {
        let mut budget = RayBudget::new(3);
        assert!(budget.try_consume());
        assert!(budget.try_consume());
        assert!(budget.try_consume());
        assert!(!budget.try_consume());
        assert!(!budget.try_consume());

        budget.reset();
        assert!(budget.try_consume());

        let stats = budget.stats();
        assert_eq!(stats.requested, 6);
        assert_eq!(stats.denied, 2);
        assert!((stats.denial_rate - 2.0 / 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_exhausted_frames_counted_on_reset() {
        let mut budget = RayBudget::new(2);
        budget.try_consume();
        budget.reset();
        assert_eq!(budget.stats().exhausted_frames, 0);

        budget.try_consume();
        budget.try_consume();
        budget.reset();
        assert_eq!(budget.stats().exhausted_frames, 1);
        assert_eq!(budget.stats().last_frame_saturation, 1.0);
    }

    #[test]
    fn test_set_max_floors_at_one() {
        let mut budget = RayBudget::new(4);
        budget.set_max(0);
        budget.reset();
        assert!(budget.try_consume());
        assert!(!budget.try_consume());
        assert_eq!(budget.stats().max_per_frame, 1);
    }

    #[test]
    fn test_set_max_clamps_remaining_mid_frame() {
        let mut budget = RayBudget::new(10);
        budget.set_max(2);
        assert!(budget.try_consume());
        assert!(budget.try_consume());
        assert!(!budget.try_consume());
    }

    #[test]
    fn test_budgets_are_independent() {
        let mut budgets = RayBudgets::from_config(&SimConfig {
            perception_rays_per_frame: 1,
            fire_rays_per_frame: 2,
            ..Default::default()
        });
        assert!(budgets.perception.try_consume());
        assert!(!budgets.perception.try_consume());
        assert!(budgets.fire.try_consume());
        assert!(budgets.fire.try_consume());
        assert!(!budgets.fire.try_consume());

        budgets.begin_frame();
        assert!(budgets.perception.try_consume());
        assert!(budgets.fire.try_consume());
    }
}
