//! LOD scheduling: which combatants get a full step this frame.
//!
//! Tier assignment is a pure function of distance to the player, so
//! two combatants at equal range always land in the same tier within a
//! frame. Each tier carries a minimum re-update interval; a combatant
//! steps only when `now >= last_update + interval`. The whole thing is
//! FPS-adaptive: an EMA of frame time widens the medium/low intervals
//! under sustained overload and relaxes them back as the frame
//! recovers. Culled combatants never step; they hold position.
//!
//! ## Parallelism Notes
//! - `lod_schedule_system` writes LodTier/UpdateClock and the frame
//!   report; nothing else writes those during the scheduling phase.

use bevy_ecs::prelude::*;
use glam::Vec3;
use std::collections::HashSet;

use crate::components::{BehaviorState, CombatantId, LodTier, Position, UpdateClock};
use crate::config::SimConfig;

/// Absolute simulation clock, advanced once per frame by the
/// orchestrator before any schedule runs.
#[derive(Resource, Debug, Clone, Copy, Default)]
pub struct SimClock {
    /// Accumulated sim seconds.
    pub now: f64,
    pub frame: u64,
}

impl SimClock {
    pub fn advance(&mut self, dt: f32) {
        self.now += dt as f64;
        self.frame = self.frame.wrapping_add(1);
    }
}

/// Player position fed in by the host every frame; the LOD reference
/// point and the anchor for spawn rings.
#[derive(Resource, Debug, Clone, Copy, Default)]
pub struct PlayerPosition(pub Vec3);

/// Frame-time pressure tracker. `load_factor` multiplies the medium
/// and low tier intervals, trading update freshness for frame time.
#[derive(Resource, Debug, Clone, Copy, Default)]
pub struct FrameLoad {
    /// EMA of raw (unclamped) frame time, seconds.
    pub ema_frame_time: f32,
    /// 1.0 under target, up to `max_load_factor` under overload.
    pub load_factor: f32,
}

impl FrameLoad {
    pub fn observe(&mut self, frame_dt: f32, config: &SimConfig) {
        if self.ema_frame_time <= 0.0 {
            self.ema_frame_time = frame_dt;
        } else {
            let a = config.frame_ema_alpha.clamp(0.0, 1.0);
            self.ema_frame_time = self.ema_frame_time * (1.0 - a) + frame_dt * a;
        }
        self.load_factor = (self.ema_frame_time / config.target_frame_time)
            .clamp(1.0, config.max_load_factor);
    }
}

/// What the scheduler decided this frame: tier counts, the ids that
/// received a full step (the secondary-sync dedup reads this), and
/// pacing stats for telemetry.
#[derive(Resource, Debug, Clone, Default)]
pub struct LodReport {
    pub frame: u64,
    pub high: u32,
    pub medium: u32,
    pub low: u32,
    pub culled: u32,
    pub stepped: HashSet<CombatantId>,
    pub ema_frame_time: f32,
    pub load_factor: f32,
}

impl LodReport {
    fn begin_frame(&mut self, frame: u64, load: &FrameLoad) {
        self.frame = frame;
        self.high = 0;
        self.medium = 0;
        self.low = 0;
        self.culled = 0;
        self.stepped.clear();
        self.ema_frame_time = load.ema_frame_time;
        self.load_factor = load.load_factor;
    }

    pub fn live_total(&self) -> u32 {
        self.high + self.medium + self.low + self.culled
    }

    /// Counts-only view for telemetry; the stepped set stays internal.
    pub fn summary(&self) -> LodSummary {
        LodSummary {
            frame: self.frame,
            high: self.high,
            medium: self.medium,
            low: self.low,
            culled: self.culled,
            stepped: self.stepped.len() as u32,
            ema_frame_time: self.ema_frame_time,
            load_factor: self.load_factor,
        }
    }
}

/// Serializable slice of [`LodReport`].
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct LodSummary {
    pub frame: u64,
    pub high: u32,
    pub medium: u32,
    pub low: u32,
    pub culled: u32,
    pub stepped: u32,
    pub ema_frame_time: f32,
    pub load_factor: f32,
}

/// Pure tier mapping. Thresholds compare straight distance, so equal
/// distance means equal tier, always.
pub fn tier_for_distance(distance: f32, config: &SimConfig) -> LodTier {
    if distance <= config.lod_high_distance {
        LodTier::High
    } else if distance <= config.lod_medium_distance {
        LodTier::Medium
    } else if distance <= config.lod_low_distance {
        LodTier::Low
    } else {
        LodTier::Culled
    }
}

/// Effective minimum interval for a tier under the given load factor.
/// High stays per-frame so nearby fights never stutter; culled never
/// steps at all.
pub fn tier_interval(tier: LodTier, config: &SimConfig, load_factor: f32) -> f32 {
    match tier {
        LodTier::High => 0.0,
        LodTier::Medium => config.interval_medium * load_factor,
        LodTier::Low => config.interval_low * load_factor,
        LodTier::Culled => f32::INFINITY,
    }
}

/// Assigns tiers and grants full steps.
///
/// ## Data Access
/// - Reads: Position, BehaviorState, SimConfig, SimClock,
///   PlayerPosition, FrameLoad
/// - Writes: LodTier, UpdateClock, LodReport
pub fn lod_schedule_system(
    config: Res<SimConfig>,
    clock: Res<SimClock>,
    player: Res<PlayerPosition>,
    load: Res<FrameLoad>,
    mut report: ResMut<LodReport>,
    mut query: Query<(
        &CombatantId,
        &Position,
        &BehaviorState,
        &mut LodTier,
        &mut UpdateClock,
    )>,
) {
    report.begin_frame(clock.frame, &load);

    for (id, pos, state, mut tier, mut uc) in query.iter_mut() {
        if state.is_dead() {
            uc.due = false;
            continue;
        }

        let distance = pos.0.distance(player.0);
        let next = tier_for_distance(distance, &config);
        if *tier != next {
            *tier = next;
        }
        match next {
            LodTier::High => report.high += 1,
            LodTier::Medium => report.medium += 1,
            LodTier::Low => report.low += 1,
            LodTier::Culled => report.culled += 1,
        }

        let interval = tier_interval(next, &config, load.load_factor);
        if interval.is_finite() && clock.now >= uc.last_update + interval as f64 {
            let gap = (clock.now - uc.last_update) as f32;
            uc.step_dt = gap.min(config.max_step_gap);
            uc.last_update = clock.now;
            uc.due = true;
            uc.priority = 1.0 / (1.0 + distance);
            report.stepped.insert(*id);
        } else {
            uc.due = false;
        }
    }
}
