//! Simulation tuning, resolved once at startup.
//!
//! Every policy decision the hot loop consults (sync behavior, budget
//! caps, tier pacing) is read from this resource, never from globals
//! or environment lookups mid-frame.

use bevy_ecs::prelude::*;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// Master configuration handed to `SimWorld::with_config`.
#[derive(Resource, Debug, Clone, Serialize, Deserialize)]
pub struct SimConfig {
    /// Largest delta-time fed into one step, seconds. Stalls integrate
    /// as this instead of exploding.
    pub max_delta_time: f32,

    /// World half-extent shared by both spatial indices.
    pub world_half_extent: f32,
    /// Entries a leaf holds before subdividing.
    pub octree_leaf_cap: usize,
    /// Depth at which leaves stop splitting and absorb overflow.
    pub octree_max_depth: u32,

    /// Tier thresholds, distance to the player in world units.
    pub lod_high_distance: f32,
    pub lod_medium_distance: f32,
    pub lod_low_distance: f32,
    /// Minimum seconds between full steps per tier. High runs every
    /// frame; culled combatants never step, they only hold position.
    pub interval_medium: f32,
    pub interval_low: f32,
    /// Ceiling on the elapsed time one deferred step may integrate,
    /// so a combatant returning from a long cull does not teleport.
    pub max_step_gap: f32,
    /// Frame-time EMA smoothing factor.
    pub frame_ema_alpha: f32,
    /// Frame time the adaptive scheduler steers toward, seconds.
    pub target_frame_time: f32,
    /// Ceiling on the interval-widening load factor.
    pub max_load_factor: f32,

    /// Per-frame admission caps for the two raycast budgets.
    pub perception_rays_per_frame: u32,
    pub fire_rays_per_frame: u32,

    /// Push positions into the shared hit cache after the step.
    pub sync_hit_cache: bool,
    /// Skip ids the scheduled step already wrote this frame.
    pub dedup_hit_cache_sync: bool,

    /// Autonomous population control; off when a strategic layer
    /// drives population through the bridge instead.
    pub autonomous_spawning: bool,
    pub population_target: u32,
    pub wave_size: u32,
    pub wave_interval: f32,
    pub respawn_delay: f32,

    /// Health ceiling applied to spawned and materialized combatants.
    pub max_health: f32,
    /// Seconds between squad objective reassignments.
    pub objective_interval: f32,

    /// Sandbox mode: contain frame failures but never raise the
    /// fatal notice.
    pub headless: bool,
    /// Seed for the simulation RNG; equal seeds replay equal battles.
    pub seed: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            max_delta_time: 0.1,
            world_half_extent: 2000.0,
            octree_leaf_cap: 12,
            octree_max_depth: 6,
            lod_high_distance: 60.0,
            lod_medium_distance: 150.0,
            lod_low_distance: 300.0,
            interval_medium: 0.15,
            interval_low: 0.45,
            max_step_gap: 3.0,
            frame_ema_alpha: 0.1,
            target_frame_time: 1.0 / 60.0,
            max_load_factor: 3.0,
            perception_rays_per_frame: 48,
            fire_rays_per_frame: 32,
            sync_hit_cache: true,
            dedup_hit_cache_sync: true,
            autonomous_spawning: true,
            population_target: 120,
            wave_size: 8,
            wave_interval: 6.0,
            respawn_delay: 12.0,
            max_health: 100.0,
            objective_interval: 5.0,
            headless: false,
            seed: 0x5EED_CAFE,
        }
    }
}

/// Deterministic simulation RNG, seeded from `SimConfig::seed`.
#[derive(Resource, Debug, Clone)]
pub struct SimRng(pub ChaCha8Rng);

impl SimRng {
    pub fn from_config(config: &SimConfig) -> Self {
        use rand::SeedableRng;
        Self(ChaCha8Rng::seed_from_u64(config.seed))
    }
}
