//! ECS systems, grouped by pipeline phase.
//!
//! The orchestrator runs the phases in a fixed order each frame; within
//! a phase, systems are chained so writes land before the next reader.
//!
//! **Scheduling** - runs first, decides who steps this frame:
//! - `lod_schedule_system` - distance tiers, adaptive intervals, due flags
//!
//! **Spawning** (exclusive) - population control:
//! - `spawn_phase` - corpse cleanup, reinforcement waves, respawns
//!
//! **Squads** - membership and orders:
//! - `squad_objective_system` - periodic zone scoring per squad
//! - `squad_role_system` - leader succession after casualties
//!
//! **AI** - perception and decisions for due combatants:
//! - `perception_system` - octree candidates, cached or budgeted sight rays
//! - `decision_system` - stress, engagement and orders into movement intent
//! - `nerves_decay_system` - suppression decay over the step span
//!
//! **Movement**:
//! - `steering_system` - intent into velocity
//! - `movement_system` - integration and terrain grounding
//! - `position_hold_system` - culled combatants hold still
//! - `visual_settle_system` - visual yaw eases toward aim yaw
//! - `octree_update_system` (in `spatial`) - chases position changes
//!
//! **Combat**:
//! - `fire_control_system` - cooldowns, budget admission, shot orders
//! - `shot_resolution_system` - ray resolution, parallel when enabled
//! - `damage_apply_system` - damage, suppression, kill attribution
//! - `sweep_deaths` (exclusive) - dead-state bookkeeping and eviction
//!
//! **Telemetry**:
//! - `state_distribution_system` - behavior-state census

pub mod ai;
pub mod combat;
pub mod movement;
pub mod scheduler;
pub mod spawning;
pub mod squads;

pub use ai::*;
pub use combat::*;
pub use movement::*;
pub use scheduler::*;
pub use spawning::*;
pub use squads::*;
