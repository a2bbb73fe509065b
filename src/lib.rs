//! Frontline - Simulation Core
//!
//! A combatant simulation and spatial scheduling engine built on
//! `bevy_ecs`. Hosts drive it one frame at a time through [`SimWorld`]
//! and reach it through id-keyed commands, snapshots and telemetry;
//! rendering, input and game rules stay behind the seams declared in
//! [`hooks`].

pub mod api;
pub mod budget;
pub mod components;
pub mod config;
pub mod hitcache;
pub mod hooks;
pub mod profiler;
pub mod spatial;
pub mod systems;
pub mod world;

pub use api::{SimWorld, Telemetry};
pub use components::*;
pub use config::SimConfig;
pub use hitcache::{HitCache, HitCacheStats, RayHit};
pub use hooks::Hooks;
pub use spatial::{CombatOctree, OctreeEntry, OctreeStats};
pub use systems::*;
pub use world::{AgentDescriptor, AgentSnapshot, CombatStats, Snapshot};
