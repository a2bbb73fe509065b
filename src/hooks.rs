//! Collaborator seams between the simulation core and its host.
//!
//! Everything the core consumes from outside (terrain height, game
//! state, zone influence, effect/audio/HUD sinks) enters through one
//! of these traits. Every trait ships a no-op default, so a bare
//! `Hooks::default()` runs the sim standalone and an absent
//! collaborator is a guaranteed silent no-op rather than a runtime
//! check.

use bevy_ecs::prelude::*;
use glam::Vec3;
use std::sync::Arc;

use crate::components::{CombatantId, Faction};

/// Terrain height provider. Grounding and movement clamping call this;
/// the core never sees terrain data beyond the sampled height.
pub trait HeightSource: Send + Sync {
    fn height_at(&self, x: f32, z: f32) -> f32;
}

/// Flat ground at sea level.
#[derive(Debug, Default)]
pub struct FlatGround;

impl HeightSource for FlatGround {
    fn height_at(&self, _x: f32, _z: f32) -> f32 {
        0.0
    }
}

/// Host game state. When inactive, AI and combat decisioning stop
/// while movement and visual holds continue.
pub trait GameStateGate: Send + Sync {
    fn is_game_active(&self) -> bool {
        true
    }
}

/// Default gate: the sim is always live.
#[derive(Debug, Default)]
pub struct AlwaysActive;

impl GameStateGate for AlwaysActive {}

/// A capture point or influence marker the squad manager steers
/// objectives toward.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Zone {
    pub position: Vec3,
    /// Relative importance; higher pulls more squads.
    pub priority: f32,
    /// Current controller, if any.
    pub owner: Option<Faction>,
}

/// Zone/influence input, polled on the objective interval.
pub trait ZoneSource: Send + Sync {
    fn zones(&self) -> Vec<Zone> {
        Vec::new()
    }
}

/// Default source: an empty map; squads hold position.
#[derive(Debug, Default)]
pub struct NoZones;

impl ZoneSource for NoZones {}

/// Fire-and-forget visual/audio effect spawns. No return values are
/// consumed; implementations must tolerate being called every frame.
pub trait EffectSink: Send + Sync {
    fn tracer(&self, _from: Vec3, _to: Vec3) {}
    fn muzzle_flash(&self, _at: Vec3) {}
    fn impact(&self, _at: Vec3) {}
    fn explosion(&self, _at: Vec3, _radius: f32) {}
    fn explosion_audio(&self, _at: Vec3) {}
}

/// Default sink: effects vanish.
#[derive(Debug, Default)]
pub struct SilentEffects;

impl EffectSink for SilentEffects {}

/// Kill/damage notifications for a host HUD.
pub trait HudSink: Send + Sync {
    fn combatant_killed(&self, _victim: CombatantId, _attacker: Option<CombatantId>) {}
    fn damage_dealt(&self, _target: CombatantId, _amount: f32) {}
}

#[derive(Debug, Default)]
pub struct NoHud;

impl HudSink for NoHud {}

/// Escalation target for the crash-containment policy. Called at most
/// once per run, and never in headless mode.
pub trait FatalSink: Send + Sync {
    fn fatal(&self, _message: &str) {}
}

#[derive(Debug, Default)]
pub struct NoFatal;

impl FatalSink for NoFatal {}

/// The full collaborator bundle, stored as a resource so systems can
/// reach the seams without globals.
#[derive(Resource, Clone)]
pub struct Hooks {
    pub terrain: Arc<dyn HeightSource>,
    pub gate: Arc<dyn GameStateGate>,
    pub zones: Arc<dyn ZoneSource>,
    pub effects: Arc<dyn EffectSink>,
    pub hud: Arc<dyn HudSink>,
    pub fatal: Arc<dyn FatalSink>,
}

impl Default for Hooks {
    fn default() -> Self {
        Self {
            terrain: Arc::new(FlatGround),
            gate: Arc::new(AlwaysActive),
            zones: Arc::new(NoZones),
            effects: Arc::new(SilentEffects),
            hud: Arc::new(NoHud),
            fatal: Arc::new(NoFatal),
        }
    }
}

impl Hooks {
    pub fn with_terrain(mut self, terrain: Arc<dyn HeightSource>) -> Self {
        self.terrain = terrain;
        self
    }

    pub fn with_gate(mut self, gate: Arc<dyn GameStateGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_zones(mut self, zones: Arc<dyn ZoneSource>) -> Self {
        self.zones = zones;
        self
    }

    pub fn with_effects(mut self, effects: Arc<dyn EffectSink>) -> Self {
        self.effects = effects;
        self
    }

    pub fn with_hud(mut self, hud: Arc<dyn HudSink>) -> Self {
        self.hud = hud;
        self
    }

    pub fn with_fatal(mut self, fatal: Arc<dyn FatalSink>) -> Self {
        self.fatal = fatal;
        self
    }
}
