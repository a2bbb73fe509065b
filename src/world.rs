//! Entity-store bookkeeping and serializable world views.
//!
//! Combatants live in the ECS world under entity slots, but every
//! caller outside this crate refers to them by `CombatantId`. The
//! `CombatantIndex` resource is the bridge: it allocates ids and maps
//! each one to its entity slot for exactly as long as the combatant
//! exists. Snapshot types give hosts a serializable view of the battle
//! without touching the ECS directly.

use bevy_ecs::prelude::*;
use glam::Vec3;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::components::*;
use crate::systems::scheduler::SimClock;

/// Id allocator and id-to-entity map.
///
/// Ids start at 1 and are never reused while the allocator lives, so a
/// stale id held by a host can never silently alias a newer combatant.
#[derive(Resource, Debug, Default)]
pub struct CombatantIndex {
    entities: HashMap<CombatantId, Entity>,
    next_id: u32,
}

impl CombatantIndex {
    pub fn allocate(&mut self) -> CombatantId {
        self.next_id += 1;
        CombatantId(self.next_id)
    }

    pub fn bind(&mut self, id: CombatantId, entity: Entity) {
        self.entities.insert(id, entity);
    }

    pub fn unbind(&mut self, id: CombatantId) -> Option<Entity> {
        self.entities.remove(&id)
    }

    pub fn entity(&self, id: CombatantId) -> Option<Entity> {
        self.entities.get(&id).copied()
    }

    pub fn contains(&self, id: CombatantId) -> bool {
        self.entities.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = CombatantId> + '_ {
        self.entities.keys().copied()
    }
}

/// Battle-lifetime kill/death counters per faction. Kept as a resource
/// rather than summed from `CombatRecord` so corpse cleanup never
/// erases history.
#[derive(Resource, Debug, Clone, Copy, Default, Serialize)]
pub struct Tally {
    pub kills_allied: u64,
    pub kills_opfor: u64,
    pub deaths_allied: u64,
    pub deaths_opfor: u64,
}

impl Tally {
    pub fn record_kill(&mut self, by: Faction) {
        match by {
            Faction::Allied => self.kills_allied += 1,
            Faction::Opfor => self.kills_opfor += 1,
        }
    }

    pub fn record_death(&mut self, of: Faction) {
        match of {
            Faction::Allied => self.deaths_allied += 1,
            Faction::Opfor => self.deaths_opfor += 1,
        }
    }

    pub fn kills(&self) -> u64 {
        self.kills_allied + self.kills_opfor
    }

    pub fn deaths(&self) -> u64 {
        self.deaths_allied + self.deaths_opfor
    }
}

/// Population and casualty summary. `total` counts combatants whose
/// state is not dead; corpses awaiting cleanup are excluded.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CombatStats {
    pub allied: u32,
    pub opfor: u32,
    pub total: u32,
    pub kills: u64,
    pub deaths: u64,
}

impl CombatStats {
    pub fn from_world(world: &mut World) -> Self {
        let tally = *world.resource::<Tally>();
        let mut stats = CombatStats {
            kills: tally.kills(),
            deaths: tally.deaths(),
            ..Default::default()
        };
        let mut query = world.query::<(&Faction, &BehaviorState)>();
        for (faction, state) in query.iter(world) {
            if state.is_dead() {
                continue;
            }
            match faction {
                Faction::Allied => stats.allied += 1,
                Faction::Opfor => stats.opfor += 1,
            }
        }
        stats.total = stats.allied + stats.opfor;
        stats
    }
}

/// Spawn request handed in by a strategic layer when an agent crosses
/// into simulated range. `position.y` is advisory; the combatant is
/// grounded to terrain height on entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub faction: Faction,
    pub position: Vec3,
    pub health: f32,
    pub squad: Option<SquadId>,
}

/// Exit state handed back when an agent leaves simulated range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub position: Vec3,
    pub health: f32,
    pub alive: bool,
}

/// One combatant's externally visible state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CombatantRow {
    pub id: u32,
    pub faction: Faction,
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub vx: f32,
    pub vy: f32,
    pub vz: f32,
    pub yaw: f32,
    pub health: f32,
    pub health_max: f32,
    pub state: BehaviorState,
    pub tier: LodTier,
    pub squad: Option<u32>,
    pub suppression: f32,
    pub panic: f32,
    pub kills: u32,
}

/// Complete per-frame view of the battle for host consumption.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub frame: u64,
    /// Elapsed sim time in seconds.
    pub time: f64,
    pub combatants: Vec<CombatantRow>,
}

impl Snapshot {
    /// Capture every combatant, living and fallen, sorted by id so
    /// output is stable regardless of ECS iteration order.
    pub fn from_world(world: &mut World) -> Self {
        let clock = *world.resource::<SimClock>();
        let mut combatants = Vec::new();

        let mut query = world.query::<(
            &CombatantId,
            &Faction,
            &Position,
            &Velocity,
            &Orientation,
            &Health,
            &BehaviorState,
            &LodTier,
            &Nerves,
            &CombatRecord,
            Option<&SquadLink>,
        )>();
        for (id, faction, pos, vel, ori, health, state, tier, nerves, record, link) in
            query.iter(world)
        {
            combatants.push(CombatantRow {
                id: id.0,
                faction: *faction,
                x: pos.0.x,
                y: pos.0.y,
                z: pos.0.z,
                vx: vel.0.x,
                vy: vel.0.y,
                vz: vel.0.z,
                yaw: ori.yaw,
                health: health.current,
                health_max: health.max,
                state: *state,
                tier: *tier,
                squad: link.map(|l| l.squad.0),
                suppression: nerves.suppression,
                panic: nerves.panic,
                kills: record.kills,
            });
        }
        combatants.sort_by_key(|row| row.id);

        Self {
            frame: clock.frame,
            time: clock.now,
            combatants,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
