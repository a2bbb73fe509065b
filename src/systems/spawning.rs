//! Population management: waves, respawns and corpse cleanup.
//!
//! Every combatant enters the world through `spawn_combatant`, which
//! grounds the position, binds the id, enrolls a squad and registers
//! both spatial indices in one synchronous step, so a spawn is visible
//! to queries in the frame it happens. The phase entry point tops the
//! battle up toward the population target in waves and works through
//! the respawn queue that combat cleanup feeds.

use bevy_ecs::prelude::*;
use glam::Vec3;
use rand::Rng;
use rand_chacha::ChaCha8Rng;

use crate::components::*;
use crate::config::{SimConfig, SimRng};
use crate::hitcache::HitCache;
use crate::hooks::Hooks;
use crate::spatial::CombatOctree;
use crate::systems::movement::STAND_OFFSET;
use crate::systems::scheduler::SimClock;
use crate::systems::squads::SquadRegistry;
use crate::world::CombatantIndex;

/// Seconds a corpse stays in the entity store before cleanup.
const CORPSE_TTL: f64 = 15.0;
/// Deployment line distance from world center, as a fraction of the
/// half-extent. Allied spawns west, Opfor east.
const DEPLOY_FRACTION: f32 = 0.15;
/// Spawn positions scatter within this radius of the faction anchor.
const SPAWN_SCATTER: f32 = 30.0;

/// A combatant owed to a faction after one of theirs fell.
#[derive(Debug, Clone, Copy)]
pub struct PendingRespawn {
    pub faction: Faction,
    pub due_at: f64,
}

/// Spawn-phase state: the master enable switch, the wave timer and the
/// respawn queue.
#[derive(Resource, Debug, Default)]
pub struct SpawnControl {
    pub enabled: bool,
    pub next_wave_at: f64,
    pub pending: Vec<PendingRespawn>,
}

impl SpawnControl {
    pub fn from_config(config: &SimConfig) -> Self {
        Self {
            enabled: config.autonomous_spawning,
            next_wave_at: 0.0,
            pending: Vec::new(),
        }
    }

    pub fn schedule_respawn(&mut self, faction: Faction, due_at: f64) {
        self.pending.push(PendingRespawn { faction, due_at });
    }
}

/// Where a faction's reinforcements arrive.
pub fn faction_anchor(faction: Faction, half_extent: f32) -> Vec3 {
    let offset = half_extent * DEPLOY_FRACTION;
    match faction {
        Faction::Allied => Vec3::new(-offset, 0.0, 0.0),
        Faction::Opfor => Vec3::new(offset, 0.0, 0.0),
    }
}

fn scatter(rng: &mut ChaCha8Rng, anchor: Vec3) -> (f32, f32) {
    let angle = rng.gen_range(0.0..std::f32::consts::TAU);
    let radius = rng.gen_range(0.0..SPAWN_SCATTER);
    (anchor.x + angle.sin() * radius, anchor.z + angle.cos() * radius)
}

/// The single spawn path. Grounds the combatant at (`x`, `z`), rolls
/// weapon and temperament, enrolls a squad (preferring `squad` when it
/// exists) and registers the id with the index, the octree and - when
/// sync is on - the hit cache. `health` defaults to the configured
/// maximum and is clamped into `[0, max]`.
pub fn spawn_combatant(
    world: &mut World,
    faction: Faction,
    x: f32,
    z: f32,
    health: Option<f32>,
    squad: Option<SquadId>,
) -> CombatantId {
    let (max_health, sync_cache) = {
        let config = world.resource::<SimConfig>();
        (config.max_health, config.sync_hit_cache)
    };
    let ground = world.resource::<Hooks>().terrain.height_at(x, z);
    let pos = Vec3::new(x, ground + STAND_OFFSET, z);

    let id = world.resource_mut::<CombatantIndex>().allocate();

    let (weapon, skill, heading) = {
        let mut rng = world.resource_mut::<SimRng>();
        let weapon = match rng.0.gen::<f32>() {
            roll if roll < 0.6 => WeaponSpec::rifle(),
            roll if roll < 0.9 => WeaponSpec::carbine(),
            _ => WeaponSpec::marksman(),
        };
        let skill = SkillProfile {
            accuracy: rng.0.gen_range(0.35..0.8),
            reaction: rng.0.gen_range(0.2..0.7),
            aggression: rng.0.gen_range(0.2..0.9),
        };
        let heading = rng.0.gen_range(0.0..std::f32::consts::TAU);
        (weapon, skill, heading)
    };

    let (squad_id, role) = {
        let mut registry = world.resource_mut::<SquadRegistry>();
        if let Some(wanted) = squad {
            registry.ensure(wanted, faction);
        }
        let squad_id = registry.assign(faction, squad);
        let role = registry.enroll(squad_id, id);
        (squad_id, role)
    };

    let bundle = CombatantBundle {
        id,
        faction,
        position: Position(pos),
        orientation: Orientation {
            yaw: heading,
            visual_yaw: heading,
            ..Default::default()
        },
        health: Health::with_current(health.unwrap_or(max_health), max_health),
        weapon,
        skill,
        wander: Wander {
            heading,
            next_turn_at: 0.0,
        },
        ..Default::default()
    };
    let entity = world
        .spawn((
            bundle,
            SquadLink {
                squad: squad_id,
                role,
            },
        ))
        .id();

    world.resource_mut::<CombatantIndex>().bind(id, entity);
    world
        .resource_mut::<CombatOctree>()
        .update_position(id, pos, faction);
    if sync_cache {
        world.resource_mut::<HitCache>().sync_entity(id, pos);
    }
    id
}

/// Spawn-phase entry point, run once per frame while the game is
/// active. Corpse cleanup always runs; waves and respawns only while
/// autonomous spawning is enabled.
pub fn spawn_phase(world: &mut World) {
    let now = world.resource::<SimClock>().now;
    retire_corpses(world, now);

    if !world.resource::<SpawnControl>().enabled {
        return;
    }

    let half_extent = world.resource::<SimConfig>().world_half_extent;
    let mut plan: Vec<(Faction, f32, f32)> = Vec::new();

    // Respawns whose delay elapsed.
    let due: Vec<PendingRespawn> = {
        let mut control = world.resource_mut::<SpawnControl>();
        let (due, waiting): (Vec<_>, Vec<_>) =
            control.pending.drain(..).partition(|r| r.due_at <= now);
        control.pending = waiting;
        due
    };
    if !due.is_empty() {
        log::debug!("respawning {} fallen", due.len());
    }
    {
        let mut rng = world.resource_mut::<SimRng>();
        for respawn in &due {
            let anchor = faction_anchor(respawn.faction, half_extent);
            let (x, z) = scatter(&mut rng.0, anchor);
            plan.push((respawn.faction, x, z));
        }
    }

    // Reinforcement wave toward the population target, split evenly
    // between factions.
    if now >= world.resource::<SpawnControl>().next_wave_at {
        let (target, wave_size, interval) = {
            let config = world.resource::<SimConfig>();
            (
                config.population_target,
                config.wave_size,
                config.wave_interval,
            )
        };
        let mut allied = 0u32;
        let mut opfor = 0u32;
        let mut query = world.query::<(&Faction, &BehaviorState)>();
        for (faction, state) in query.iter(world) {
            if state.is_dead() {
                continue;
            }
            match faction {
                Faction::Allied => allied += 1,
                Faction::Opfor => opfor += 1,
            }
        }

        let per_side = target / 2;
        let mut rng = world.resource_mut::<SimRng>();
        let mut wave = 0u32;
        for (faction, alive) in [(Faction::Allied, allied), (Faction::Opfor, opfor)] {
            let batch = per_side.saturating_sub(alive).min(wave_size);
            wave += batch;
            let anchor = faction_anchor(faction, half_extent);
            for _ in 0..batch {
                let (x, z) = scatter(&mut rng.0, anchor);
                plan.push((faction, x, z));
            }
        }
        drop(rng);
        if wave > 0 {
            log::debug!(
                "wave: {} reinforcements ({} allied / {} opfor alive)",
                wave,
                allied,
                opfor
            );
        }
        world.resource_mut::<SpawnControl>().next_wave_at = now + interval as f64;
    }

    for (faction, x, z) in plan {
        spawn_combatant(world, faction, x, z, None, None);
    }
}

/// Despawns corpses past their cleanup delay and releases their ids.
fn retire_corpses(world: &mut World, now: f64) {
    let mut expired: Vec<(Entity, CombatantId)> = Vec::new();
    let mut query = world.query::<(Entity, &CombatantId, &Fallen)>();
    for (entity, id, fallen) in query.iter(world) {
        if now >= fallen.at + CORPSE_TTL {
            expired.push((entity, *id));
        }
    }
    if !expired.is_empty() {
        log::debug!("retiring {} corpses", expired.len());
    }
    for (entity, id) in expired {
        world.resource_mut::<CombatantIndex>().unbind(id);
        world.despawn(entity);
    }
}
