//! Ballistics: fire admission, shot resolution and damage application.
//!
//! The frame splits into three phases:
//!
//! 1. **Fire control** (sequential) - decides who may shoot. Cooldowns,
//!    bursts and reaction delays come from `FireControl`; admission to
//!    the frame goes through the fire ray budget. Each admitted shot
//!    becomes a `ShotOrder` carrying everything resolution needs,
//!    including its own rng seed.
//! 2. **Resolution** (parallelizable) - traces each order against
//!    terrain and the octree. Orders are self-contained, so with the
//!    `parallel` feature this maps over a rayon iterator; collect
//!    preserves order, which keeps runs bit-identical either way.
//! 3. **Apply** (sequential) - damage, suppression, kill attribution
//!    and host effects, in shot order.
//!
//! Death bookkeeping lives in [`sweep_deaths`], which also serves the
//! explosion and player-shot paths.

use bevy_ecs::prelude::*;
use glam::Vec3;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::budget::RayBudgets;
use crate::components::*;
use crate::config::{SimConfig, SimRng};
use crate::hitcache::HitCache;
use crate::hooks::{HeightSource, Hooks};
use crate::spatial::{CombatOctree, OctreeEntry};
use crate::systems::ai::terrain_block_distance;
use crate::systems::scheduler::SimClock;
use crate::systems::spawning::SpawnControl;
use crate::systems::squads::SquadRegistry;
use crate::world::{CombatantIndex, Tally};

/// Lateral distance within which a ray counts as striking a torso.
const TORSO_TOLERANCE: f32 = 1.1;
/// Misses passing this close to the aim point still rattle the target.
const NEAR_MISS_RADIUS: f32 = 2.5;
const SUPPRESS_PER_HIT: f32 = 0.3;
const SUPPRESS_NEAR_MISS: f32 = 0.15;
/// Chance an AI hit strikes the head (player shots use geometry).
const HEADSHOT_CHANCE: f32 = 0.12;
/// Damage holds full value out to this fraction of weapon range...
const FALLOFF_START: f32 = 0.35;
/// ...then tapers linearly to this floor at max range.
const FALLOFF_FLOOR: f32 = 0.45;
/// Panic added per point of damage relative to max health.
const PANIC_PER_DAMAGE: f32 = 0.8;
/// Being shot at keeps a combatant scanning this long.
const ALERT_AFTER_FIRE: f64 = 6.0;
/// Explosions disorient out to this multiple of their damage radius.
const DAZE_RADIUS_FACTOR: f32 = 1.4;
/// Longest flashbang-style daze, at ground zero.
const DAZE_MAX_SECONDS: f32 = 4.0;
/// Player shots: ray passing above origin + this band * scale is a
/// head hit.
const HEAD_BAND: f32 = 0.45;
const PLAYER_HEADSHOT_MULTIPLIER: f32 = 2.0;

// ============================================================================
// SHOT QUEUES
// ============================================================================

/// Everything resolution needs, captured at fire time. Self-contained
/// so shots can resolve on any thread and still come out identical:
/// the per-shot rng seed is drawn sequentially by fire control.
#[derive(Debug, Clone, Copy)]
pub struct ShotOrder {
    pub attacker: CombatantId,
    pub attacker_faction: Faction,
    pub origin: Vec3,
    pub target: CombatantId,
    pub aim: Vec3,
    pub weapon: WeaponSpec,
    pub accuracy: f32,
    pub suppression: f32,
    pub seed: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct ShotOutcome {
    pub attacker: CombatantId,
    pub attacker_faction: Faction,
    pub origin: Vec3,
    pub end: Vec3,
    /// Whoever the ray actually struck, intended or not.
    pub victim: Option<CombatantId>,
    pub damage: f32,
    pub headshot: bool,
    /// Intended target a miss whistled past.
    pub near_miss: Option<CombatantId>,
}

#[derive(Resource, Debug, Default)]
pub struct PendingShots(pub Vec<ShotOrder>);

#[derive(Resource, Debug, Default)]
pub struct ShotOutcomes(pub Vec<ShotOutcome>);

// ============================================================================
// FIRE CONTROL
// ============================================================================

/// Builds the frame's shot list. Runs sequentially: budget admission
/// and rng seeding both depend on iteration order staying stable.
///
/// ## Data Access
/// - Reads: SimClock, CombatOctree, CombatantId, Faction, Position,
///   BehaviorState, WeaponSpec, SkillProfile, Nerves, Daze, Engagement,
///   UpdateClock
/// - Writes: RayBudgets (fire), SimRng, PendingShots, FireControl
pub fn fire_control_system(
    clock: Res<SimClock>,
    octree: Res<CombatOctree>,
    hooks: Res<Hooks>,
    mut budgets: ResMut<RayBudgets>,
    mut rng: ResMut<SimRng>,
    mut pending: ResMut<PendingShots>,
    mut query: Query<(
        &CombatantId,
        &Faction,
        &Position,
        &BehaviorState,
        &WeaponSpec,
        &SkillProfile,
        &Nerves,
        &Daze,
        &Engagement,
        &UpdateClock,
        &mut FireControl,
    )>,
) {
    let now = clock.now;
    for (id, faction, pos, state, weapon, skill, nerves, daze, engagement, uc, mut fire) in
        query.iter_mut()
    {
        if !uc.due || *state != BehaviorState::Engaging {
            continue;
        }
        if daze.active(now) || nerves.is_pinned() {
            continue;
        }
        let Some(target) = engagement.target else { continue };
        if !octree.contains(target) {
            continue;
        }
        let Some(aim) = engagement.last_seen else { continue };
        if pos.0.distance(aim) > weapon.range {
            continue;
        }
        if !fire.ready(now, weapon.shot_cooldown()) {
            continue;
        }
        // No budget, no shot; the denial shows up in telemetry.
        if !budgets.fire.try_consume() {
            continue;
        }

        fire.record_shot(now, weapon);
        hooks.effects.muzzle_flash(pos.0);
        pending.0.push(ShotOrder {
            attacker: *id,
            attacker_faction: *faction,
            origin: pos.0,
            target,
            aim,
            weapon: *weapon,
            accuracy: skill.accuracy,
            suppression: nerves.suppression,
            seed: rng.0.gen(),
        });
    }
}

// ============================================================================
// RESOLUTION
// ============================================================================

fn falloff_factor(dist: f32, range: f32) -> f32 {
    let start = range * FALLOFF_START;
    if dist <= start {
        return 1.0;
    }
    let t = ((dist - start) / (range - start).max(1.0)).clamp(0.0, 1.0);
    1.0 - (1.0 - FALLOFF_FLOOR) * t
}

/// Perturbs the aim direction by up to `wobble` radians of yaw and
/// half that of pitch.
fn jitter(dir: Vec3, rng: &mut ChaCha8Rng, wobble: f32) -> Vec3 {
    if wobble <= 0.0 {
        return dir;
    }
    let yaw = dir.x.atan2(dir.z) + rng.gen_range(-wobble..=wobble);
    let pitch = dir.y.clamp(-1.0, 1.0).asin() + rng.gen_range(-wobble..=wobble) * 0.5;
    Vec3::new(yaw.sin() * pitch.cos(), pitch.sin(), yaw.cos() * pitch.cos())
}

/// First combatant the ray passes within `tolerance` of, marching the
/// octree in gather steps. Returns the entry and its distance along
/// the ray. Once the best hit sits behind the march point nothing
/// closer can still appear, so the walk stops early.
fn ray_contact(
    octree: &CombatOctree,
    origin: Vec3,
    dir: Vec3,
    max_dist: f32,
    tolerance: f32,
    exclude: CombatantId,
) -> Option<(OctreeEntry, f32)> {
    if max_dist <= 0.0 {
        return None;
    }
    let step = (tolerance * 2.0).max(4.0);
    let gather = tolerance + step * 0.5;
    let mut scratch = Vec::new();
    let mut best: Option<(OctreeEntry, f32)> = None;

    let mut t = 0.0f32;
    loop {
        let sample = origin + dir * t.min(max_dist);
        octree.query_radius_into(sample, gather, &mut scratch);
        for entry in &scratch {
            if entry.id == exclude {
                continue;
            }
            let along = (entry.pos - origin).dot(dir);
            if along < 0.0 || along > max_dist {
                continue;
            }
            let closest = origin + dir * along;
            if entry.pos.distance(closest) <= tolerance
                && best.map_or(true, |(_, b)| along < b)
            {
                best = Some((*entry, along));
            }
        }
        if let Some((_, along)) = best {
            if along <= t {
                break;
            }
        }
        if t >= max_dist {
            break;
        }
        t += step;
    }
    best
}

fn resolve_shot(order: &ShotOrder, octree: &CombatOctree, terrain: &dyn HeightSource) -> ShotOutcome {
    let mut rng = ChaCha8Rng::seed_from_u64(order.seed);

    let to_aim = order.aim - order.origin;
    let dist_to_aim = to_aim.length();
    let base_dir = if dist_to_aim > f32::EPSILON {
        to_aim / dist_to_aim
    } else {
        Vec3::X
    };

    // Spread widens with poor marksmanship and incoming suppression.
    let wobble = order.weapon.spread * (1.6 - order.accuracy) * (1.0 + order.suppression.min(1.5));
    let dir = jitter(base_dir, &mut rng, wobble);

    let max_dist = order.weapon.range;
    let limit = terrain_block_distance(terrain, order.origin, dir, max_dist).unwrap_or(max_dist);

    match ray_contact(octree, order.origin, dir, limit, TORSO_TOLERANCE, order.attacker) {
        Some((entry, along)) => {
            let headshot = rng.gen::<f32>() < HEADSHOT_CHANCE;
            let mut damage = order.weapon.damage * falloff_factor(along, order.weapon.range);
            if headshot {
                damage *= order.weapon.headshot_multiplier;
            }
            ShotOutcome {
                attacker: order.attacker,
                attacker_faction: order.attacker_faction,
                origin: order.origin,
                end: order.origin + dir * along,
                victim: Some(entry.id),
                damage,
                headshot,
                near_miss: None,
            }
        }
        None => {
            let along = (order.aim - order.origin).dot(dir).clamp(0.0, limit);
            let closest = order.origin + dir * along;
            let near_miss =
                (closest.distance(order.aim) <= NEAR_MISS_RADIUS).then_some(order.target);
            ShotOutcome {
                attacker: order.attacker,
                attacker_faction: order.attacker_faction,
                origin: order.origin,
                end: order.origin + dir * limit,
                victim: None,
                damage: 0.0,
                headshot: false,
                near_miss,
            }
        }
    }
}

/// Resolves every pending order against terrain and the octree.
///
/// ## Data Access
/// - Reads: CombatOctree, Hooks (terrain)
/// - Writes: PendingShots (drained), ShotOutcomes
pub fn shot_resolution_system(
    octree: Res<CombatOctree>,
    hooks: Res<Hooks>,
    mut pending: ResMut<PendingShots>,
    mut outcomes: ResMut<ShotOutcomes>,
) {
    let shots = std::mem::take(&mut pending.0);
    let terrain = hooks.terrain.as_ref();

    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;
        outcomes.0 = shots
            .par_iter()
            .map(|order| resolve_shot(order, &octree, terrain))
            .collect();
    }

    #[cfg(not(feature = "parallel"))]
    {
        outcomes.0 = shots
            .iter()
            .map(|order| resolve_shot(order, &octree, terrain))
            .collect();
    }
}

// ============================================================================
// APPLY
// ============================================================================

/// Applies resolved shots in order: health, nerves, kill attribution,
/// miss streaks and host effects.
///
/// ## Data Access
/// - Reads: SimClock, Hooks, CombatantIndex
/// - Writes: Tally, ShotOutcomes (drained), Health, Nerves,
///   CombatRecord, FireControl
pub fn damage_apply_system(
    clock: Res<SimClock>,
    hooks: Res<Hooks>,
    index: Res<CombatantIndex>,
    mut tally: ResMut<Tally>,
    mut outcomes: ResMut<ShotOutcomes>,
    mut victims: Query<(&mut Health, &mut Nerves)>,
    mut attackers: Query<&mut CombatRecord>,
    mut triggers: Query<&mut FireControl>,
) {
    let now = clock.now;
    for shot in outcomes.0.drain(..) {
        hooks.effects.tracer(shot.origin, shot.end);
        hooks.effects.impact(shot.end);

        match shot.victim {
            Some(victim_id) => {
                let Some(victim) = index.entity(victim_id) else { continue };
                let Ok((mut health, mut nerves)) = victims.get_mut(victim) else {
                    continue;
                };
                let was_alive = health.is_alive();
                health.damage(shot.damage);
                nerves.suppress(SUPPRESS_PER_HIT);
                nerves.panic =
                    (nerves.panic + shot.damage / health.max.max(1.0) * PANIC_PER_DAMAGE).min(1.5);
                nerves.alert_until = now + ALERT_AFTER_FIRE;
                hooks.hud.damage_dealt(victim_id, shot.damage);

                if let Some(attacker) = index.entity(shot.attacker) {
                    if let Ok(mut fire) = triggers.get_mut(attacker) {
                        fire.consecutive_misses = 0;
                    }
                }
                if was_alive && !health.is_alive() {
                    tally.record_kill(shot.attacker_faction);
                    if let Some(attacker) = index.entity(shot.attacker) {
                        if let Ok(mut record) = attackers.get_mut(attacker) {
                            record.kills += 1;
                        }
                    }
                    hooks.hud.combatant_killed(victim_id, Some(shot.attacker));
                }
            }
            None => {
                if let Some(attacker) = index.entity(shot.attacker) {
                    if let Ok(mut fire) = triggers.get_mut(attacker) {
                        fire.consecutive_misses += 1;
                    }
                }
                if let Some(rattled_id) = shot.near_miss {
                    if let Some(rattled) = index.entity(rattled_id) {
                        if let Ok((_, mut nerves)) = victims.get_mut(rattled) {
                            nerves.suppress(SUPPRESS_NEAR_MISS);
                            nerves.alert_until = now + ALERT_AFTER_FIRE;
                        }
                    }
                }
            }
        }
    }
}

// ============================================================================
// DEATH SWEEP
// ============================================================================

/// Moves combatants whose health hit zero into the terminal dead
/// state and unhooks them from every live structure: octree, hit
/// cache, squad roster. Deaths are tallied here (kill credit happens
/// at the damage site, which knows the attacker), respawns enqueued,
/// and a [`Fallen`] marker starts the corpse timer.
pub fn sweep_deaths(world: &mut World) {
    let now = world.resource::<SimClock>().now;
    let (autonomous, respawn_delay) = {
        let config = world.resource::<SimConfig>();
        (config.autonomous_spawning, config.respawn_delay)
    };

    let mut fallen: Vec<(Entity, CombatantId, Faction, Option<SquadId>)> = Vec::new();
    let mut query = world.query::<(
        Entity,
        &CombatantId,
        &Faction,
        &Health,
        &mut BehaviorState,
        &mut Velocity,
        &mut MoveIntent,
        &mut Engagement,
        &mut CombatRecord,
        Option<&SquadLink>,
    )>();
    for (entity, id, faction, health, mut state, mut vel, mut intent, mut engagement, mut record, link) in
        query.iter_mut(world)
    {
        if health.is_alive() || state.is_dead() {
            continue;
        }
        state.transition_to(BehaviorState::Dead);
        vel.0 = Vec3::ZERO;
        intent.destination = None;
        engagement.drop_target();
        record.deaths += 1;
        fallen.push((entity, *id, *faction, link.map(|l| l.squad)));
    }

    for (entity, id, faction, squad) in fallen {
        log::debug!("combatant {} ({:?}) down", id.0, faction);
        world.resource_mut::<CombatOctree>().remove(id);
        world.resource_mut::<HitCache>().remove_entity(id);
        if let Some(squad) = squad {
            world.resource_mut::<SquadRegistry>().discharge(squad, id);
        }
        world.resource_mut::<Tally>().record_death(faction);
        if autonomous {
            world
                .resource_mut::<SpawnControl>()
                .schedule_respawn(faction, now + respawn_delay as f64);
        }
        world.entity_mut(entity).insert(Fallen { at: now });
    }
}

// ============================================================================
// AREA DAMAGE
// ============================================================================

/// Explosion with linear damage falloff inside `radius` and a wider
/// disorientation ring. Returns how many combatants took damage.
pub fn apply_explosion_damage(
    world: &mut World,
    center: Vec3,
    radius: f32,
    max_damage: f32,
    attacker: Option<CombatantId>,
) -> u32 {
    if radius <= 0.0 {
        return 0;
    }
    let now = world.resource::<SimClock>().now;
    let hooks = world.resource::<Hooks>().clone();
    hooks.effects.explosion(center, radius);
    hooks.effects.explosion_audio(center);

    let attacker_faction = attacker
        .and_then(|id| world.resource::<CombatantIndex>().entity(id))
        .and_then(|entity| world.entity(entity).get::<Faction>().copied());

    let daze_radius = radius * DAZE_RADIUS_FACTOR;
    let blast = world
        .resource::<CombatOctree>()
        .query_radius(center, daze_radius);

    let mut touched = 0;
    for entry in blast {
        let Some(entity) = world.resource::<CombatantIndex>().entity(entry.id) else {
            continue;
        };
        let dist = entry.pos.distance(center);

        if let Some(mut daze) = world.get_mut::<Daze>(entity) {
            let daze_frac = (1.0 - dist / daze_radius).clamp(0.0, 1.0);
            let until = now + (DAZE_MAX_SECONDS * daze_frac) as f64;
            if until > daze.until {
                daze.until = until;
            }
        }

        let frac = (1.0 - dist / radius).clamp(0.0, 1.0);
        let damage = max_damage * frac;
        if damage <= 0.0 {
            continue;
        }

        let died = match world.get_mut::<Health>(entity) {
            Some(mut health) => {
                let was_alive = health.is_alive();
                health.damage(damage);
                was_alive && !health.is_alive()
            }
            None => false,
        };
        if let Some(mut nerves) = world.get_mut::<Nerves>(entity) {
            nerves.suppress(frac * 0.8);
            nerves.panic = (nerves.panic + frac * 0.9).min(1.5);
            nerves.alert_until = now + ALERT_AFTER_FIRE;
        }
        hooks.hud.damage_dealt(entry.id, damage);
        touched += 1;

        if died {
            if let Some(by) = attacker_faction {
                world.resource_mut::<Tally>().record_kill(by);
            }
            if let Some(attacker_id) = attacker {
                if let Some(attacker_entity) = world.resource::<CombatantIndex>().entity(attacker_id) {
                    if let Some(mut record) = world.get_mut::<CombatRecord>(attacker_entity) {
                        record.kills += 1;
                    }
                }
            }
            hooks.hud.combatant_killed(entry.id, attacker);
        }
    }

    sweep_deaths(world);
    touched
}

// ============================================================================
// PLAYER FIRE
// ============================================================================

/// What a player round did, for the host's HUD.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct PlayerShotReport {
    pub victim: CombatantId,
    pub position: Vec3,
    pub distance: f32,
    pub headshot: bool,
    pub damage: f32,
    pub killed: bool,
}

/// Ray from the player against the shared hit cache, falling back to a
/// linear scan while the cache is cold. Terrain is tested first so a
/// hill always eats the round.
fn player_ray(
    world: &mut World,
    origin: Vec3,
    dir: Vec3,
    max_dist: f32,
) -> Option<(CombatantId, Vec3, f32)> {
    let dir = dir.normalize_or_zero();
    if dir == Vec3::ZERO || max_dist <= 0.0 {
        return None;
    }
    let hooks = world.resource::<Hooks>().clone();
    let limit = terrain_block_distance(hooks.terrain.as_ref(), origin, dir, max_dist)
        .unwrap_or(max_dist);

    let cached = world
        .resource::<HitCache>()
        .query_ray(origin, dir, limit, TORSO_TOLERANCE);
    match cached {
        Some(hits) => hits.into_iter().next().map(|hit| (hit.id, hit.pos, hit.distance)),
        None => {
            world.resource_mut::<HitCache>().note_fallback();
            let mut best: Option<(CombatantId, Vec3, f32)> = None;
            let mut query = world.query::<(&CombatantId, &Position, &BehaviorState)>();
            for (id, pos, state) in query.iter(world) {
                if state.is_dead() {
                    continue;
                }
                let along = (pos.0 - origin).dot(dir);
                if along < 0.0 || along > limit {
                    continue;
                }
                let closest = origin + dir * along;
                if pos.0.distance(closest) <= TORSO_TOLERANCE
                    && best.map_or(true, |(_, _, b)| along < b)
                {
                    best = Some((*id, pos.0, along));
                }
            }
            best
        }
    }
}

/// Non-destructive hit test for crosshair feedback.
pub fn check_player_hit(
    world: &mut World,
    origin: Vec3,
    dir: Vec3,
    max_dist: f32,
) -> Option<CombatantId> {
    player_ray(world, origin, dir, max_dist).map(|(id, _, _)| id)
}

/// Resolves and applies a player round. Headshots are geometric: the
/// ray passing above the victim's head band doubles the damage.
pub fn handle_player_shot(
    world: &mut World,
    origin: Vec3,
    dir: Vec3,
    max_dist: f32,
    damage: f32,
) -> Option<PlayerShotReport> {
    let (victim_id, victim_pos, along) = player_ray(world, origin, dir, max_dist)?;
    let entity = world.resource::<CombatantIndex>().entity(victim_id)?;

    let now = world.resource::<SimClock>().now;
    let hooks = world.resource::<Hooks>().clone();
    let dir = dir.normalize_or_zero();
    let impact = origin + dir * along;

    let scale = world.entity(entity).get::<Scale>().map_or(1.0, |s| s.0);
    let headshot = impact.y > victim_pos.y + HEAD_BAND * scale;
    let applied = damage * if headshot { PLAYER_HEADSHOT_MULTIPLIER } else { 1.0 };

    let killed = {
        let mut health = world.get_mut::<Health>(entity)?;
        let was_alive = health.is_alive();
        health.damage(applied);
        was_alive && !health.is_alive()
    };
    if let Some(mut nerves) = world.get_mut::<Nerves>(entity) {
        nerves.suppress(SUPPRESS_PER_HIT);
        nerves.alert_until = now + ALERT_AFTER_FIRE;
    }

    hooks.effects.impact(impact);
    hooks.hud.damage_dealt(victim_id, applied);
    if killed {
        // Player kills carry no combatant attribution.
        hooks.hud.combatant_killed(victim_id, None);
    }
    sweep_deaths(world);

    Some(PlayerShotReport {
        victim: victim_id,
        position: victim_pos,
        distance: along,
        headshot,
        damage: applied,
        killed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{FlatGround, HudSink};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Ridge;
    impl HeightSource for Ridge {
        fn height_at(&self, x: f32, _z: f32) -> f32 {
            if (10.0..=20.0).contains(&x) {
                50.0
            } else {
                0.0
            }
        }
    }

    #[derive(Default)]
    struct KillFeed {
        kills: AtomicUsize,
        attributed: AtomicUsize,
    }
    impl HudSink for KillFeed {
        fn combatant_killed(&self, _victim: CombatantId, attacker: Option<CombatantId>) {
            self.kills.fetch_add(1, Ordering::Relaxed);
            if attacker.is_some() {
                self.attributed.fetch_add(1, Ordering::Relaxed);
            }
        }
        fn damage_dealt(&self, _target: CombatantId, _amount: f32) {}
    }

    fn test_world(terrain: Arc<dyn HeightSource>) -> World {
        let config = SimConfig::default();
        let mut world = World::new();
        world.insert_resource(SimClock { now: 10.0, frame: 3 });
        world.insert_resource(CombatOctree::default());
        world.insert_resource(Hooks::default().with_terrain(terrain));
        world.insert_resource(RayBudgets::from_config(&config));
        world.insert_resource(SimRng::from_config(&config));
        world.insert_resource(PendingShots::default());
        world.insert_resource(ShotOutcomes::default());
        world.insert_resource(CombatantIndex::default());
        world.insert_resource(Tally::default());
        world.insert_resource(HitCache::default());
        world.insert_resource(SquadRegistry::default());
        world.insert_resource(SpawnControl::from_config(&config));
        world.insert_resource(config);
        world
    }

    fn combatant(
        world: &mut World,
        n: u32,
        faction: Faction,
        pos: Vec3,
        health: f32,
    ) -> Entity {
        let mut bundle = CombatantBundle::new(CombatantId(n), faction, pos, health);
        bundle.clock = UpdateClock {
            last_update: 10.0,
            priority: 1.0,
            due: true,
            step_dt: 0.1,
        };
        let entity = world.spawn(bundle).id();
        world
            .resource_mut::<CombatantIndex>()
            .bind(CombatantId(n), entity);
        world
            .resource_mut::<CombatOctree>()
            .update_position(CombatantId(n), pos, faction);
        entity
    }

    fn aim_at(world: &mut World, shooter: Entity, target: CombatantId, seen: Vec3) {
        let mut entity = world.entity_mut(shooter);
        *entity.get_mut::<BehaviorState>().unwrap() = BehaviorState::Engaging;
        *entity.get_mut::<Engagement>().unwrap() = Engagement {
            target: Some(target),
            last_seen: Some(seen),
            acquired_at: 9.0,
        };
    }

    fn combat_schedule() -> Schedule {
        let mut schedule = Schedule::default();
        schedule.add_systems(
            (
                fire_control_system,
                shot_resolution_system,
                damage_apply_system,
                sweep_deaths,
            )
                .chain(),
        );
        schedule
    }

    #[test]
    fn test_steady_marksman_lands_at_short_range() {
        let mut world = test_world(Arc::new(FlatGround));
        let shooter = combatant(&mut world, 1, Faction::Allied, Vec3::new(0.0, 1.0, 0.0), 100.0);
        let target_pos = Vec3::new(30.0, 1.0, 0.0);
        let target = combatant(&mut world, 2, Faction::Opfor, target_pos, 100.0);

        world.entity_mut(shooter).insert((
            WeaponSpec::marksman(),
            SkillProfile {
                accuracy: 1.0,
                reaction: 0.0,
                aggression: 0.5,
            },
        ));
        aim_at(&mut world, shooter, CombatantId(2), target_pos);

        combat_schedule().run(&mut world);

        // Wobble at full accuracy stays inside the torso tolerance at
        // this range, so the hit is certain; only headshot varies.
        let health = world.entity(target).get::<Health>().unwrap();
        assert!(health.current < 100.0, "hit applied: {}", health.current);
        assert_eq!(world.resource::<RayBudgets>().fire.stats().requested, 1);
        assert!(world.resource::<PendingShots>().0.is_empty());
        assert!(world.resource::<ShotOutcomes>().0.is_empty());
    }

    #[test]
    fn test_stale_aim_whistles_past_and_suppresses() {
        let mut world = test_world(Arc::new(FlatGround));
        let shooter = combatant(&mut world, 1, Faction::Allied, Vec3::new(0.0, 1.0, 0.0), 100.0);
        let target_pos = Vec3::new(30.0, 1.0, 0.0);
        let target = combatant(&mut world, 2, Faction::Opfor, target_pos, 100.0);

        // Zero spread makes the ray exact; the target moved 2m since
        // last seen, outside torso tolerance but inside the rattle
        // radius.
        world.entity_mut(shooter).insert(WeaponSpec {
            spread: 0.0,
            ..WeaponSpec::marksman()
        });
        aim_at(&mut world, shooter, CombatantId(2), target_pos + Vec3::new(0.0, 0.0, 2.0));

        combat_schedule().run(&mut world);

        let health = world.entity(target).get::<Health>().unwrap();
        assert_eq!(health.current, 100.0);
        let nerves = world.entity(target).get::<Nerves>().unwrap();
        assert!((nerves.suppression - SUPPRESS_NEAR_MISS).abs() < 1e-6);
        let fire = world.entity(shooter).get::<FireControl>().unwrap();
        assert_eq!(fire.consecutive_misses, 1);
    }

    #[test]
    fn test_cooldown_and_budget_gate_fire() {
        let mut world = test_world(Arc::new(FlatGround));
        let a = combatant(&mut world, 1, Faction::Allied, Vec3::new(0.0, 1.0, 0.0), 100.0);
        let b = combatant(&mut world, 2, Faction::Allied, Vec3::new(0.0, 1.0, 4.0), 100.0);
        let target_pos = Vec3::new(30.0, 1.0, 0.0);
        combatant(&mut world, 3, Faction::Opfor, target_pos, 100.0);

        aim_at(&mut world, a, CombatantId(3), target_pos);
        aim_at(&mut world, b, CombatantId(3), target_pos);
        world.resource_mut::<RayBudgets>().fire.set_max(1);

        let mut fire_only = Schedule::default();
        fire_only.add_systems(fire_control_system);

        // One slot: one of the two gets it.
        fire_only.run(&mut world);
        assert_eq!(world.resource::<PendingShots>().0.len(), 1);
        assert_eq!(world.resource::<RayBudgets>().fire.stats().denied, 1);

        // Same frame again: the admitted shooter is on cooldown and the
        // denied one finds the budget still empty.
        fire_only.run(&mut world);
        assert_eq!(world.resource::<PendingShots>().0.len(), 1);
        assert_eq!(world.resource::<RayBudgets>().fire.stats().denied, 2);
    }

    #[test]
    fn test_terrain_wall_eats_the_round() {
        let mut world = test_world(Arc::new(Ridge));
        let shooter = combatant(&mut world, 1, Faction::Allied, Vec3::new(0.0, 1.0, 0.0), 100.0);
        let target_pos = Vec3::new(30.0, 1.0, 0.0);
        let target = combatant(&mut world, 2, Faction::Opfor, target_pos, 100.0);

        world.entity_mut(shooter).insert(WeaponSpec {
            spread: 0.0,
            ..WeaponSpec::marksman()
        });
        aim_at(&mut world, shooter, CombatantId(2), target_pos);

        combat_schedule().run(&mut world);

        // Round stopped at the ridge: no damage, no rattle, a miss on
        // the shooter's streak.
        let health = world.entity(target).get::<Health>().unwrap();
        assert_eq!(health.current, 100.0);
        let nerves = world.entity(target).get::<Nerves>().unwrap();
        assert_eq!(nerves.suppression, 0.0);
        let fire = world.entity(shooter).get::<FireControl>().unwrap();
        assert_eq!(fire.consecutive_misses, 1);
    }

    #[test]
    fn test_explosion_falls_off_dazes_and_credits_the_thrower() {
        let mut world = test_world(Arc::new(FlatGround));
        let center = Vec3::new(0.0, 1.0, 0.0);
        combatant(&mut world, 1, Faction::Allied, Vec3::new(100.0, 1.0, 0.0), 100.0);
        let at_center = combatant(&mut world, 2, Faction::Opfor, center, 100.0);
        let near = combatant(&mut world, 3, Faction::Opfor, Vec3::new(6.0, 1.0, 0.0), 100.0);
        let fringe = combatant(&mut world, 4, Faction::Opfor, Vec3::new(12.0, 1.0, 0.0), 100.0);

        let touched = apply_explosion_damage(&mut world, center, 10.0, 120.0, Some(CombatantId(1)));
        assert_eq!(touched, 2);

        assert!(world
            .entity(at_center)
            .get::<BehaviorState>()
            .unwrap()
            .is_dead());
        assert!(world.entity(at_center).get::<Fallen>().is_some());
        assert!(!world.resource::<CombatOctree>().contains(CombatantId(2)));

        let near_health = world.entity(near).get::<Health>().unwrap();
        assert!((near_health.current - 52.0).abs() < 1.0);

        // Fringe takes no damage but is inside the disorientation ring.
        let fringe_health = world.entity(fringe).get::<Health>().unwrap();
        assert_eq!(fringe_health.current, 100.0);
        assert!(world.entity(fringe).get::<Daze>().unwrap().until > 10.0);

        let tally = world.resource::<Tally>();
        assert_eq!(tally.kills_allied, 1);
        assert_eq!(tally.deaths_opfor, 1);
        let thrower = world.resource::<CombatantIndex>().entity(CombatantId(1)).unwrap();
        assert_eq!(world.entity(thrower).get::<CombatRecord>().unwrap().kills, 1);

        // Autonomous spawning owes OPFOR a replacement.
        assert_eq!(world.resource::<SpawnControl>().pending.len(), 1);
    }

    #[test]
    fn test_player_headshot_kills_through_the_hit_cache() {
        let mut world = test_world(Arc::new(FlatGround));
        let target_pos = Vec3::new(20.0, 1.0, 0.0);
        combatant(&mut world, 2, Faction::Opfor, target_pos, 40.0);

        let feed = Arc::new(KillFeed::default());
        let hooks = world.resource::<Hooks>().clone().with_hud(feed.clone());
        world.insert_resource(hooks);

        {
            let mut cache = world.resource_mut::<HitCache>();
            cache.initialize(1024.0);
            cache.sync_entity(CombatantId(2), target_pos);
        }

        // Flat ray at 1.75 high passes above the head band (1.45).
        let origin = Vec3::new(0.0, 1.75, 0.0);
        let report = handle_player_shot(&mut world, origin, Vec3::X, 100.0, 30.0)
            .expect("round connects");
        assert_eq!(report.victim, CombatantId(2));
        assert!(report.headshot);
        assert_eq!(report.damage, 60.0);
        assert!(report.killed);
        assert!((report.distance - 20.0).abs() < 0.5);

        // Killed without combatant attribution, swept from the live
        // structures, tallied as an unattributed death.
        assert_eq!(feed.kills.load(Ordering::Relaxed), 1);
        assert_eq!(feed.attributed.load(Ordering::Relaxed), 0);
        assert!(!world.resource::<CombatOctree>().contains(CombatantId(2)));
        assert!(world.resource::<HitCache>().is_empty());
        assert_eq!(world.resource::<Tally>().deaths_opfor, 1);
        assert_eq!(world.resource::<Tally>().kills(), 0);
    }

    #[test]
    fn test_cold_cache_falls_back_to_a_scan_without_damage_on_check() {
        let mut world = test_world(Arc::new(FlatGround));
        let target_pos = Vec3::new(20.0, 1.0, 0.0);
        let target = combatant(&mut world, 2, Faction::Opfor, target_pos, 100.0);

        // Cache never initialized: the scan path answers.
        let hit = check_player_hit(&mut world, Vec3::new(0.0, 1.0, 0.0), Vec3::X, 100.0);
        assert_eq!(hit, Some(CombatantId(2)));
        assert_eq!(world.resource::<HitCache>().stats().fallback_scans, 1);
        assert_eq!(world.entity(target).get::<Health>().unwrap().current, 100.0);
    }
}
