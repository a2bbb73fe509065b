//! Combatant decision-making: perception, target commitment and
//! movement intent.
//!
//! Perception is the only part of the frame that casts sight rays, and
//! every cast goes through the perception budget. Results land in a
//! frame-scoped line-of-sight cache so a pair of combatants never pays
//! for the same ray twice. When the budget runs dry mid-scan the
//! combatant keeps acting on its last known contact instead of
//! blocking: stale intel beats no decision.
//!
//! ## System order
//! perception -> decision -> nerves decay, chained inside the AI phase.

use bevy_ecs::prelude::*;
use glam::Vec3;
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;

use crate::budget::RayBudgets;
use crate::components::*;
use crate::config::SimRng;
use crate::hooks::{HeightSource, Hooks};
use crate::spatial::{CombatOctree, OctreeEntry};
use crate::systems::scheduler::SimClock;
use crate::systems::squads::SquadRegistry;

/// Eye height above the combatant origin for sight rays.
const EYE_OFFSET: f32 = 0.6;
/// Perception reaches past weapon range by this factor.
const PERCEPTION_RANGE_FACTOR: f32 = 1.4;
/// Alerted combatants scan wider.
const ALERT_RANGE_FACTOR: f32 = 1.3;
/// Hard cap on scan radius regardless of weapon.
const MAX_PERCEPTION_RANGE: f32 = 280.0;
/// Closest-first candidates tried per scan before giving up.
const MAX_LOS_CANDIDATES: usize = 4;
/// Seconds a committed target survives without being re-seen.
const TARGET_MEMORY: f64 = 4.0;
/// Seconds of heightened awareness after contact.
const ALERT_WINDOW: f64 = 6.0;
/// Minimum spacing between terrain samples along a sight ray.
const LOS_SAMPLE_SPACING: f32 = 4.0;

/// Suppression shed per simulated second; panic decays at half this
/// rate inside `Nerves::decay`.
const SUPPRESSION_DECAY_RATE: f32 = 0.25;

const WALK_SPEED: f32 = 2.2;
const RUN_SPEED: f32 = 4.6;
const FLEE_SPEED: f32 = 6.0;
/// How far a panicked combatant runs before reconsidering.
const FLEE_DISTANCE: f32 = 45.0;
/// Idle drift leg length.
const WANDER_RADIUS: f32 = 9.0;
/// Engaging combatants advance until inside this fraction of weapon
/// range; aggression shrinks it further.
const HOLD_RANGE_FRACTION: f32 = 0.7;
/// Followers ring the squad objective instead of stacking on it.
const FOLLOWER_SPREAD: f32 = 4.0;

// ============================================================================
// LINE OF SIGHT
// ============================================================================

/// Distance along `dir` at which terrain first rises above the ray, or
/// `None` if the path is clear to `max_dist`. Sampled at fixed spacing,
/// widened for long rays so cost stays bounded.
pub(crate) fn terrain_block_distance(
    terrain: &dyn HeightSource,
    origin: Vec3,
    dir: Vec3,
    max_dist: f32,
) -> Option<f32> {
    if max_dist <= 0.0 {
        return None;
    }
    let step = (max_dist / 32.0).max(LOS_SAMPLE_SPACING);
    let mut t = step;
    while t < max_dist {
        let point = origin + dir * t;
        if terrain.height_at(point.x, point.z) > point.y {
            return Some(t);
        }
        t += step;
    }
    None
}

/// Eye-to-eye visibility between two combatant origins.
pub(crate) fn line_of_sight(terrain: &dyn HeightSource, from: Vec3, to: Vec3) -> bool {
    let eye_from = from + Vec3::Y * EYE_OFFSET;
    let eye_to = to + Vec3::Y * EYE_OFFSET;
    let delta = eye_to - eye_from;
    let dist = delta.length();
    if dist <= f32::EPSILON {
        return true;
    }
    terrain_block_distance(terrain, eye_from, delta / dist, dist).is_none()
}

/// Frame-scoped sight results keyed by unordered id pair, since
/// terrain occlusion reads the same both ways. Cleared by the
/// orchestrator at frame start.
#[derive(Resource, Debug, Default)]
pub struct LosCache {
    results: HashMap<(CombatantId, CombatantId), bool>,
    /// Rays actually cast into this cache.
    pub computed: u64,
    /// Lookups answered without a ray.
    pub reused: u64,
}

impl LosCache {
    fn key(a: CombatantId, b: CombatantId) -> (CombatantId, CombatantId) {
        if a <= b {
            (a, b)
        } else {
            (b, a)
        }
    }

    pub fn begin_frame(&mut self) {
        self.results.clear();
    }

    pub fn get(&mut self, a: CombatantId, b: CombatantId) -> Option<bool> {
        let hit = self.results.get(&Self::key(a, b)).copied();
        if hit.is_some() {
            self.reused += 1;
        }
        hit
    }

    pub fn store(&mut self, a: CombatantId, b: CombatantId, visible: bool) {
        self.computed += 1;
        self.results.insert(Self::key(a, b), visible);
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

// ============================================================================
// PERCEPTION SYSTEM
// ============================================================================

/// Target acquisition for stepped combatants.
///
/// Candidates come from the octree closest-first; each gets a cached
/// or budget-admitted sight ray until one proves visible. Budget
/// denial aborts the scan but never clears the previous commitment.
///
/// ## Data Access
/// - Reads: SimClock, CombatOctree, Hooks (terrain), Position, Faction,
///   WeaponSpec, SkillProfile, BehaviorState, UpdateClock
/// - Writes: RayBudgets (perception), LosCache, Engagement,
///   FireControl (reaction), Nerves (alert)
pub fn perception_system(
    clock: Res<SimClock>,
    octree: Res<CombatOctree>,
    hooks: Res<Hooks>,
    mut budgets: ResMut<RayBudgets>,
    mut los: ResMut<LosCache>,
    mut query: Query<(
        &CombatantId,
        &Position,
        &Faction,
        &WeaponSpec,
        &SkillProfile,
        &BehaviorState,
        &UpdateClock,
        &mut Engagement,
        &mut FireControl,
        &mut Nerves,
    )>,
) {
    let now = clock.now;
    for (id, pos, faction, weapon, skill, state, uc, mut engagement, mut fire, mut nerves) in
        query.iter_mut()
    {
        if state.is_dead() || !uc.due {
            continue;
        }

        // Fallen targets are dropped for free; death needs no ray.
        if let Some(target) = engagement.target {
            if !octree.contains(target) {
                engagement.drop_target();
            }
        }

        let mut range = (weapon.range * PERCEPTION_RANGE_FACTOR).min(MAX_PERCEPTION_RANGE);
        if nerves.alert_until > now {
            range = (range * ALERT_RANGE_FACTOR).min(MAX_PERCEPTION_RANGE);
        }

        let hostiles = octree.query_hostiles(pos.0, range, *faction);
        let mut spotted: Option<OctreeEntry> = None;
        let mut starved = false;
        for candidate in hostiles.iter().take(MAX_LOS_CANDIDATES) {
            match los.get(*id, candidate.id) {
                Some(true) => {
                    spotted = Some(*candidate);
                    break;
                }
                Some(false) => continue,
                None => {
                    if !budgets.perception.try_consume() {
                        starved = true;
                        break;
                    }
                    let visible = line_of_sight(hooks.terrain.as_ref(), pos.0, candidate.pos);
                    los.store(*id, candidate.id, visible);
                    if visible {
                        spotted = Some(*candidate);
                        break;
                    }
                }
            }
        }

        match spotted {
            Some(contact) => {
                if engagement.target != Some(contact.id) {
                    fire.reaction_until = now + skill.reaction as f64;
                }
                engagement.target = Some(contact.id);
                engagement.last_seen = Some(contact.pos);
                engagement.acquired_at = now;
                nerves.alert_until = now + ALERT_WINDOW;
            }
            // Starved scans leave the last commitment untouched.
            None if starved => {}
            None => {
                if engagement.target.is_some() && now - engagement.acquired_at > TARGET_MEMORY {
                    engagement.drop_target();
                }
            }
        }
    }
}

// ============================================================================
// DECISION SYSTEM
// ============================================================================

/// Turns stress, commitment and squad orders into movement intent and
/// behavior state. Priority: daze > pinned > panic > engagement >
/// objective > wander.
///
/// ## Data Access
/// - Reads: SimClock, SquadRegistry, CombatantId, Position, WeaponSpec,
///   SkillProfile, Nerves, Daze, Engagement, UpdateClock, SquadLink
/// - Writes: SimRng, BehaviorState, MoveIntent, Wander
pub fn decision_system(
    clock: Res<SimClock>,
    registry: Res<SquadRegistry>,
    mut rng: ResMut<SimRng>,
    mut query: Query<(
        &CombatantId,
        &Position,
        &WeaponSpec,
        &SkillProfile,
        &Nerves,
        &Daze,
        &Engagement,
        &UpdateClock,
        Option<&SquadLink>,
        &mut BehaviorState,
        &mut MoveIntent,
        &mut Wander,
    )>,
) {
    let now = clock.now;
    for (
        id,
        pos,
        weapon,
        skill,
        nerves,
        daze,
        engagement,
        uc,
        link,
        mut state,
        mut intent,
        mut wander,
    ) in query.iter_mut()
    {
        if state.is_dead() || !uc.due {
            continue;
        }
        if daze.active(now) {
            intent.destination = None;
            continue;
        }
        if nerves.is_pinned() {
            state.transition_to(BehaviorState::Suppressed);
            intent.destination = None;
            continue;
        }

        if nerves.is_panicked() {
            let away = match engagement.last_seen {
                Some(seen) => {
                    let mut dir = pos.0 - seen;
                    dir.y = 0.0;
                    dir.normalize_or_zero()
                }
                None => Vec3::new(wander.heading.sin(), 0.0, wander.heading.cos()),
            };
            let away = if away == Vec3::ZERO { Vec3::X } else { away };
            intent.destination = Some(pos.0 + away * FLEE_DISTANCE);
            intent.speed = FLEE_SPEED;
            state.transition_to(BehaviorState::Moving);
            continue;
        }

        if let (Some(_), Some(seen)) = (engagement.target, engagement.last_seen) {
            state.transition_to(BehaviorState::Engaging);
            let dist = pos.0.distance(seen);
            let hold_at = weapon.range * (HOLD_RANGE_FRACTION - 0.25 * skill.aggression);
            if dist > hold_at {
                intent.destination = Some(seen);
                intent.speed = RUN_SPEED;
            } else {
                intent.destination = None;
            }
            continue;
        }

        let objective = link
            .and_then(|l| registry.squad(l.squad))
            .and_then(|squad| squad.objective);
        if let Some(objective) = objective {
            let dest = match link.map(|l| l.role) {
                Some(SquadRole::Follower) => {
                    let angle = id.0 as f32 * 2.399_963;
                    let ring = FOLLOWER_SPREAD + (id.0 % 4) as f32 * 1.5;
                    objective + Vec3::new(angle.sin() * ring, 0.0, angle.cos() * ring)
                }
                _ => objective,
            };
            intent.destination = Some(dest);
            intent.speed = RUN_SPEED;
            if pos.0.distance(dest) > 3.0 {
                state.transition_to(BehaviorState::Moving);
            } else {
                state.transition_to(BehaviorState::Idle);
            }
            continue;
        }

        // Nothing to do: drift.
        if now >= wander.next_turn_at {
            wander.heading = rng.0.gen_range(0.0..std::f32::consts::TAU);
            wander.next_turn_at = now + rng.0.gen_range(2.0..6.0f64);
        }
        let heading = Vec3::new(wander.heading.sin(), 0.0, wander.heading.cos());
        intent.destination = Some(pos.0 + heading * WANDER_RADIUS);
        intent.speed = WALK_SPEED;
        state.transition_to(BehaviorState::Idle);
    }
}

/// Sheds suppression and panic over each granted step. Integrating
/// `step_dt` keeps the decay rate independent of update tier.
///
/// ## Data Access
/// - Reads: BehaviorState, UpdateClock
/// - Writes: Nerves
pub fn nerves_decay_system(mut query: Query<(&BehaviorState, &UpdateClock, &mut Nerves)>) {
    for (state, uc, mut nerves) in query.iter_mut() {
        if state.is_dead() || !uc.due {
            continue;
        }
        if nerves.suppression > 0.0 || nerves.panic > 0.0 {
            nerves.decay(SUPPRESSION_DECAY_RATE, uc.step_dt);
        }
    }
}

// ============================================================================
// STATE TELEMETRY
// ============================================================================

/// Per-frame census of behavior states.
#[derive(Resource, Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StateDistribution {
    pub idle: u32,
    pub moving: u32,
    pub engaging: u32,
    pub suppressed: u32,
    pub dead: u32,
}

impl StateDistribution {
    pub fn total_live(&self) -> u32 {
        self.idle + self.moving + self.engaging + self.suppressed
    }
}

/// Recounts the distribution. Runs in both the full and the
/// gate-closed pipeline so telemetry never goes stale.
///
/// ## Data Access
/// - Reads: BehaviorState
/// - Writes: StateDistribution
pub fn state_distribution_system(
    mut dist: ResMut<StateDistribution>,
    query: Query<&BehaviorState>,
) {
    let mut next = StateDistribution::default();
    for state in query.iter() {
        match state {
            BehaviorState::Idle => next.idle += 1,
            BehaviorState::Moving => next.moving += 1,
            BehaviorState::Engaging => next.engaging += 1,
            BehaviorState::Suppressed => next.suppressed += 1,
            BehaviorState::Dead => next.dead += 1,
        }
    }
    if *dist != next {
        *dist = next;
    }
}
