//! Host-facing simulation container.
//!
//! [`SimWorld`] owns the ECS world and the per-phase schedules, and is
//! the only type a host needs to hold. One `update(dt, player)` call
//! runs one simulated frame; everything mutates synchronously inside
//! it, so a spawn issued mid-frame is visible to spatial queries in
//! the same frame.
//!
//! ## Frame pipeline
//!
//! load EMA -> clock/budgets/los reset -> scheduling -> (gate closed?
//! movement-only) -> spawning -> squads -> ai -> movement -> combat ->
//! secondary sync -> telemetry. Each named phase is timed by the
//! profiler.
//!
//! ## Crash containment
//!
//! The frame body runs under a panic guard. A contained panic is
//! logged and the next frame proceeds; three failures inside a 5000 ms
//! window raise the host's fatal sink exactly once (suppressed in
//! headless mode). A clean frame resets the streak.
//!
//! ## Strategic bridge
//!
//! `materialize_agent` / `dematerialize_agent` promote and demote
//! combatants between this tactical layer and an external strategic
//! one, keeping id allocation, both spatial indices and squad rosters
//! consistent in one synchronous call.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Instant;

use bevy_ecs::prelude::*;
use glam::Vec3;
use serde::Serialize;

use crate::budget::{BudgetStats, RayBudgets};
use crate::components::*;
use crate::config::{SimConfig, SimRng};
use crate::hitcache::{hitcache_touch_system, HitCache, HitCacheStats};
use crate::hooks::Hooks;
use crate::profiler::{PhaseReport, Profiler};
use crate::spatial::{octree_update_system, CombatOctree, OctreeStats};
use crate::systems::ai::{
    decision_system, nerves_decay_system, perception_system, LosCache, StateDistribution,
    state_distribution_system,
};
use crate::systems::combat::{
    apply_explosion_damage, check_player_hit, damage_apply_system, fire_control_system,
    handle_player_shot, shot_resolution_system, sweep_deaths, PendingShots, PlayerShotReport,
    ShotOutcomes,
};
use crate::systems::movement::{
    movement_system, position_hold_system, steering_system, visual_settle_system, DeltaTime,
};
use crate::systems::scheduler::{
    lod_schedule_system, FrameLoad, LodReport, LodSummary, PlayerPosition, SimClock,
};
use crate::systems::spawning::{spawn_phase, SpawnControl};
use crate::systems::squads::{squad_objective_system, squad_role_system, Squad, SquadRegistry};
use crate::world::{
    AgentDescriptor, AgentSnapshot, CombatStats, CombatantIndex, Snapshot, Tally,
};

/// Contained frame failures inside this window escalate.
const FAILURE_WINDOW_MS: u128 = 5000;
/// Failures within the window before the fatal notice fires.
const FAILURE_THRESHOLD: usize = 3;

/// The read-only telemetry surface, serializable for host consumption.
#[derive(Debug, Clone, Serialize)]
pub struct Telemetry {
    pub frame: u64,
    pub time: f64,
    pub stats: CombatStats,
    pub lod: LodSummary,
    pub states: StateDistribution,
    pub perception_budget: BudgetStats,
    pub fire_budget: BudgetStats,
    pub octree: OctreeStats,
    pub hit_cache: HitCacheStats,
    pub phases: PhaseReport,
}

/// The main simulation container.
///
/// Holds the ECS world and the phase schedules, providing the host API
/// for stepping frames, bridging agents in and out, issuing player
/// fire and reading telemetry.
pub struct SimWorld {
    world: World,
    scheduling: Schedule,
    squads: Schedule,
    ai: Schedule,
    movement: Schedule,
    combat: Schedule,
    telemetry: Schedule,
    profiler: Profiler,
    recent_failures: Vec<Instant>,
    fatal_raised: bool,
}

impl SimWorld {
    pub fn new() -> Self {
        Self::with_config(SimConfig::default())
    }

    pub fn with_config(config: SimConfig) -> Self {
        let mut world = World::new();

        // Clock and scheduling state.
        world.insert_resource(DeltaTime(0.0));
        world.insert_resource(SimClock::default());
        world.insert_resource(PlayerPosition::default());
        world.insert_resource(FrameLoad::default());
        world.insert_resource(LodReport::default());

        // Spatial indices. The hit cache only comes up when the config
        // says the sim owns the sync; otherwise it stays cold and
        // callers fall back to scans.
        world.insert_resource(CombatOctree::new(
            config.world_half_extent,
            config.octree_leaf_cap,
            config.octree_max_depth,
        ));
        let mut cache = HitCache::default();
        if config.sync_hit_cache {
            cache.initialize(config.world_half_extent * 2.0);
        }
        world.insert_resource(cache);

        // Budgets, caches and combat queues.
        world.insert_resource(RayBudgets::from_config(&config));
        world.insert_resource(LosCache::default());
        world.insert_resource(PendingShots::default());
        world.insert_resource(ShotOutcomes::default());

        // Rosters and counters.
        world.insert_resource(CombatantIndex::default());
        world.insert_resource(Tally::default());
        world.insert_resource(StateDistribution::default());
        world.insert_resource(SquadRegistry::default());
        world.insert_resource(SpawnControl::from_config(&config));

        world.insert_resource(SimRng::from_config(&config));
        world.insert_resource(Hooks::default());

        let mut scheduling = Schedule::default();
        scheduling.add_systems(lod_schedule_system);

        let mut squads = Schedule::default();
        squads.add_systems((squad_objective_system, squad_role_system).chain());

        let mut ai = Schedule::default();
        ai.add_systems((perception_system, decision_system, nerves_decay_system).chain());

        let mut movement = Schedule::default();
        movement.add_systems(
            (
                steering_system,
                movement_system,
                position_hold_system,
                visual_settle_system,
                octree_update_system,
            )
                .chain(),
        );
        if config.sync_hit_cache {
            // Mid-frame sync for movers, while their change ticks are
            // still hot. The end-of-frame bulk sync dedups against the
            // stepped set.
            movement.add_systems(hitcache_touch_system.after(octree_update_system));
        }

        let mut combat = Schedule::default();
        combat.add_systems(
            (
                fire_control_system,
                shot_resolution_system,
                damage_apply_system,
                sweep_deaths,
            )
                .chain(),
        );

        let mut telemetry = Schedule::default();
        telemetry.add_systems(state_distribution_system);

        world.insert_resource(config);

        Self {
            world,
            scheduling,
            squads,
            ai,
            movement,
            combat,
            telemetry,
            profiler: Profiler::new(),
            recent_failures: Vec::new(),
            fatal_raised: false,
        }
    }

    /// Install the host collaborators. Defaults are no-ops, so a bare
    /// `SimWorld` runs headless without any of them.
    pub fn set_hooks(&mut self, hooks: Hooks) {
        self.world.insert_resource(hooks);
    }

    // ========================================================================
    // FRAME LOOP
    // ========================================================================

    /// Run one simulated frame.
    ///
    /// `dt` is the host's real frame delta; the load EMA sees it raw,
    /// integration sees it clamped to `max_delta_time`. `player` is
    /// the LOD reference point for this frame.
    pub fn update(&mut self, dt: f32, player: Vec3) {
        let (max_dt, sync, dedup, headless) = {
            let config = self.world.resource::<SimConfig>();
            (
                config.max_delta_time,
                config.sync_hit_cache,
                config.dedup_hit_cache_sync,
                config.headless,
            )
        };

        self.world.resource_scope(|world, mut load: Mut<FrameLoad>| {
            load.observe(dt, world.resource::<SimConfig>());
        });

        let step_dt = dt.clamp(0.0, max_dt);
        let gate_open = self.world.resource::<Hooks>().gate.is_game_active();

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            self.run_frame(step_dt, player, gate_open, sync, dedup);
        }));
        match outcome {
            Ok(()) => {
                self.recent_failures.clear();
                self.fatal_raised = false;
            }
            Err(payload) => {
                let frame = self.world.resource::<SimClock>().frame;
                log::error!(
                    "contained a panic in frame {}: {}",
                    frame,
                    describe_panic(payload.as_ref())
                );
                self.note_failure(headless);
            }
        }
        self.profiler.frame();
    }

    fn run_frame(&mut self, dt: f32, player: Vec3, gate_open: bool, sync: bool, dedup: bool) {
        self.world.resource_mut::<DeltaTime>().0 = dt;
        self.world.resource_mut::<SimClock>().advance(dt);
        self.world.resource_mut::<PlayerPosition>().0 = player;
        self.world.resource_mut::<RayBudgets>().begin_frame();
        self.world.resource_mut::<LosCache>().begin_frame();

        self.profiler.begin_phase("scheduling");
        self.scheduling.run(&mut self.world);
        self.profiler.end_phase();

        if !gate_open {
            // Intermission: combatants settle and hold, nothing
            // decides or shoots, nobody spawns.
            self.profiler.begin_phase("movement");
            self.movement.run(&mut self.world);
            self.profiler.end_phase();

            self.profiler.begin_phase("sync");
            if sync {
                self.sync_hit_cache(dedup);
            }
            self.profiler.end_phase();

            self.telemetry.run(&mut self.world);
            return;
        }

        self.profiler.begin_phase("spawning");
        spawn_phase(&mut self.world);
        self.profiler.end_phase();

        self.profiler.begin_phase("squads");
        self.squads.run(&mut self.world);
        self.profiler.end_phase();

        self.profiler.begin_phase("ai");
        self.ai.run(&mut self.world);
        self.profiler.end_phase();

        self.profiler.begin_phase("movement");
        self.movement.run(&mut self.world);
        self.profiler.end_phase();

        self.profiler.begin_phase("combat");
        self.combat.run(&mut self.world);
        self.profiler.end_phase();

        self.profiler.begin_phase("sync");
        if sync {
            self.sync_hit_cache(dedup);
        }
        self.profiler.end_phase();

        self.telemetry.run(&mut self.world);
    }

    /// End-of-frame push of live positions into the shared cache. With
    /// dedup on, ids the scheduled step already wrote (via the touch
    /// system) are skipped; the result is identical, the writes are
    /// not.
    fn sync_hit_cache(&mut self, dedup: bool) {
        let mut live: Vec<(CombatantId, Vec3)> = Vec::new();
        {
            let mut query = self
                .world
                .query::<(&CombatantId, &Position, &BehaviorState)>();
            for (id, pos, state) in query.iter(&self.world) {
                if state.is_dead() {
                    continue;
                }
                live.push((*id, pos.0));
            }
        }
        if dedup {
            let report = self.world.resource::<LodReport>();
            live.retain(|(id, _)| !report.stepped.contains(id));
        }
        self.world
            .resource_mut::<HitCache>()
            .sync_all_positions(live);
    }

    fn note_failure(&mut self, headless: bool) {
        let now = Instant::now();
        self.recent_failures.push(now);
        self.recent_failures
            .retain(|t| now.duration_since(*t).as_millis() <= FAILURE_WINDOW_MS);

        if self.recent_failures.len() >= FAILURE_THRESHOLD && !self.fatal_raised {
            self.fatal_raised = true;
            if !headless {
                self.world
                    .resource::<Hooks>()
                    .fatal
                    .fatal("simulation frame failed repeatedly; state may be inconsistent");
            }
        }
    }

    // ========================================================================
    // STRATEGIC BRIDGE
    // ========================================================================

    /// Promote an agent from the strategic layer into a full
    /// combatant. Y is grounded to terrain regardless of the
    /// descriptor; health is clamped into the configured range. The
    /// new combatant is queryable in both spatial indices before this
    /// returns.
    pub fn materialize_agent(&mut self, desc: &AgentDescriptor) -> CombatantId {
        let id = crate::systems::spawning::spawn_combatant(
            &mut self.world,
            desc.faction,
            desc.position.x,
            desc.position.z,
            Some(desc.health),
            desc.squad,
        );
        log::debug!("materialized combatant {} ({:?})", id.0, desc.faction);
        id
    }

    /// Demote a combatant back to the strategic layer. Returns its
    /// exit snapshot, or `None` for ids this world does not know.
    pub fn dematerialize_agent(&mut self, id: CombatantId) -> Option<AgentSnapshot> {
        let entity = self.world.resource::<CombatantIndex>().entity(id)?;

        let (snapshot, squad) = {
            let entity_ref = self.world.entity(entity);
            let snapshot = AgentSnapshot {
                position: entity_ref.get::<Position>()?.0,
                health: entity_ref.get::<Health>()?.current,
                alive: entity_ref
                    .get::<BehaviorState>()
                    .map_or(false, |s| !s.is_dead()),
            };
            let squad = entity_ref.get::<SquadLink>().map(|l| l.squad);
            (snapshot, squad)
        };

        self.world.resource_mut::<CombatOctree>().remove(id);
        self.world.resource_mut::<HitCache>().remove_entity(id);
        if let Some(squad) = squad {
            self.world
                .resource_mut::<SquadRegistry>()
                .discharge(squad, id);
        }
        self.world.resource_mut::<CombatantIndex>().unbind(id);
        self.world.despawn(entity);
        log::debug!("dematerialized combatant {} (alive: {})", id.0, snapshot.alive);
        Some(snapshot)
    }

    // ========================================================================
    // COMMANDS
    // ========================================================================

    /// Spawn a combatant at (`x`, `z`) with rolled weapon and skills,
    /// outside the autonomous wave machinery.
    pub fn spawn_combatant(&mut self, faction: Faction, x: f32, z: f32) -> CombatantId {
        crate::systems::spawning::spawn_combatant(&mut self.world, faction, x, z, None, None)
    }

    /// Area damage with linear falloff and a wider disorientation
    /// ring. Returns how many combatants took damage.
    pub fn apply_explosion_damage(
        &mut self,
        center: Vec3,
        radius: f32,
        max_damage: f32,
        attacker: Option<CombatantId>,
    ) -> u32 {
        apply_explosion_damage(&mut self.world, center, radius, max_damage, attacker)
    }

    /// Resolve and apply a player round.
    pub fn handle_player_shot(
        &mut self,
        origin: Vec3,
        dir: Vec3,
        max_dist: f32,
        damage: f32,
    ) -> Option<PlayerShotReport> {
        handle_player_shot(&mut self.world, origin, dir, max_dist, damage)
    }

    /// Non-destructive crosshair test along a player ray.
    pub fn check_player_hit(
        &mut self,
        origin: Vec3,
        dir: Vec3,
        max_dist: f32,
    ) -> Option<CombatantId> {
        check_player_hit(&mut self.world, origin, dir, max_dist)
    }

    /// Replace the squad roster wholesale; combatant links are
    /// reconciled against the new membership, and live combatants the
    /// roster does not mention are re-enrolled into open squads.
    pub fn set_squads(&mut self, squads: Vec<Squad>) {
        self.world.resource_mut::<SquadRegistry>().set_squads(squads);
        self.reconcile_squad_links();
    }

    /// Game-mode change: drop every squad and rebuild fresh ones from
    /// the live roster.
    pub fn reset_squads(&mut self) {
        self.world.resource_mut::<SquadRegistry>().reset();
        self.reconcile_squad_links();
    }

    fn reconcile_squad_links(&mut self) {
        let membership: std::collections::HashMap<CombatantId, (SquadId, SquadRole)> = {
            let registry = self.world.resource::<SquadRegistry>();
            let mut map = std::collections::HashMap::new();
            for squad in registry.iter() {
                for member in &squad.members {
                    let role = if squad.leader == Some(*member) {
                        SquadRole::Leader
                    } else {
                        SquadRole::Follower
                    };
                    map.insert(*member, (squad.id, role));
                }
            }
            map
        };

        let mut strays: Vec<(CombatantId, Faction)> = Vec::new();
        {
            let mut query = self
                .world
                .query::<(&CombatantId, &Faction, &BehaviorState, &mut SquadLink)>();
            for (id, faction, state, mut link) in query.iter_mut(&mut self.world) {
                if state.is_dead() {
                    continue;
                }
                match membership.get(id) {
                    Some(&(squad, role)) => {
                        link.squad = squad;
                        link.role = role;
                    }
                    None => strays.push((*id, *faction)),
                }
            }
        }
        for (id, faction) in strays {
            let (squad, role) = {
                let mut registry = self.world.resource_mut::<SquadRegistry>();
                let squad = registry.assign(faction, None);
                let role = registry.enroll(squad, id);
                (squad, role)
            };
            if let Some(entity) = self.world.resource::<CombatantIndex>().entity(id) {
                if let Some(mut link) = self.world.get_mut::<SquadLink>(entity) {
                    link.squad = squad;
                    link.role = role;
                }
            }
        }
    }

    /// Rebuild spatial bounds around a new world size without dropping
    /// combatants. The hit cache re-initializes cold and repopulates
    /// on the next sync.
    pub fn set_world_size(&mut self, half_extent: f32) {
        self.world
            .resource_mut::<CombatOctree>()
            .set_world_size(half_extent);
        let sync = self.world.resource::<SimConfig>().sync_hit_cache;
        let mut cache = self.world.resource_mut::<HitCache>();
        cache.reset();
        if sync {
            cache.initialize(half_extent * 2.0);
        }
    }

    // ========================================================================
    // READ-ONLY SURFACE
    // ========================================================================

    pub fn current_frame(&self) -> u64 {
        self.world.resource::<SimClock>().frame
    }

    pub fn current_time(&self) -> f64 {
        self.world.resource::<SimClock>().now
    }

    pub fn combat_stats(&mut self) -> CombatStats {
        CombatStats::from_world(&mut self.world)
    }

    /// Full per-combatant snapshot, rows sorted by id.
    pub fn snapshot(&mut self) -> Snapshot {
        Snapshot::from_world(&mut self.world)
    }

    pub fn snapshot_json(&mut self) -> String {
        self.snapshot()
            .to_json()
            .unwrap_or_else(|_| "{}".to_string())
    }

    pub fn telemetry(&mut self) -> Telemetry {
        let stats = CombatStats::from_world(&mut self.world);
        let clock = *self.world.resource::<SimClock>();
        let budgets = self.world.resource::<RayBudgets>();
        let perception_budget = budgets.perception.stats();
        let fire_budget = budgets.fire.stats();
        Telemetry {
            frame: clock.frame,
            time: clock.now,
            stats,
            lod: self.world.resource::<LodReport>().summary(),
            states: *self.world.resource::<StateDistribution>(),
            perception_budget,
            fire_budget,
            octree: self.world.resource::<CombatOctree>().stats(),
            hit_cache: self.world.resource::<HitCache>().stats(),
            phases: self.profiler.report(),
        }
    }

    pub fn telemetry_json(&mut self) -> String {
        serde_json::to_string(&self.telemetry()).unwrap_or_else(|_| "{}".to_string())
    }

    /// Formatted per-phase timing table, for demos and stress runs.
    pub fn profile_summary(&self) -> String {
        self.profiler.summary()
    }

    /// Direct access to the ECS world (for advanced usage).
    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }
}

impl Default for SimWorld {
    fn default() -> Self {
        Self::new()
    }
}

fn describe_panic(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "opaque panic payload"
    }
}
