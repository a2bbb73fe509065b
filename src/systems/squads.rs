//! Squad bookkeeping and objective assignment.
//!
//! The registry is the single authority on squad membership: combat
//! cleanup discharges the fallen, spawning enrolls recruits, and the
//! roster can be replaced wholesale by a strategic layer. Objectives
//! come from the host's zone source on a fixed cadence; between passes
//! squads keep marching on whatever they were last given.

use bevy_ecs::prelude::*;
use glam::Vec3;
use std::collections::HashMap;

use crate::components::{CombatantId, Faction, Position, SquadId, SquadLink, SquadRole};
use crate::config::SimConfig;
use crate::hooks::Hooks;
use crate::systems::scheduler::SimClock;

/// Preferred headcount when auto-enrolling spawns. Squads injected by
/// a host may be any size.
pub const SQUAD_CAPACITY: usize = 4;

/// One squad's roster and current orders.
#[derive(Debug, Clone)]
pub struct Squad {
    pub id: SquadId,
    pub faction: Faction,
    pub members: Vec<CombatantId>,
    pub leader: Option<CombatantId>,
    pub objective: Option<Vec3>,
}

impl Squad {
    pub fn new(id: SquadId, faction: Faction) -> Self {
        Self {
            id,
            faction,
            members: Vec::new(),
            leader: None,
            objective: None,
        }
    }
}

/// Membership authority. Members are living combatants only; death
/// cleanup discharges them the same frame they fall, which is what
/// makes leader promotion as simple as "first remaining member".
#[derive(Resource, Debug, Default)]
pub struct SquadRegistry {
    squads: HashMap<SquadId, Squad>,
    next_id: u32,
    next_objective_pass: f64,
}

impl SquadRegistry {
    pub fn create_squad(&mut self, faction: Faction) -> SquadId {
        loop {
            self.next_id += 1;
            let id = SquadId(self.next_id);
            if !self.squads.contains_key(&id) {
                self.squads.insert(id, Squad::new(id, faction));
                return id;
            }
        }
    }

    /// Make sure a host-named squad exists, creating an empty record
    /// under that exact id if needed.
    pub fn ensure(&mut self, id: SquadId, faction: Faction) {
        self.squads.entry(id).or_insert_with(|| Squad::new(id, faction));
    }

    /// Add a member. The first member of an empty squad leads it.
    pub fn enroll(&mut self, squad: SquadId, id: CombatantId) -> SquadRole {
        let record = self
            .squads
            .entry(squad)
            .or_insert_with(|| Squad::new(squad, Faction::default()));
        if !record.members.contains(&id) {
            record.members.push(id);
        }
        if record.leader.is_none() {
            record.leader = Some(id);
        }
        if record.leader == Some(id) {
            SquadRole::Leader
        } else {
            SquadRole::Follower
        }
    }

    /// Pick a squad for a fresh spawn: the preferred squad if it exists
    /// and matches the faction, else the first squad of that faction
    /// with room, else a new one.
    pub fn assign(&mut self, faction: Faction, preferred: Option<SquadId>) -> SquadId {
        if let Some(id) = preferred {
            if self.squads.get(&id).is_some_and(|s| s.faction == faction) {
                return id;
            }
        }
        let open = self
            .squads
            .values()
            .filter(|s| s.faction == faction && s.members.len() < SQUAD_CAPACITY)
            .map(|s| (s.id, s.members.len()))
            .min_by_key(|&(id, len)| (len, id.0));
        match open {
            Some((id, _)) => id,
            None => self.create_squad(faction),
        }
    }

    /// Remove a member, promoting the next in line when the leader
    /// falls. Squads emptied out stay on the books with their
    /// objective; a later enroll revives them.
    pub fn discharge(&mut self, squad: SquadId, id: CombatantId) {
        if let Some(record) = self.squads.get_mut(&squad) {
            record.members.retain(|m| *m != id);
            if record.leader == Some(id) {
                record.leader = record.members.first().copied();
            }
        }
    }

    pub fn squad(&self, id: SquadId) -> Option<&Squad> {
        self.squads.get(&id)
    }

    pub fn objective_of(&self, id: SquadId) -> Option<Vec3> {
        self.squads.get(&id).and_then(|s| s.objective)
    }

    /// Direct order from the host, overriding the periodic zone pass
    /// until it next runs.
    pub fn set_objective(&mut self, id: SquadId, objective: Option<Vec3>) {
        if let Some(squad) = self.squads.get_mut(&id) {
            squad.objective = objective;
        }
    }

    pub fn leader_of(&self, id: SquadId) -> Option<CombatantId> {
        self.squads.get(&id).and_then(|s| s.leader)
    }

    pub fn len(&self) -> usize {
        self.squads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.squads.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Squad> {
        self.squads.values()
    }

    /// Replace the whole roster. Leaders not listed among their own
    /// members are demoted to the first member.
    pub fn set_squads(&mut self, squads: Vec<Squad>) {
        self.squads.clear();
        for mut squad in squads {
            if let Some(leader) = squad.leader {
                if !squad.members.contains(&leader) {
                    squad.leader = squad.members.first().copied();
                }
            } else {
                squad.leader = squad.members.first().copied();
            }
            self.next_id = self.next_id.max(squad.id.0);
            self.squads.insert(squad.id, squad);
        }
    }

    /// Full reset on game-mode change. Ids restart; the caller is
    /// expected to re-enroll survivors.
    pub fn reset(&mut self) {
        self.squads.clear();
        self.next_id = 0;
        self.next_objective_pass = 0.0;
    }
}

/// Score a zone for a squad sitting at `centroid`: closer is better,
/// higher priority is better, and zones the squad's own faction holds
/// are deprioritized rather than excluded so empty maps still resolve.
fn zone_score(zone: &crate::hooks::Zone, centroid: Vec3, faction: Faction) -> f32 {
    let dist = centroid.distance(zone.position);
    let hold_penalty = if zone.owner == Some(faction) { 0.25 } else { 1.0 };
    zone.priority.max(0.01) * hold_penalty / (1.0 + dist * 0.01)
}

/// Periodic objective assignment from the host's zone source.
///
/// ## Data Access
/// - Reads: SimClock, SimConfig, Hooks (zones), Position, SquadLink
/// - Writes: SquadRegistry
pub fn squad_objective_system(
    clock: Res<SimClock>,
    config: Res<SimConfig>,
    hooks: Res<Hooks>,
    mut registry: ResMut<SquadRegistry>,
    members: Query<(&Position, &SquadLink)>,
) {
    if clock.now < registry.next_objective_pass {
        return;
    }
    registry.next_objective_pass = clock.now + config.objective_interval as f64;

    let zones = hooks.zones.zones();
    if zones.is_empty() {
        return;
    }

    let mut centroids: HashMap<SquadId, (Vec3, u32)> = HashMap::new();
    for (pos, link) in members.iter() {
        let slot = centroids.entry(link.squad).or_insert((Vec3::ZERO, 0));
        slot.0 += pos.0;
        slot.1 += 1;
    }

    let squad_ids: Vec<SquadId> = registry.squads.keys().copied().collect();
    for id in squad_ids {
        let (faction, centroid) = {
            let squad = &registry.squads[&id];
            let centroid = centroids
                .get(&id)
                .map(|(sum, n)| *sum / (*n as f32).max(1.0))
                .unwrap_or(Vec3::ZERO);
            (squad.faction, centroid)
        };
        let best = zones
            .iter()
            .max_by(|a, b| {
                let sa = zone_score(a, centroid, faction);
                let sb = zone_score(b, centroid, faction);
                sa.partial_cmp(&sb).unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|z| z.position);
        if let Some(squad) = registry.squads.get_mut(&id) {
            squad.objective = best;
        }
    }
}

/// Keeps the role on each combatant's `SquadLink` in step with the
/// registry, so promotions made during discharge show up in behavior
/// the same frame.
///
/// ## Data Access
/// - Reads: CombatantId, SquadRegistry
/// - Writes: SquadLink
pub fn squad_role_system(
    registry: Res<SquadRegistry>,
    mut links: Query<(&CombatantId, &mut SquadLink)>,
) {
    for (id, mut link) in links.iter_mut() {
        let role = if registry.leader_of(link.squad) == Some(*id) {
            SquadRole::Leader
        } else {
            SquadRole::Follower
        };
        if link.role != role {
            link.role = role;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{Zone, ZoneSource};
    use std::sync::Arc;

    #[test]
    fn test_first_member_leads_and_promotion_follows_discharge() {
        let mut registry = SquadRegistry::default();
        let squad = registry.create_squad(Faction::Allied);

        assert_eq!(registry.enroll(squad, CombatantId(1)), SquadRole::Leader);
        assert_eq!(registry.enroll(squad, CombatantId(2)), SquadRole::Follower);
        assert_eq!(registry.enroll(squad, CombatantId(3)), SquadRole::Follower);
        assert_eq!(registry.leader_of(squad), Some(CombatantId(1)));

        registry.discharge(squad, CombatantId(1));
        assert_eq!(registry.leader_of(squad), Some(CombatantId(2)));
        assert_eq!(registry.squad(squad).unwrap().members.len(), 2);

        registry.discharge(squad, CombatantId(2));
        registry.discharge(squad, CombatantId(3));
        assert_eq!(registry.leader_of(squad), None);

        // A revived squad elects its next member.
        assert_eq!(registry.enroll(squad, CombatantId(9)), SquadRole::Leader);
    }

    #[test]
    fn test_assign_fills_open_squads_before_creating_new_ones() {
        let mut registry = SquadRegistry::default();
        let first = registry.assign(Faction::Opfor, None);
        registry.enroll(first, CombatantId(1));

        for n in 2..=SQUAD_CAPACITY as u32 {
            let squad = registry.assign(Faction::Opfor, None);
            assert_eq!(squad, first);
            registry.enroll(squad, CombatantId(n));
        }

        // Full squad: the next spawn opens a new one.
        let second = registry.assign(Faction::Opfor, None);
        assert_ne!(second, first);

        // Wrong-faction preference is ignored.
        let allied = registry.assign(Faction::Allied, Some(first));
        assert_ne!(allied, first);
    }

    #[test]
    fn test_set_squads_replaces_roster_and_fixes_leaders() {
        let mut registry = SquadRegistry::default();
        registry.create_squad(Faction::Allied);

        registry.set_squads(vec![
            Squad {
                id: SquadId(10),
                faction: Faction::Opfor,
                members: vec![CombatantId(5), CombatantId(6)],
                leader: Some(CombatantId(99)),
                objective: None,
            },
            Squad {
                id: SquadId(11),
                faction: Faction::Allied,
                members: vec![CombatantId(7)],
                leader: None,
                objective: Some(Vec3::new(10.0, 0.0, 0.0)),
            },
        ]);

        assert_eq!(registry.len(), 2);
        // Listed leader was not a member: first member takes over.
        assert_eq!(registry.leader_of(SquadId(10)), Some(CombatantId(5)));
        assert_eq!(registry.leader_of(SquadId(11)), Some(CombatantId(7)));
        // Fresh squads allocate past the injected ids.
        let next = registry.create_squad(Faction::Allied);
        assert!(next.0 > 11);
    }

    struct TwoZones;
    impl ZoneSource for TwoZones {
        fn zones(&self) -> Vec<Zone> {
            vec![
                Zone {
                    position: Vec3::new(100.0, 0.0, 0.0),
                    priority: 1.0,
                    owner: Some(Faction::Allied),
                },
                Zone {
                    position: Vec3::new(-40.0, 0.0, 0.0),
                    priority: 1.0,
                    owner: None,
                },
            ]
        }
    }

    #[test]
    fn test_objectives_assigned_on_cadence_and_prefer_uncaptured_zones() {
        let mut world = World::new();
        world.insert_resource(SimConfig::default());
        world.insert_resource(SimClock { now: 0.0, frame: 0 });
        world.insert_resource(Hooks::default().with_zones(Arc::new(TwoZones)));

        let mut registry = SquadRegistry::default();
        let squad = registry.create_squad(Faction::Allied);
        registry.enroll(squad, CombatantId(1));
        world.insert_resource(registry);

        world.spawn((
            Position::new(0.0, 0.0, 0.0),
            SquadLink {
                squad,
                role: SquadRole::Leader,
            },
        ));

        let mut schedule = Schedule::default();
        schedule.add_systems(squad_objective_system);
        schedule.run(&mut world);

        // Own-faction zone is deprioritized; the open one wins.
        let objective = world.resource::<SquadRegistry>().objective_of(squad);
        assert_eq!(objective, Some(Vec3::new(-40.0, 0.0, 0.0)));

        // Within the interval nothing is reassigned.
        world
            .resource_mut::<SquadRegistry>()
            .squads
            .get_mut(&squad)
            .unwrap()
            .objective = None;
        world.resource_mut::<SimClock>().now = 1.0;
        schedule.run(&mut world);
        assert_eq!(world.resource::<SquadRegistry>().objective_of(squad), None);

        // Past the interval the pass runs again.
        world.resource_mut::<SimClock>().now = 6.0;
        schedule.run(&mut world);
        assert!(world
            .resource::<SquadRegistry>()
            .objective_of(squad)
            .is_some());
    }
}
