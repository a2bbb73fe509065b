//! Primary spatial index: a bounded-depth octree over live combatants.
//!
//! Supports point relocation, removal with pruning, exact radius
//! queries and full rebuilds. Query cost is O(log n + k); relocation
//! is O(log n) amortized via a reverse id map.

use bevy_ecs::prelude::*;
use glam::Vec3;
use std::collections::HashMap;

use crate::components::{BehaviorState, CombatantId, Faction, Position};

/// A point recorded in the octree.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OctreeEntry {
    pub id: CombatantId,
    pub pos: Vec3,
    pub faction: Faction,
}

#[derive(Debug)]
enum NodeKind {
    Leaf(Vec<OctreeEntry>),
    Branch([usize; 8]),
}

#[derive(Debug)]
struct Node {
    center: Vec3,
    half: f32,
    depth: u32,
    parent: Option<usize>,
    /// Entries in this subtree.
    count: usize,
    kind: NodeKind,
}

/// Occupancy counters exposed through telemetry.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct OctreeStats {
    pub entries: usize,
    pub nodes: usize,
    pub leaves: usize,
    pub deepest_leaf: u32,
    pub largest_leaf: usize,
}

/// Bounded-depth octree keyed by combatant id.
///
/// A leaf splits once it holds more than `leaf_cap` entries, unless it
/// already sits at `max_depth` - leaves there grow past the cap rather
/// than subdividing forever. Points outside the world bound are clamped
/// into the nearest boundary octant, so resizing the world never loses
/// entries.
#[derive(Resource, Debug)]
pub struct CombatOctree {
    half_extent: f32,
    leaf_cap: usize,
    max_depth: u32,
    nodes: Vec<Node>,
    free: Vec<usize>,
    /// Reverse lookup: id to its recorded point.
    recorded: HashMap<CombatantId, (Vec3, Faction)>,
    /// Largest distance any recorded point lies outside the world
    /// cube. Queries widen their pruning test by this much so points
    /// parked in boundary octants are never missed.
    bound_slack: f32,
}

impl Default for CombatOctree {
    fn default() -> Self {
        Self::new(2000.0, 12, 6)
    }
}

impl CombatOctree {
    pub fn new(half_extent: f32, leaf_cap: usize, max_depth: u32) -> Self {
        let root = Node {
            center: Vec3::ZERO,
            half: half_extent.max(1.0),
            depth: 0,
            parent: None,
            count: 0,
            kind: NodeKind::Leaf(Vec::new()),
        };
        Self {
            half_extent: half_extent.max(1.0),
            leaf_cap: leaf_cap.max(1),
            max_depth,
            nodes: vec![root],
            free: Vec::new(),
            recorded: HashMap::new(),
            bound_slack: 0.0,
        }
    }

    pub fn len(&self) -> usize {
        self.recorded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recorded.is_empty()
    }

    pub fn contains(&self, id: CombatantId) -> bool {
        self.recorded.contains_key(&id)
    }

    pub fn half_extent(&self) -> f32 {
        self.half_extent
    }

    /// Insert `id` at `pos`, or relocate it if already present.
    pub fn update_position(&mut self, id: CombatantId, pos: Vec3, faction: Faction) {
        if let Some(&(old, _)) = self.recorded.get(&id) {
            if old == pos {
                return;
            }
            self.detach(id, old);
        }
        // Euclidean excess, not per-axis: pruning tests Euclidean
        // distance, and a point escaped on several axes lies farther
        // from its boundary leaf than any single axis shows.
        let outside = (pos.abs() - Vec3::splat(self.half_extent))
            .max(Vec3::ZERO)
            .length();
        self.bound_slack = self.bound_slack.max(outside);
        self.attach(id, pos, faction);
        self.recorded.insert(id, (pos, faction));
    }

    /// Evict `id`, pruning any subtree the removal empties.
    pub fn remove(&mut self, id: CombatantId) -> bool {
        match self.recorded.remove(&id) {
            Some((pos, _)) => {
                self.detach(id, pos);
                true
            }
            None => false,
        }
    }

    /// Drop everything and reinsert the given entries, skipping those
    /// whose state is dead. One pass, same results as sequential
    /// `update_position` calls over the living.
    pub fn rebuild<I>(&mut self, entries: I)
    where
        I: IntoIterator<Item = (CombatantId, Vec3, Faction, BehaviorState)>,
    {
        self.clear();
        for (id, pos, faction, state) in entries {
            if state.is_dead() {
                continue;
            }
            self.update_position(id, pos, faction);
        }
    }

    /// Rebuild the bounds around a new half-extent without dropping
    /// any recorded entry.
    pub fn set_world_size(&mut self, half_extent: f32) {
        let kept: Vec<(CombatantId, Vec3, Faction)> = self
            .recorded
            .iter()
            .map(|(&id, &(pos, faction))| (id, pos, faction))
            .collect();
        self.half_extent = half_extent.max(1.0);
        self.clear();
        for (id, pos, faction) in kept {
            self.update_position(id, pos, faction);
        }
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.free.clear();
        self.recorded.clear();
        self.bound_slack = 0.0;
        self.nodes.push(Node {
            center: Vec3::ZERO,
            half: self.half_extent,
            depth: 0,
            parent: None,
            count: 0,
            kind: NodeKind::Leaf(Vec::new()),
        });
    }

    /// All entries within `radius` of `center`, closest first.
    pub fn query_radius(&self, center: Vec3, radius: f32) -> Vec<OctreeEntry> {
        let mut out = Vec::new();
        self.query_radius_into(center, radius, &mut out);
        out
    }

    /// Radius query writing into a caller-owned buffer. The buffer is
    /// cleared first; results come back sorted closest first.
    pub fn query_radius_into(&self, center: Vec3, radius: f32, out: &mut Vec<OctreeEntry>) {
        out.clear();
        if radius < 0.0 {
            return;
        }
        self.collect_sphere(0, center, radius, radius + self.bound_slack, out);
        out.sort_by(|a, b| {
            let da = a.pos.distance_squared(center);
            let db = b.pos.distance_squared(center);
            da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
        });
    }

    /// Entries of the opposing faction within `radius`, closest first.
    pub fn query_hostiles(&self, center: Vec3, radius: f32, faction: Faction) -> Vec<OctreeEntry> {
        let mut out = self.query_radius(center, radius);
        out.retain(|e| e.faction.is_hostile_to(faction));
        out
    }

    pub fn nearest_hostile(&self, center: Vec3, radius: f32, faction: Faction) -> Option<OctreeEntry> {
        self.query_hostiles(center, radius, faction).into_iter().next()
    }

    pub fn stats(&self) -> OctreeStats {
        let mut stats = OctreeStats {
            entries: self.recorded.len(),
            nodes: self.nodes.len() - self.free.len(),
            ..Default::default()
        };
        for (depth, len) in self.leaf_profile() {
            stats.leaves += 1;
            stats.deepest_leaf = stats.deepest_leaf.max(depth);
            stats.largest_leaf = stats.largest_leaf.max(len);
        }
        stats
    }

    /// (depth, occupancy) of every live leaf. Drives the capacity
    /// invariant checks: below `max_depth` no leaf exceeds the cap.
    pub fn leaf_profile(&self) -> Vec<(u32, usize)> {
        let mut out = Vec::new();
        let mut stack = vec![0usize];
        while let Some(idx) = stack.pop() {
            match &self.nodes[idx].kind {
                NodeKind::Leaf(entries) => out.push((self.nodes[idx].depth, entries.len())),
                NodeKind::Branch(children) => stack.extend_from_slice(children),
            }
        }
        out
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    // -- internals ----------------------------------------------------------

    fn octant(center: Vec3, pos: Vec3) -> usize {
        (pos.x >= center.x) as usize
            | ((pos.y >= center.y) as usize) << 1
            | ((pos.z >= center.z) as usize) << 2
    }

    fn alloc(&mut self, node: Node) -> usize {
        match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = node;
                idx
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    /// Descend to the leaf owning `pos`, bumping subtree counts.
    fn attach(&mut self, id: CombatantId, pos: Vec3, faction: Faction) {
        let mut idx = 0;
        loop {
            self.nodes[idx].count += 1;
            match &self.nodes[idx].kind {
                NodeKind::Branch(children) => {
                    idx = children[Self::octant(self.nodes[idx].center, pos)];
                }
                NodeKind::Leaf(_) => break,
            }
        }
        if let NodeKind::Leaf(entries) = &mut self.nodes[idx].kind {
            entries.push(OctreeEntry { id, pos, faction });
        }
        if self.leaf_overfull(idx) {
            self.split(idx);
        }
    }

    fn leaf_overfull(&self, idx: usize) -> bool {
        match &self.nodes[idx].kind {
            NodeKind::Leaf(entries) => {
                entries.len() > self.leaf_cap && self.nodes[idx].depth < self.max_depth
            }
            NodeKind::Branch(_) => false,
        }
    }

    /// Turn a leaf into a branch and push its entries down one level.
    /// Children that end up overfull split in turn, bottoming out at
    /// `max_depth` where leaves absorb the overflow.
    fn split(&mut self, idx: usize) {
        let (center, half, depth) = {
            let n = &self.nodes[idx];
            (n.center, n.half, n.depth)
        };
        let entries = match std::mem::replace(&mut self.nodes[idx].kind, NodeKind::Branch([0; 8])) {
            NodeKind::Leaf(entries) => entries,
            NodeKind::Branch(_) => return,
        };

        let child_half = half * 0.5;
        let mut children = [0usize; 8];
        for (oct, slot) in children.iter_mut().enumerate() {
            let offset = Vec3::new(
                if oct & 1 != 0 { child_half } else { -child_half },
                if oct & 2 != 0 { child_half } else { -child_half },
                if oct & 4 != 0 { child_half } else { -child_half },
            );
            *slot = self.alloc(Node {
                center: center + offset,
                half: child_half,
                depth: depth + 1,
                parent: Some(idx),
                count: 0,
                kind: NodeKind::Leaf(Vec::new()),
            });
        }
        self.nodes[idx].kind = NodeKind::Branch(children);

        let mut overfull = Vec::new();
        for entry in entries {
            let child = children[Self::octant(center, entry.pos)];
            self.nodes[child].count += 1;
            if let NodeKind::Leaf(list) = &mut self.nodes[child].kind {
                list.push(entry);
            }
            if self.leaf_overfull(child) && !overfull.contains(&child) {
                overfull.push(child);
            }
        }
        for child in overfull {
            self.split(child);
        }
    }

    /// Remove `id` from the leaf owning `pos`, decrementing counts and
    /// collapsing any ancestor branch whose subtree went empty.
    fn detach(&mut self, id: CombatantId, pos: Vec3) {
        let mut idx = 0;
        loop {
            self.nodes[idx].count = self.nodes[idx].count.saturating_sub(1);
            match &self.nodes[idx].kind {
                NodeKind::Branch(children) => {
                    idx = children[Self::octant(self.nodes[idx].center, pos)];
                }
                NodeKind::Leaf(_) => break,
            }
        }
        if let NodeKind::Leaf(entries) = &mut self.nodes[idx].kind {
            entries.retain(|e| e.id != id);
        }

        // Prune: walk up and flatten the highest emptied branch.
        let mut cursor = self.nodes[idx].parent;
        let mut collapse: Option<usize> = None;
        while let Some(p) = cursor {
            if self.nodes[p].count == 0 {
                collapse = Some(p);
            }
            cursor = self.nodes[p].parent;
        }
        if let Some(p) = collapse {
            self.free_children(p);
            self.nodes[p].kind = NodeKind::Leaf(Vec::new());
        }
    }

    fn free_children(&mut self, idx: usize) {
        let children = match &self.nodes[idx].kind {
            NodeKind::Branch(children) => *children,
            NodeKind::Leaf(_) => return,
        };
        for child in children {
            self.free_children(child);
            self.nodes[child].kind = NodeKind::Leaf(Vec::new());
            self.free.push(child);
        }
    }

    fn collect_sphere(
        &self,
        idx: usize,
        center: Vec3,
        radius: f32,
        prune_radius: f32,
        out: &mut Vec<OctreeEntry>,
    ) {
        let node = &self.nodes[idx];
        if node.count == 0 || !sphere_meets_cube(center, prune_radius, node.center, node.half) {
            return;
        }
        match &node.kind {
            NodeKind::Leaf(entries) => {
                let r_sq = radius * radius;
                for entry in entries {
                    if entry.pos.distance_squared(center) <= r_sq {
                        out.push(*entry);
                    }
                }
            }
            NodeKind::Branch(children) => {
                for &child in children {
                    self.collect_sphere(child, center, radius, prune_radius, out);
                }
            }
        }
    }
}

/// Sphere vs axis-aligned cube overlap.
fn sphere_meets_cube(center: Vec3, radius: f32, cube_center: Vec3, half: f32) -> bool {
    let dx = ((center.x - cube_center.x).abs() - half).max(0.0);
    let dy = ((center.y - cube_center.y).abs() - half).max(0.0);
    let dz = ((center.z - cube_center.z).abs() - half).max(0.0);
    dx * dx + dy * dy + dz * dz <= radius * radius
}

/// Relocates moved combatants after the movement phase. Insertion and
/// death eviction happen explicitly in spawn/cleanup paths, so this
/// only chases position changes of the living.
pub fn octree_update_system(
    mut octree: ResMut<CombatOctree>,
    moved: Query<(&CombatantId, &Position, &Faction, &BehaviorState), Changed<Position>>,
) {
    for (id, pos, faction, state) in moved.iter() {
        if state.is_dead() {
            continue;
        }
        octree.update_position(*id, pos.0, *faction);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn id(n: u32) -> CombatantId {
        CombatantId(n)
    }

    fn ids(entries: &[OctreeEntry]) -> Vec<CombatantId> {
        let mut out: Vec<CombatantId> = entries.iter().map(|e| e.id).collect();
        out.sort();
        out
    }

    #[test]
    fn test_query_returns_exactly_points_in_radius() {
        let mut tree = CombatOctree::new(2000.0, 12, 6);
        let mut rng = ChaCha8Rng::seed_from_u64(7);

        let mut points = Vec::new();
        for n in 0..500 {
            let p = Vec3::new(
                rng.gen_range(-2000.0..2000.0),
                rng.gen_range(0.0..80.0),
                rng.gen_range(-2000.0..2000.0),
            );
            points.push((id(n), p));
            tree.update_position(id(n), p, Faction::Opfor);
        }

        let hits = tree.query_radius(Vec3::ZERO, 50.0);
        let expected: Vec<CombatantId> = {
            let mut v: Vec<CombatantId> = points
                .iter()
                .filter(|(_, p)| p.length() <= 50.0)
                .map(|(i, _)| *i)
                .collect();
            v.sort();
            v
        };
        assert_eq!(ids(&hits), expected);

        // Capacity invariant: only max-depth leaves may exceed the cap.
        for (depth, len) in tree.leaf_profile() {
            if depth < tree.max_depth() {
                assert!(len <= 12, "leaf at depth {depth} holds {len}");
            }
        }
    }

    #[test]
    fn test_query_is_insertion_order_independent() {
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let points: Vec<(CombatantId, Vec3)> = (0..200)
            .map(|n| {
                (
                    id(n),
                    Vec3::new(
                        rng.gen_range(-500.0..500.0),
                        rng.gen_range(0.0..30.0),
                        rng.gen_range(-500.0..500.0),
                    ),
                )
            })
            .collect();

        let mut forward = CombatOctree::new(600.0, 8, 5);
        for (i, p) in &points {
            forward.update_position(*i, *p, Faction::Allied);
        }
        let mut reverse = CombatOctree::new(600.0, 8, 5);
        for (i, p) in points.iter().rev() {
            reverse.update_position(*i, *p, Faction::Allied);
        }

        for center in [Vec3::ZERO, Vec3::new(120.0, 5.0, -300.0), Vec3::new(-444.0, 0.0, 17.0)] {
            assert_eq!(
                ids(&forward.query_radius(center, 90.0)),
                ids(&reverse.query_radius(center, 90.0)),
            );
        }
    }

    #[test]
    fn test_removed_id_never_returned() {
        let mut tree = CombatOctree::new(100.0, 4, 4);
        for n in 0..30 {
            tree.update_position(id(n), Vec3::new(n as f32, 0.0, 0.0), Faction::Opfor);
        }
        assert!(tree.remove(id(7)));
        assert!(!tree.remove(id(7)));

        for radius in [1.0, 10.0, 500.0] {
            let hits = tree.query_radius(Vec3::new(7.0, 0.0, 0.0), radius);
            assert!(hits.iter().all(|e| e.id != id(7)));
        }
        assert_eq!(tree.len(), 29);
    }

    #[test]
    fn test_relocation_moves_the_point() {
        let mut tree = CombatOctree::new(1000.0, 4, 5);
        tree.update_position(id(1), Vec3::new(-900.0, 0.0, -900.0), Faction::Allied);
        tree.update_position(id(1), Vec3::new(900.0, 0.0, 900.0), Faction::Allied);

        assert!(tree.query_radius(Vec3::new(-900.0, 0.0, -900.0), 50.0).is_empty());
        let hits = tree.query_radius(Vec3::new(900.0, 0.0, 900.0), 50.0);
        assert_eq!(ids(&hits), vec![id(1)]);
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_rebuild_matches_sequential_inserts_and_skips_dead() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let rows: Vec<(CombatantId, Vec3, Faction, BehaviorState)> = (0..120)
            .map(|n| {
                let state = if n % 5 == 0 {
                    BehaviorState::Dead
                } else {
                    BehaviorState::Idle
                };
                (
                    id(n),
                    Vec3::new(rng.gen_range(-300.0..300.0), 0.0, rng.gen_range(-300.0..300.0)),
                    Faction::Opfor,
                    state,
                )
            })
            .collect();

        let mut rebuilt = CombatOctree::new(400.0, 6, 5);
        rebuilt.rebuild(rows.clone());

        let mut sequential = CombatOctree::new(400.0, 6, 5);
        for (i, p, f, state) in &rows {
            if !state.is_dead() {
                sequential.update_position(*i, *p, *f);
            }
        }

        assert_eq!(rebuilt.len(), sequential.len());
        let hits = rebuilt.query_radius(Vec3::ZERO, 1000.0);
        assert_eq!(ids(&hits), ids(&sequential.query_radius(Vec3::ZERO, 1000.0)));
        assert!(hits.iter().all(|e| e.id.0 % 5 != 0));
    }

    #[test]
    fn test_max_depth_leaf_absorbs_overflow() {
        let mut tree = CombatOctree::new(64.0, 2, 3);
        // All at one point: subdivision cannot separate them.
        for n in 0..40 {
            tree.update_position(id(n), Vec3::new(10.0, 10.0, 10.0), Faction::Allied);
        }
        assert_eq!(tree.len(), 40);
        let profile = tree.leaf_profile();
        let fat: Vec<_> = profile.iter().filter(|(_, len)| *len > 2).collect();
        assert_eq!(fat.len(), 1);
        assert_eq!(fat[0].0, 3);
        assert_eq!(fat[0].1, 40);
        assert_eq!(tree.query_radius(Vec3::new(10.0, 10.0, 10.0), 1.0).len(), 40);
    }

    #[test]
    fn test_resize_keeps_entries() {
        let mut tree = CombatOctree::new(100.0, 4, 4);
        for n in 0..25 {
            tree.update_position(
                id(n),
                Vec3::new(n as f32 * 3.0, 0.0, -(n as f32)),
                Faction::Opfor,
            );
        }
        tree.set_world_size(5000.0);
        assert_eq!(tree.len(), 25);
        assert_eq!(tree.half_extent(), 5000.0);
        assert_eq!(tree.query_radius(Vec3::ZERO, 200.0).len(), 25);
    }

    #[test]
    fn test_out_of_bounds_points_remain_queryable() {
        let mut tree = CombatOctree::new(100.0, 4, 4);
        tree.update_position(id(1), Vec3::new(350.0, 0.0, 0.0), Faction::Opfor);
        tree.update_position(id(2), Vec3::ZERO, Faction::Opfor);
        // Escaped on two and three axes: the boundary leaf holding the
        // point sits a full diagonal away, not one axis excess.
        tree.update_position(id(3), Vec3::new(350.0, 0.0, 350.0), Faction::Opfor);
        tree.update_position(id(4), Vec3::new(-300.0, 260.0, 310.0), Faction::Opfor);

        for (who, center) in [
            (id(1), Vec3::new(350.0, 0.0, 0.0)),
            (id(2), Vec3::ZERO),
            (id(3), Vec3::new(350.0, 0.0, 350.0)),
            (id(4), Vec3::new(-300.0, 260.0, 310.0)),
        ] {
            let hits = tree.query_radius(center, 5.0);
            assert_eq!(ids(&hits), vec![who], "self-query at {center} missed");
        }
    }

    #[test]
    fn test_world_shrink_keeps_live_points_queryable() {
        let mut tree = CombatOctree::new(1000.0, 4, 4);
        tree.update_position(id(1), Vec3::new(600.0, 40.0, -600.0), Faction::Allied);
        tree.update_position(id(2), Vec3::new(-30.0, 0.0, 10.0), Faction::Allied);

        tree.set_world_size(50.0);
        assert_eq!(tree.len(), 2);
        let hits = tree.query_radius(Vec3::new(600.0, 40.0, -600.0), 5.0);
        assert_eq!(ids(&hits), vec![id(1)]);
        let hits = tree.query_radius(Vec3::new(-30.0, 0.0, 10.0), 5.0);
        assert_eq!(ids(&hits), vec![id(2)]);
    }

    #[test]
    fn test_pruning_collapses_emptied_subtrees() {
        let mut tree = CombatOctree::new(128.0, 1, 5);
        for n in 0..16 {
            tree.update_position(
                id(n),
                Vec3::new(60.0 + (n as f32) * 0.5, 60.0, 60.0),
                Faction::Allied,
            );
        }
        let before = tree.stats().nodes;
        assert!(before > 1);
        for n in 0..16 {
            tree.remove(id(n));
        }
        let after = tree.stats();
        assert_eq!(after.entries, 0);
        assert!(after.nodes < before);
        assert!(tree.query_radius(Vec3::new(60.0, 60.0, 60.0), 500.0).is_empty());
    }
}
