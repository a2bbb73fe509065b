//! Secondary spatial index serving the external hit-detection path.
//!
//! A uniform hash grid owned by the sim world and passed by handle;
//! consumers outside the LOD pipeline (player weapons, external
//! projectile systems) resolve hits against it without walking the
//! entity store. It mirrors the primary index through explicit sync
//! calls, so its staleness is bounded by the last sync this frame.
//!
//! Queries return `None` until `initialize` has run; callers fall back
//! to a linear scan and say so via `note_fallback`, which keeps the
//! degradation visible in telemetry.

use bevy_ecs::prelude::*;
use glam::Vec3;
use serde::Serialize;
use std::collections::HashMap;

use crate::components::{BehaviorState, CombatantId, Position};

/// A combatant hit along a ray, nearest first in query results.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RayHit {
    pub id: CombatantId,
    pub pos: Vec3,
    /// Distance from the ray origin to the closest approach point.
    pub distance: f32,
}

/// Usage counters exposed through telemetry.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct HitCacheStats {
    pub initialized: bool,
    pub entries: usize,
    /// Queries answered by a caller-side linear scan instead.
    pub fallback_scans: u64,
    /// Sync calls that arrived before `initialize`.
    pub missed_syncs: u64,
}

/// Shared hit-detection cache.
#[derive(Resource, Debug)]
pub struct HitCache {
    cell_size: f32,
    initialized: bool,
    cells: HashMap<(i32, i32, i32), Vec<(CombatantId, Vec3)>>,
    entity_cells: HashMap<CombatantId, (i32, i32, i32)>,
    fallback_scans: u64,
    missed_syncs: u64,
}

impl Default for HitCache {
    fn default() -> Self {
        Self {
            cell_size: 32.0,
            initialized: false,
            cells: HashMap::new(),
            entity_cells: HashMap::new(),
            fallback_scans: 0,
            missed_syncs: 0,
        }
    }
}

impl HitCache {
    /// Size the grid for a world of the given full extent and start
    /// accepting syncs. Existing entries are dropped.
    pub fn initialize(&mut self, world_size: f32) {
        self.cell_size = (world_size / 64.0).clamp(8.0, 64.0);
        self.cells.clear();
        self.entity_cells.clear();
        self.initialized = true;
    }

    /// Drop every entry but keep configuration and counters.
    pub fn reset(&mut self) {
        self.cells.clear();
        self.entity_cells.clear();
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn len(&self) -> usize {
        self.entity_cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entity_cells.is_empty()
    }

    fn cell_of(&self, pos: Vec3) -> (i32, i32, i32) {
        (
            (pos.x / self.cell_size).floor() as i32,
            (pos.y / self.cell_size).floor() as i32,
            (pos.z / self.cell_size).floor() as i32,
        )
    }

    /// Record or relocate one combatant. Returns false (and counts the
    /// miss) when the cache has not been initialized.
    pub fn sync_entity(&mut self, id: CombatantId, pos: Vec3) -> bool {
        if !self.initialized {
            self.missed_syncs += 1;
            return false;
        }
        let cell = self.cell_of(pos);
        if let Some(&old_cell) = self.entity_cells.get(&id) {
            if old_cell != cell {
                if let Some(entries) = self.cells.get_mut(&old_cell) {
                    entries.retain(|(e, _)| *e != id);
                }
            } else if let Some(entries) = self.cells.get_mut(&cell) {
                for slot in entries.iter_mut() {
                    if slot.0 == id {
                        slot.1 = pos;
                        return true;
                    }
                }
            }
        }
        self.cells.entry(cell).or_default().push((id, pos));
        self.entity_cells.insert(id, cell);
        true
    }

    /// Bulk sync; the caller decides which ids to include (the dedup
    /// policy lives in the orchestrator, not here).
    pub fn sync_all_positions<I>(&mut self, entries: I)
    where
        I: IntoIterator<Item = (CombatantId, Vec3)>,
    {
        for (id, pos) in entries {
            self.sync_entity(id, pos);
        }
    }

    pub fn remove_entity(&mut self, id: CombatantId) -> bool {
        match self.entity_cells.remove(&id) {
            Some(cell) => {
                if let Some(entries) = self.cells.get_mut(&cell) {
                    entries.retain(|(e, _)| *e != id);
                    if entries.is_empty() {
                        self.cells.remove(&cell);
                    }
                }
                true
            }
            None => false,
        }
    }

    /// Everything currently recorded, sorted by id. Mainly for
    /// comparing cache contents across sync policies.
    pub fn entries(&self) -> Vec<(CombatantId, Vec3)> {
        let mut all: Vec<(CombatantId, Vec3)> = self
            .cells
            .values()
            .flat_map(|cell| cell.iter().copied())
            .collect();
        all.sort_by_key(|(id, _)| *id);
        all
    }

    /// All recorded combatants within `radius`, closest first, or
    /// `None` before initialization.
    pub fn query_radius(&self, center: Vec3, radius: f32) -> Option<Vec<(CombatantId, Vec3)>> {
        if !self.initialized {
            return None;
        }
        let reach = (radius / self.cell_size).ceil() as i32 + 1;
        let home = self.cell_of(center);
        let r_sq = radius * radius;

        let mut out = Vec::new();
        for dx in -reach..=reach {
            for dy in -reach..=reach {
                for dz in -reach..=reach {
                    let cell = (home.0 + dx, home.1 + dy, home.2 + dz);
                    if let Some(entries) = self.cells.get(&cell) {
                        for &(id, pos) in entries {
                            if pos.distance_squared(center) <= r_sq {
                                out.push((id, pos));
                            }
                        }
                    }
                }
            }
        }
        out.sort_by(|a, b| {
            let da = a.1.distance_squared(center);
            let db = b.1.distance_squared(center);
            da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
        });
        Some(out)
    }

    /// Combatants within `tolerance` of the ray segment, nearest entry
    /// point first, or `None` before initialization.
    ///
    /// Candidates come from radius gathers at samples spaced one cell
    /// apart; the gather radius covers the inter-sample gap, then an
    /// exact point-to-segment test decides, so step size never causes
    /// misses.
    pub fn query_ray(
        &self,
        origin: Vec3,
        dir: Vec3,
        max_dist: f32,
        tolerance: f32,
    ) -> Option<Vec<RayHit>> {
        if !self.initialized {
            return None;
        }
        let dir = dir.normalize_or_zero();
        if dir == Vec3::ZERO || max_dist <= 0.0 {
            return Some(Vec::new());
        }

        let step = self.cell_size.max(1.0);
        let gather = tolerance + step * 0.5 + f32::EPSILON;
        let mut hits: Vec<RayHit> = Vec::new();
        let mut seen: Vec<CombatantId> = Vec::new();

        let mut t: f32 = 0.0;
        loop {
            let sample = origin + dir * t.min(max_dist);
            if let Some(candidates) = self.query_radius(sample, gather) {
                for (id, pos) in candidates {
                    if seen.contains(&id) {
                        continue;
                    }
                    seen.push(id);
                    let along = (pos - origin).dot(dir).clamp(0.0, max_dist);
                    let closest = origin + dir * along;
                    if pos.distance(closest) <= tolerance {
                        hits.push(RayHit {
                            id,
                            pos,
                            distance: along,
                        });
                    }
                }
            }
            if t >= max_dist {
                break;
            }
            t += step;
        }

        hits.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Some(hits)
    }

    /// A caller answered a query with a linear scan because this cache
    /// was unavailable.
    pub fn note_fallback(&mut self) {
        self.fallback_scans += 1;
    }

    pub fn stats(&self) -> HitCacheStats {
        HitCacheStats {
            initialized: self.initialized,
            entries: self.entity_cells.len(),
            fallback_scans: self.fallback_scans,
            missed_syncs: self.missed_syncs,
        }
    }
}

/// Mid-frame sync for combatants that actually moved. With the
/// deduplicated end-of-frame sync enabled this is the only write path
/// for stepped combatants, so it runs right after movement while the
/// change ticks still mark them.
///
/// ## Data Access
/// - Reads: CombatantId, Position (changed), BehaviorState
/// - Writes: HitCache
pub fn hitcache_touch_system(
    mut cache: ResMut<HitCache>,
    moved: Query<(&CombatantId, &Position, &BehaviorState), Changed<Position>>,
) {
    if !cache.is_initialized() {
        return;
    }
    for (id, pos, state) in moved.iter() {
        if state.is_dead() {
            continue;
        }
        cache.sync_entity(*id, pos.0);
    }
}
