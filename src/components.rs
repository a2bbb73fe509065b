//! ECS components for the Frontline combatant simulation.
//!
//! Components are pure data containers attached to entities.
//! All behavior lives in systems that query these components; each
//! phase of the frame pipeline owns a disjoint set of them.

use bevy_ecs::prelude::*;
use glam::Vec3;
use serde::{Deserialize, Serialize};

// ============================================================================
// IDENTITY COMPONENTS
// ============================================================================

/// Stable public identifier for a combatant. Never reused while the
/// combatant lives; everything outside the ECS refers to combatants
/// by this id, never by their entity slot.
#[derive(Component, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CombatantId(pub u32);

/// Faction/side identifier.
#[derive(Component, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Faction {
    Allied,
    Opfor,
}

impl Default for Faction {
    fn default() -> Self {
        Self::Opfor
    }
}

impl Faction {
    pub fn is_hostile_to(&self, other: Faction) -> bool {
        *self != other
    }

    pub fn opponent(&self) -> Faction {
        match self {
            Faction::Allied => Faction::Opfor,
            Faction::Opfor => Faction::Allied,
        }
    }
}

/// Unique identifier for a squad.
#[derive(Component, Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SquadId(pub u32);

/// Role within a squad.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SquadRole {
    Leader,
    Follower,
}

/// Squad membership. Optional: unattached combatants fight alone.
#[derive(Component, Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SquadLink {
    pub squad: SquadId,
    pub role: SquadRole,
}

// ============================================================================
// KINEMATIC COMPONENTS
// ============================================================================

/// World-space position (y is up).
#[derive(Component, Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Position(pub Vec3);

impl Position {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self(Vec3::new(x, y, z))
    }

    pub fn distance_to(&self, other: &Position) -> f32 {
        self.0.distance(other.0)
    }

    /// Horizontal distance, ignoring height difference.
    pub fn ground_distance_to(&self, other: &Position) -> f32 {
        let dx = self.0.x - other.0.x;
        let dz = self.0.z - other.0.z;
        (dx * dx + dz * dz).sqrt()
    }
}

/// World-space velocity in units per second.
#[derive(Component, Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Velocity(pub Vec3);

impl Velocity {
    pub fn speed(&self) -> f32 {
        self.0.length()
    }
}

/// Facing state. `yaw` is where the combatant aims; `visual_yaw`
/// chases it at `turn_rate` so renderers never see snap turns.
#[derive(Component, Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Orientation {
    pub yaw: f32,
    pub visual_yaw: f32,
    /// Radians per second.
    pub turn_rate: f32,
}

impl Default for Orientation {
    fn default() -> Self {
        Self {
            yaw: 0.0,
            visual_yaw: 0.0,
            turn_rate: 6.0,
        }
    }
}

impl Orientation {
    /// Advance visual yaw toward the aim yaw by at most `turn_rate * dt`,
    /// taking the short way around the circle.
    pub fn settle(&mut self, dt: f32) {
        let mut diff = self.yaw - self.visual_yaw;
        while diff > std::f32::consts::PI {
            diff -= std::f32::consts::TAU;
        }
        while diff < -std::f32::consts::PI {
            diff += std::f32::consts::TAU;
        }
        let max_step = self.turn_rate * dt;
        self.visual_yaw += diff.clamp(-max_step, max_step);
    }
}

/// Model scale. Also stretches the head band used by hit resolution.
#[derive(Component, Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Scale(pub f32);

impl Default for Scale {
    fn default() -> Self {
        Self(1.0)
    }
}

// ============================================================================
// VITALS
// ============================================================================

/// Health of a combatant.
#[derive(Component, Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Health {
    pub current: f32,
    pub max: f32,
}

impl Health {
    pub fn new(max: f32) -> Self {
        Self { current: max, max }
    }

    /// Start below full, clamped into `[0, max]`.
    pub fn with_current(current: f32, max: f32) -> Self {
        Self {
            current: current.clamp(0.0, max),
            max,
        }
    }

    pub fn fraction(&self) -> f32 {
        if self.max <= 0.0 {
            0.0
        } else {
            (self.current / self.max).clamp(0.0, 1.0)
        }
    }

    pub fn is_alive(&self) -> bool {
        self.current > 0.0
    }

    pub fn damage(&mut self, amount: f32) {
        self.current = (self.current - amount).max(0.0);
    }
}

impl Default for Health {
    fn default() -> Self {
        Self::new(100.0)
    }
}

/// Lifetime tallies, reported through the telemetry surface.
#[derive(Component, Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CombatRecord {
    pub kills: u32,
    pub deaths: u32,
}

// ============================================================================
// BEHAVIOR COMPONENTS
// ============================================================================

/// Finite behavior state. `Dead` is terminal: `transition_to` refuses
/// to leave it, so no system can resurrect a combatant by accident.
#[derive(Component, Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum BehaviorState {
    #[default]
    Idle,
    Moving,
    Engaging,
    Suppressed,
    Dead,
}

impl BehaviorState {
    pub fn is_dead(&self) -> bool {
        matches!(self, BehaviorState::Dead)
    }

    /// Apply a transition, preserving death as terminal.
    pub fn transition_to(&mut self, next: BehaviorState) {
        if !self.is_dead() {
            *self = next;
        }
    }
}

/// Weapon archetype, fixing the ballistic constants below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WeaponKind {
    #[default]
    Rifle,
    Carbine,
    Marksman,
}

/// Static weapon tuning. Cooldowns derive from rounds-per-minute;
/// bursts pause for `burst_rest` seconds after `burst_len` rounds.
#[derive(Component, Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WeaponSpec {
    pub kind: WeaponKind,
    pub rounds_per_minute: f32,
    pub damage: f32,
    pub range: f32,
    pub headshot_multiplier: f32,
    pub burst_len: u32,
    pub burst_rest: f32,
    /// Base miss spread in radians at full range.
    pub spread: f32,
}

impl WeaponSpec {
    pub fn rifle() -> Self {
        Self {
            kind: WeaponKind::Rifle,
            rounds_per_minute: 420.0,
            damage: 14.0,
            range: 110.0,
            headshot_multiplier: 2.5,
            burst_len: 4,
            burst_rest: 0.7,
            spread: 0.035,
        }
    }

    pub fn carbine() -> Self {
        Self {
            kind: WeaponKind::Carbine,
            rounds_per_minute: 560.0,
            damage: 10.0,
            range: 80.0,
            headshot_multiplier: 2.2,
            burst_len: 5,
            burst_rest: 0.5,
            spread: 0.05,
        }
    }

    pub fn marksman() -> Self {
        Self {
            kind: WeaponKind::Marksman,
            rounds_per_minute: 90.0,
            damage: 38.0,
            range: 220.0,
            headshot_multiplier: 3.0,
            burst_len: 1,
            burst_rest: 0.0,
            spread: 0.012,
        }
    }

    /// Seconds between individual rounds.
    pub fn shot_cooldown(&self) -> f32 {
        60.0 / self.rounds_per_minute.max(1.0)
    }
}

impl Default for WeaponSpec {
    fn default() -> Self {
        Self::rifle()
    }
}

/// Per-combatant fire timers, owned by the combat phase.
#[derive(Component, Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct FireControl {
    /// Sim time of the last round fired.
    pub last_shot: f64,
    /// Rounds fired in the current burst.
    pub burst_shots: u32,
    /// Sim time until which the weapon rests between bursts.
    pub burst_rest_until: f64,
    /// Sim time until which a fresh target may not be fired on.
    pub reaction_until: f64,
    pub consecutive_misses: u32,
}

impl FireControl {
    /// True when rate-of-fire, burst rest and reaction delay all allow
    /// a round at `now`.
    pub fn ready(&self, now: f64, cooldown: f32) -> bool {
        now >= self.last_shot + cooldown as f64
            && now >= self.burst_rest_until
            && now >= self.reaction_until
    }

    pub fn record_shot(&mut self, now: f64, weapon: &WeaponSpec) {
        self.last_shot = now;
        self.burst_shots += 1;
        if self.burst_shots >= weapon.burst_len.max(1) {
            self.burst_shots = 0;
            self.burst_rest_until = now + weapon.burst_rest as f64;
        }
    }
}

/// Marksmanship and temperament, fixed at spawn.
#[derive(Component, Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SkillProfile {
    /// 0.0 - 1.0, scales hit probability.
    pub accuracy: f32,
    /// Seconds from spotting a target to the first shot.
    pub reaction: f32,
    /// 0.0 defensive - 1.0 reckless; biases advance-vs-hold choices.
    pub aggression: f32,
}

impl Default for SkillProfile {
    fn default() -> Self {
        Self {
            accuracy: 0.55,
            reaction: 0.4,
            aggression: 0.5,
        }
    }
}

/// Stress state: suppression from incoming fire, panic from damage,
/// and the alert window that keeps a combatant scanning after contact.
#[derive(Component, Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Nerves {
    /// 0.0 calm - 1.0+ pinned.
    pub suppression: f32,
    /// 0.0 steady - 1.0 broken.
    pub panic: f32,
    /// Sim time until which the combatant stays alert.
    pub alert_until: f64,
}

impl Nerves {
    pub fn suppress(&mut self, amount: f32) {
        self.suppression += amount;
    }

    pub fn decay(&mut self, rate: f32, dt: f32) {
        self.suppression = (self.suppression - rate * dt).max(0.0);
        self.panic = (self.panic - rate * 0.5 * dt).max(0.0);
    }

    pub fn is_suppressed(&self) -> bool {
        self.suppression >= 0.5
    }

    pub fn is_pinned(&self) -> bool {
        self.suppression >= 1.0
    }

    pub fn is_panicked(&self) -> bool {
        self.panic >= 0.7
    }
}

/// Idle drift: current heading and when to pick a new one.
#[derive(Component, Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Wander {
    pub heading: f32,
    pub next_turn_at: f64,
}

/// Transient disorientation (flashbangs, near misses by explosions).
/// Expired when `until <= now`; a zero default means never dazed.
#[derive(Component, Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Daze {
    pub until: f64,
}

impl Daze {
    pub fn active(&self, now: f64) -> bool {
        self.until > now
    }
}

/// Attached when a combatant dies, recording when. The spawn phase
/// clears the corpse once the field-cleanup delay passes.
#[derive(Component, Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Fallen {
    pub at: f64,
}

/// Last target the combatant committed to, with where it was last
/// seen. Survives frames where the perception budget runs dry.
#[derive(Component, Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Engagement {
    pub target: Option<CombatantId>,
    pub last_seen: Option<Vec3>,
    pub acquired_at: f64,
}

impl Engagement {
    pub fn drop_target(&mut self) {
        self.target = None;
        self.last_seen = None;
    }
}

/// Where the AI wants the combatant to go this step. `None` holds
/// position. Movement consumes this; AI produces it.
#[derive(Component, Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MoveIntent {
    pub destination: Option<Vec3>,
    /// Units per second when a destination is set.
    pub speed: f32,
}

// ============================================================================
// SCHEDULING COMPONENTS
// ============================================================================

/// Distance-derived update tier. Recomputed every frame; a pure
/// function of distance-to-player and configured thresholds.
#[derive(Component, Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum LodTier {
    #[default]
    High,
    Medium,
    Low,
    /// No simulation beyond a position hold.
    Culled,
}

impl LodTier {
    pub fn is_culled(&self) -> bool {
        matches!(self, LodTier::Culled)
    }
}

/// Scheduling state. The scheduler writes it every frame; the AI,
/// movement and combat phases read `due`/`step_dt` to decide whether
/// and how far to advance this combatant.
#[derive(Component, Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct UpdateClock {
    /// Sim time of the last full step.
    pub last_update: f64,
    pub priority: f32,
    /// Granted a full step this frame.
    pub due: bool,
    /// Seconds of sim time this step covers (capped gap since the
    /// last step).
    pub step_dt: f32,
}

// ============================================================================
// BUNDLE HELPERS
// ============================================================================

/// Everything a live combatant carries. Squad membership is attached
/// separately since unattached combatants are legal.
#[derive(Bundle, Default)]
pub struct CombatantBundle {
    pub id: CombatantId,
    pub faction: Faction,
    pub position: Position,
    pub velocity: Velocity,
    pub orientation: Orientation,
    pub scale: Scale,
    pub health: Health,
    pub record: CombatRecord,
    pub state: BehaviorState,
    pub weapon: WeaponSpec,
    pub fire: FireControl,
    pub skill: SkillProfile,
    pub nerves: Nerves,
    pub wander: Wander,
    pub daze: Daze,
    pub engagement: Engagement,
    pub intent: MoveIntent,
    pub tier: LodTier,
    pub clock: UpdateClock,
}

impl Default for CombatantId {
    fn default() -> Self {
        Self(0)
    }
}

impl CombatantBundle {
    pub fn new(id: CombatantId, faction: Faction, position: Vec3, health: f32) -> Self {
        Self {
            id,
            faction,
            position: Position(position),
            health: Health::with_current(health, Health::default().max),
            ..Default::default()
        }
    }
}
