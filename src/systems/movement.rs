//! Movement: steering from AI intent, velocity integration, terrain
//! grounding and visual facing.
//!
//! Movement never touches the spatial indices; the octree refresh runs
//! after this phase and chases position changes.

use bevy_ecs::prelude::*;

use crate::components::{
    BehaviorState, LodTier, MoveIntent, Nerves, Orientation, Position, UpdateClock, Velocity,
};
use crate::hooks::Hooks;

/// Height of a standing combatant's origin above the ground sample.
pub(crate) const STAND_OFFSET: f32 = 1.0;
/// Within this range of a destination the combatant has arrived.
const ARRIVE_RADIUS: f32 = 1.5;
/// Speed fraction while suppressed but not pinned.
const SUPPRESSED_SPEED: f32 = 0.4;

/// Render-tick delta time for the current frame (clamped by the
/// orchestrator before it gets here).
#[derive(Resource, Default)]
pub struct DeltaTime(pub f32);

/// Converts movement intent into velocity for stepped combatants.
///
/// ## Data Access
/// - Reads: Position, MoveIntent, Nerves, BehaviorState, UpdateClock
/// - Writes: Velocity
pub fn steering_system(
    mut query: Query<(
        &Position,
        &MoveIntent,
        &Nerves,
        &BehaviorState,
        &UpdateClock,
        &mut Velocity,
    )>,
) {
    for (pos, intent, nerves, state, uc, mut vel) in query.iter_mut() {
        if state.is_dead() || !uc.due {
            continue;
        }
        if nerves.is_pinned() {
            vel.0 = glam::Vec3::ZERO;
            continue;
        }
        match intent.destination {
            None => vel.0 = glam::Vec3::ZERO,
            Some(dest) => {
                let mut to = dest - pos.0;
                to.y = 0.0;
                let dist = to.length();
                if dist < ARRIVE_RADIUS {
                    vel.0 = glam::Vec3::ZERO;
                } else {
                    let speed = if nerves.is_suppressed() {
                        intent.speed * SUPPRESSED_SPEED
                    } else {
                        intent.speed
                    };
                    vel.0 = to / dist * speed;
                }
            }
        }
    }
}

/// Integrates velocity over the step span and clamps to the terrain
/// height plus the standing offset. Aim yaw follows the heading.
///
/// ## Data Access
/// - Reads: Velocity, BehaviorState, UpdateClock, Hooks (terrain)
/// - Writes: Position, Orientation
pub fn movement_system(
    hooks: Res<Hooks>,
    mut query: Query<(
        &Velocity,
        &BehaviorState,
        &UpdateClock,
        &mut Position,
        &mut Orientation,
    )>,
) {
    for (vel, state, uc, mut pos, mut ori) in query.iter_mut() {
        if state.is_dead() || !uc.due {
            continue;
        }
        if vel.0 != glam::Vec3::ZERO {
            pos.0 += vel.0 * uc.step_dt;
            if vel.speed() > 0.1 {
                ori.yaw = vel.0.x.atan2(vel.0.z);
            }
        }
        let ground = hooks.terrain.height_at(pos.0.x, pos.0.z);
        let grounded_y = ground + STAND_OFFSET;
        if (pos.0.y - grounded_y).abs() > f32::EPSILON {
            pos.0.y = grounded_y;
        }
    }
}

/// Culled combatants hold: velocity zeroed so a later step does not
/// integrate motion that never happened.
///
/// ## Data Access
/// - Reads: LodTier
/// - Writes: Velocity
pub fn position_hold_system(mut query: Query<(&LodTier, &mut Velocity)>) {
    for (tier, mut vel) in query.iter_mut() {
        if tier.is_culled() && vel.0 != glam::Vec3::ZERO {
            vel.0 = glam::Vec3::ZERO;
        }
    }
}

/// Eases visual yaw toward aim yaw every frame for everything the
/// camera might see. Runs on render dt, not step dt.
///
/// ## Data Access
/// - Reads: BehaviorState, LodTier, DeltaTime
/// - Writes: Orientation
pub fn visual_settle_system(
    dt: Res<DeltaTime>,
    mut query: Query<(&BehaviorState, &LodTier, &mut Orientation)>,
) {
    for (state, tier, mut ori) in query.iter_mut() {
        if state.is_dead() || tier.is_culled() {
            continue;
        }
        if (ori.visual_yaw - ori.yaw).abs() > 1e-4 {
            ori.settle(dt.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::HeightSource;
    use glam::Vec3;
    use std::sync::Arc;

    struct Plateau;
    impl HeightSource for Plateau {
        fn height_at(&self, _x: f32, _z: f32) -> f32 {
            5.0
        }
    }

    fn stepped_clock() -> UpdateClock {
        UpdateClock {
            due: true,
            step_dt: 1.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_integrates_velocity_and_clamps_to_ground() {
        let mut world = World::new();
        world.insert_resource(Hooks::default().with_terrain(Arc::new(Plateau)));
        world.spawn((
            Velocity(Vec3::new(4.0, 0.0, 3.0)),
            BehaviorState::Moving,
            stepped_clock(),
            Position::new(0.0, 0.0, 0.0),
            Orientation::default(),
        ));

        let mut schedule = Schedule::default();
        schedule.add_systems(movement_system);
        schedule.run(&mut world);

        let mut query = world.query::<&Position>();
        let pos = query.single(&world);
        assert!((pos.0.x - 4.0).abs() < 1e-4);
        assert!((pos.0.z - 3.0).abs() < 1e-4);
        assert!((pos.0.y - 6.0).abs() < 1e-4); // plateau + stand offset
    }

    #[test]
    fn test_undue_combatants_hold_still() {
        let mut world = World::new();
        world.insert_resource(Hooks::default());
        world.spawn((
            Velocity(Vec3::new(10.0, 0.0, 0.0)),
            BehaviorState::Moving,
            UpdateClock::default(), // not due
            Position::new(1.0, 1.0, 1.0),
            Orientation::default(),
        ));

        let mut schedule = Schedule::default();
        schedule.add_systems(movement_system);
        schedule.run(&mut world);

        let mut query = world.query::<&Position>();
        let pos = query.single(&world);
        assert_eq!(pos.0, Vec3::new(1.0, 1.0, 1.0));
    }

    #[test]
    fn test_steering_runs_toward_destination_and_stops_on_arrival() {
        let mut world = World::new();
        world.spawn((
            Position::new(0.0, 0.0, 0.0),
            MoveIntent {
                destination: Some(Vec3::new(30.0, 0.0, 40.0)),
                speed: 5.0,
            },
            Nerves::default(),
            BehaviorState::Moving,
            stepped_clock(),
            Velocity::default(),
        ));
        world.spawn((
            Position::new(100.0, 0.0, 100.0),
            MoveIntent {
                destination: Some(Vec3::new(100.5, 0.0, 100.0)),
                speed: 5.0,
            },
            Nerves::default(),
            BehaviorState::Moving,
            stepped_clock(),
            Velocity(Vec3::new(2.0, 0.0, 0.0)),
        ));

        let mut schedule = Schedule::default();
        schedule.add_systems(steering_system);
        schedule.run(&mut world);

        let mut query = world.query::<(&Position, &Velocity)>();
        for (pos, vel) in query.iter(&world) {
            if pos.0.x < 50.0 {
                // 3-4-5 triangle: velocity points at the destination.
                assert!((vel.0.x - 3.0).abs() < 1e-4);
                assert!((vel.0.z - 4.0).abs() < 1e-4);
            } else {
                assert_eq!(vel.0, Vec3::ZERO); // arrived
            }
        }
    }

    #[test]
    fn test_pinned_combatants_stay_down() {
        let mut world = World::new();
        world.spawn((
            Position::new(0.0, 0.0, 0.0),
            MoveIntent {
                destination: Some(Vec3::new(50.0, 0.0, 0.0)),
                speed: 5.0,
            },
            Nerves {
                suppression: 1.2,
                ..Default::default()
            },
            BehaviorState::Suppressed,
            stepped_clock(),
            Velocity(Vec3::new(5.0, 0.0, 0.0)),
        ));

        let mut schedule = Schedule::default();
        schedule.add_systems(steering_system);
        schedule.run(&mut world);

        let mut query = world.query::<&Velocity>();
        assert_eq!(query.single(&world).0, Vec3::ZERO);
    }

    #[test]
    fn test_culled_velocity_is_zeroed() {
        let mut world = World::new();
        world.spawn((LodTier::Culled, Velocity(Vec3::new(3.0, 0.0, 0.0))));
        world.spawn((LodTier::High, Velocity(Vec3::new(3.0, 0.0, 0.0))));

        let mut schedule = Schedule::default();
        schedule.add_systems(position_hold_system);
        schedule.run(&mut world);

        let mut query = world.query::<(&LodTier, &Velocity)>();
        for (tier, vel) in query.iter(&world) {
            if tier.is_culled() {
                assert_eq!(vel.0, Vec3::ZERO);
            } else {
                assert!(vel.speed() > 0.0);
            }
        }
    }

    #[test]
    fn test_visual_yaw_chases_aim_yaw() {
        let mut world = World::new();
        world.insert_resource(DeltaTime(0.1));
        world.spawn((
            BehaviorState::Moving,
            LodTier::High,
            Orientation {
                yaw: 1.0,
                visual_yaw: 0.0,
                turn_rate: 2.0,
            },
        ));

        let mut schedule = Schedule::default();
        schedule.add_systems(visual_settle_system);
        schedule.run(&mut world);
        let mut query = world.query::<&Orientation>();
        let ori = query.single(&world);
        assert!((ori.visual_yaw - 0.2).abs() < 1e-4);

        for _ in 0..10 {
            schedule.run(&mut world);
        }
        let mut query = world.query::<&Orientation>();
        let ori = query.single(&world);
        assert!((ori.visual_yaw - 1.0).abs() < 1e-3);
    }
}
