//! Autonomous battle demonstration.
//!
//! Two factions reinforce in waves, squads contest a bridge and a
//! hilltop, and the observer walks the front line while the scheduler
//! retiers everyone around them. Halfway through, artillery lands on
//! the bridge.
//!
//! Run with: cargo run --example battle_demo
//! (RUST_LOG=frontline_sim=debug for spawn/combat lifecycle logging)

use frontline_sim::hooks::{HeightSource, Zone, ZoneSource};
use frontline_sim::{Faction, Hooks, SimConfig, SimWorld};
use glam::Vec3;
use std::sync::Arc;

/// Gentle sine-field hills, enough to interrupt long sight lines.
struct RollingHills;

impl HeightSource for RollingHills {
    fn height_at(&self, x: f32, z: f32) -> f32 {
        (x * 0.02).sin() * 4.0 + (z * 0.015).cos() * 3.0
    }
}

/// A bridge everyone wants and a hilltop Opfor starts holding.
struct TwoPointFront;

impl ZoneSource for TwoPointFront {
    fn zones(&self) -> Vec<Zone> {
        vec![
            Zone {
                position: Vec3::new(0.0, 0.0, 0.0),
                priority: 1.0,
                owner: None,
            },
            Zone {
                position: Vec3::new(60.0, 0.0, 90.0),
                priority: 0.6,
                owner: Some(Faction::Opfor),
            },
        ]
    }
}

fn main() {
    env_logger::init();

    println!("=== Frontline - Battle Demo ===\n");

    let config = SimConfig {
        world_half_extent: 500.0,
        population_target: 60,
        wave_size: 10,
        wave_interval: 4.0,
        seed: 42,
        ..Default::default()
    };
    let mut sim = SimWorld::with_config(config);
    sim.set_hooks(
        Hooks::default()
            .with_terrain(Arc::new(RollingHills))
            .with_zones(Arc::new(TwoPointFront)),
    );

    println!("Running 900 frames (30s at 30 fps), observer walking the front...\n");
    for frame in 0..900 {
        // The observer paces along the front line so combatants churn
        // through the distance tiers.
        let t = frame as f32 / 30.0;
        let player = Vec3::new((t * 0.2).sin() * 80.0, 2.0, t * 1.5 - 20.0);
        sim.update(1.0 / 30.0, player);

        if frame == 450 {
            println!("--- Artillery strike on the bridge ---");
            let hit = sim.apply_explosion_damage(Vec3::new(0.0, 1.0, 0.0), 12.0, 90.0, None);
            println!("    {} combatants caught in the blast\n", hit);
        }

        if (frame + 1) % 150 == 0 {
            print_status(&mut sim);
        }
    }

    println!("\n--- Observer takes a shot down the x axis ---");
    match sim.handle_player_shot(Vec3::new(-120.0, 6.0, 0.0), Vec3::X, 400.0, 45.0) {
        Some(report) => println!(
            "    hit {:?} at {:.1}m{}{}",
            report.victim,
            report.distance,
            if report.headshot { ", headshot" } else { "" },
            if report.killed { ", killed" } else { "" },
        ),
        None => println!("    clean miss"),
    }

    println!("\n=== Frame profile ===\n{}", sim.profile_summary());

    println!("=== Final telemetry (JSON) ===\n");
    println!(
        "{}",
        serde_json::to_string_pretty(&sim.telemetry()).unwrap_or_else(|_| "{}".to_string())
    );
}

fn print_status(sim: &mut SimWorld) {
    let t = sim.telemetry();
    println!(
        "--- Frame {} (t={:.1}s) ---",
        t.frame,
        t.time
    );
    println!(
        "  live {} (allied {} / opfor {})  kills {}  deaths {}",
        t.stats.total, t.stats.allied, t.stats.opfor, t.stats.kills, t.stats.deaths
    );
    println!(
        "  states: idle {} moving {} engaging {} suppressed {}",
        t.states.idle, t.states.moving, t.states.engaging, t.states.suppressed
    );
    println!(
        "  tiers: high {} med {} low {} culled {} (stepped {}, load {:.2})",
        t.lod.high, t.lod.medium, t.lod.low, t.lod.culled, t.lod.stepped, t.lod.load_factor
    );
    println!(
        "  rays: perception {}/{} denied {}  fire {}/{} denied {}",
        t.perception_budget.requested - t.perception_budget.denied,
        t.perception_budget.max_per_frame,
        t.perception_budget.denied,
        t.fire_budget.requested - t.fire_budget.denied,
        t.fire_budget.max_per_frame,
        t.fire_budget.denied
    );
}
