//! Per-phase frame timing.
//!
//! The orchestrator wraps each pipeline phase (scheduling, spawning,
//! squads, ai, movement, combat, sync) in a named section. Timings
//! feed the telemetry surface; the formatted summary is for demos and
//! stress runs.

use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::time::{Duration, Instant};

/// Accumulated timing for one named phase.
#[derive(Default, Clone)]
pub struct PhaseStats {
    pub total: Duration,
    pub calls: u64,
    pub min: Option<Duration>,
    pub max: Option<Duration>,
    pub last: Duration,
}

impl PhaseStats {
    pub fn average(&self) -> Duration {
        if self.calls == 0 {
            Duration::ZERO
        } else {
            self.total / self.calls as u32
        }
    }
}

/// One row of the serialized per-phase breakdown.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseRow {
    pub phase: String,
    pub last_us: u64,
    pub avg_us: u64,
    /// Share of all profiled time, 0.0 - 1.0.
    pub share: f64,
}

/// Serialized timing breakdown for the telemetry surface.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PhaseReport {
    pub frames: u64,
    pub rows: Vec<PhaseRow>,
}

/// Records named sections of the frame.
#[derive(Default)]
pub struct Profiler {
    phases: HashMap<String, PhaseStats>,
    open: Option<(String, Instant)>,
    frames: u64,
}

impl Profiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_phase(&mut self, name: &str) {
        self.open = Some((name.to_string(), Instant::now()));
    }

    pub fn end_phase(&mut self) {
        if let Some((name, start)) = self.open.take() {
            let elapsed = start.elapsed();
            let stats = self.phases.entry(name).or_default();
            stats.total += elapsed;
            stats.calls += 1;
            stats.last = elapsed;
            stats.min = Some(stats.min.map_or(elapsed, |m| m.min(elapsed)));
            stats.max = Some(stats.max.map_or(elapsed, |m| m.max(elapsed)));
        }
    }

    /// Time a phase around a closure.
    pub fn time_phase<F, R>(&mut self, name: &str, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        self.begin_phase(name);
        let result = f();
        self.end_phase();
        result
    }

    /// Mark the end of a frame.
    pub fn frame(&mut self) {
        self.frames += 1;
    }

    pub fn frame_count(&self) -> u64 {
        self.frames
    }

    pub fn phase(&self, name: &str) -> Option<&PhaseStats> {
        self.phases.get(name)
    }

    pub fn report(&self) -> PhaseReport {
        let total: Duration = self.phases.values().map(|s| s.total).sum();
        let mut rows: Vec<PhaseRow> = self
            .phases
            .iter()
            .map(|(name, stats)| PhaseRow {
                phase: name.clone(),
                last_us: stats.last.as_micros() as u64,
                avg_us: stats.average().as_micros() as u64,
                share: if total.as_nanos() > 0 {
                    stats.total.as_nanos() as f64 / total.as_nanos() as f64
                } else {
                    0.0
                },
            })
            .collect();
        rows.sort_by(|a, b| b.avg_us.cmp(&a.avg_us));
        PhaseReport {
            frames: self.frames,
            rows,
        }
    }

    /// Formatted table over everything recorded so far.
    pub fn summary(&self) -> String {
        let mut phases: Vec<_> = self.phases.iter().collect();
        phases.sort_by(|a, b| b.1.total.cmp(&a.1.total));
        let total: Duration = phases.iter().map(|(_, s)| s.total).sum();

        let mut out = String::new();
        let _ = writeln!(out, "=== frame profile ({} frames) ===", self.frames);
        let _ = writeln!(
            out,
            "{:<12} {:>10} {:>10} {:>10} {:>10} {:>7}",
            "phase", "total", "avg", "min", "max", "share"
        );
        for (name, stats) in &phases {
            let pct = if total.as_nanos() > 0 {
                stats.total.as_nanos() as f64 / total.as_nanos() as f64 * 100.0
            } else {
                0.0
            };
            let _ = writeln!(
                out,
                "{:<12} {:>10.2?} {:>10.2?} {:>10.2?} {:>10.2?} {:>6.1}%",
                name,
                stats.total,
                stats.average(),
                stats.min.unwrap_or(Duration::ZERO),
                stats.max.unwrap_or(Duration::ZERO),
                pct
            );
        }
        if self.frames > 0 {
            let per_frame = total / self.frames as u32;
            let fps = if per_frame.as_secs_f64() > 0.0 {
                1.0 / per_frame.as_secs_f64()
            } else {
                0.0
            };
            let _ = writeln!(out, "per frame: {:.2?} ({:.1} fps)", per_frame, fps);
        }
        out
    }

    pub fn reset(&mut self) {
        self.phases.clear();
        self.open = None;
        self.frames = 0;
    }
}
