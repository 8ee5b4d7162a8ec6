//! Built-in synthetic four-way intersection.
//!
//! The demo source lets the relay run without an external simulator. It
//! keeps a configured number of vehicles moving through a single
//! signalized junction at the origin. Vehicles enter on one of four
//! approaches, stop at the stop line while their approach is not green,
//! keep a minimum gap to the vehicle ahead, and leave on the opposite
//! side, where they are replaced by new arrivals.
//!
//! All randomness comes from a seeded [`StdRng`], so two runs with the
//! same seed produce identical frames.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use relay_core::source::{ScenarioHandle, SnapshotSource, SourceError, StepOutcome, Stepper};
use relay_types::{EntitySnapshot, SignalSnapshot, StepSnapshot};
use tracing::debug;

/// Identifier of the single signal.
const SIGNAL_ID: &str = "center";

/// Signal program. Characters 0-1 control the north/south approaches,
/// characters 2-3 the east/west approaches.
const PHASES: [&str; 4] = ["GGrr", "yyrr", "rrGG", "rryy"];

/// Seconds each phase lasts, aligned with [`PHASES`].
const PHASE_DURATIONS: [f64; 4] = [30.0, 4.0, 30.0, 4.0];

/// Simulated seconds per tick.
const STEP_LENGTH: f64 = 1.0;

/// Length of each approach from spawn point to the junction center.
const APPROACH_LENGTH: f64 = 100.0;

/// Distance along the path at which vehicles wait for green.
const STOP_LINE: f64 = APPROACH_LENGTH - 10.0;

/// Distance along the path after which a vehicle leaves the scene.
const EXIT_DISTANCE: f64 = APPROACH_LENGTH * 2.0;

/// Lateral offset of a lane from the road center line.
const LANE_OFFSET: f64 = 1.6;

/// Minimum distance kept to the vehicle ahead (vehicle length + gap).
const MIN_GAP: f64 = 7.5;

/// One of the four entry directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Approach {
    North,
    South,
    East,
    West,
}

impl Approach {
    const ALL: [Self; 4] = [Self::North, Self::South, Self::East, Self::West];

    /// Position of the spawn point.
    const fn origin(self) -> (f64, f64) {
        match self {
            Self::North => (-LANE_OFFSET, APPROACH_LENGTH),
            Self::South => (LANE_OFFSET, -APPROACH_LENGTH),
            Self::East => (APPROACH_LENGTH, LANE_OFFSET),
            Self::West => (-APPROACH_LENGTH, -LANE_OFFSET),
        }
    }

    /// Unit vector of travel.
    const fn direction(self) -> (f64, f64) {
        match self {
            Self::North => (0.0, -1.0),
            Self::South => (0.0, 1.0),
            Self::East => (-1.0, 0.0),
            Self::West => (1.0, 0.0),
        }
    }

    /// Heading in degrees, clockwise from north.
    const fn heading(self) -> f64 {
        match self {
            Self::North => 180.0,
            Self::South => 0.0,
            Self::East => 270.0,
            Self::West => 90.0,
        }
    }

    /// Index of the signal character that controls this approach.
    const fn signal_index(self) -> usize {
        match self {
            Self::North => 0,
            Self::South => 1,
            Self::East => 2,
            Self::West => 3,
        }
    }

    /// Edge identifiers from entry to exit.
    const fn route(self) -> [&'static str; 2] {
        match self {
            Self::North => ["north_in", "south_out"],
            Self::South => ["south_in", "north_out"],
            Self::East => ["east_in", "west_out"],
            Self::West => ["west_in", "east_out"],
        }
    }
}

#[derive(Debug, Clone)]
struct Vehicle {
    id: String,
    approach: Approach,
    category: &'static str,
    cruise_speed: f64,
    speed: f64,
    /// Distance travelled from the spawn point.
    progress: f64,
}

impl Vehicle {
    fn snapshot(&self) -> EntitySnapshot {
        let (ox, oy) = self.approach.origin();
        let (dx, dy) = self.approach.direction();
        EntitySnapshot {
            id: self.id.clone(),
            x: dx.mul_add(self.progress, ox),
            y: dy.mul_add(self.progress, oy),
            angle: self.approach.heading(),
            speed: self.speed,
            category: self.category.to_owned(),
            route: self.approach.route().iter().map(|&e| e.to_owned()).collect(),
        }
    }
}

/// Source that produces the synthetic intersection.
#[derive(Debug, Clone)]
pub struct DemoSource {
    seed: u64,
    vehicles: u32,
}

impl DemoSource {
    /// Create a source that keeps `vehicles` vehicles on the road.
    pub const fn new(seed: u64, vehicles: u32) -> Self {
        Self { seed, vehicles }
    }
}

impl SnapshotSource for DemoSource {
    fn name(&self) -> &'static str {
        "demo"
    }

    fn initialize(&self, scenario: &ScenarioHandle) -> Result<Box<dyn Stepper>, SourceError> {
        debug!(%scenario, seed = self.seed, vehicles = self.vehicles, "Demo intersection initialized");
        Ok(Box::new(DemoStepper {
            rng: StdRng::seed_from_u64(self.seed),
            target: self.vehicles,
            vehicles: Vec::new(),
            next_id: 0,
            time: 0.0,
            phase: 0,
            phase_elapsed: 0.0,
        }))
    }
}

struct DemoStepper {
    rng: StdRng,
    target: u32,
    vehicles: Vec<Vehicle>,
    next_id: u64,
    time: f64,
    phase: usize,
    phase_elapsed: f64,
}

impl DemoStepper {
    fn current_state(&self) -> &'static str {
        PHASES.get(self.phase).copied().unwrap_or("GGrr")
    }

    fn advance_signal(&mut self) {
        self.phase_elapsed += STEP_LENGTH;
        let duration = PHASE_DURATIONS.get(self.phase).copied().unwrap_or(0.0);
        if self.phase_elapsed >= duration {
            self.phase_elapsed = 0.0;
            let next = self.phase.saturating_add(1);
            self.phase = if next >= PHASES.len() { 0 } else { next };
        }
    }

    fn is_green(&self, approach: Approach) -> bool {
        self.current_state()
            .as_bytes()
            .get(approach.signal_index())
            .is_some_and(|c| c.eq_ignore_ascii_case(&b'G'))
    }

    fn move_vehicles(&mut self) {
        for approach in Approach::ALL {
            let green = self.is_green(approach);
            let mut lane: Vec<&mut Vehicle> = self
                .vehicles
                .iter_mut()
                .filter(|v| v.approach == approach)
                .collect();
            // Leader first.
            lane.sort_by(|a, b| b.progress.total_cmp(&a.progress));

            let mut leader: Option<f64> = None;
            for vehicle in lane {
                let mut limit = f64::INFINITY;
                if !green && vehicle.progress <= STOP_LINE {
                    limit = STOP_LINE;
                }
                if let Some(ahead) = leader {
                    limit = limit.min(ahead - MIN_GAP);
                }
                let wanted = vehicle.cruise_speed.mul_add(STEP_LENGTH, vehicle.progress);
                let next = wanted.min(limit).max(vehicle.progress);
                vehicle.speed = (next - vehicle.progress) / STEP_LENGTH;
                vehicle.progress = next;
                leader = Some(next);
            }
        }
        self.vehicles.retain(|v| v.progress < EXIT_DISTANCE);
    }

    fn spawn(&mut self) {
        let count = u32::try_from(self.vehicles.len()).unwrap_or(u32::MAX);
        if count >= self.target {
            return;
        }
        let Some(&approach) = Approach::ALL.get(self.rng.random_range(0..Approach::ALL.len()))
        else {
            return;
        };
        let entry_clear = self
            .vehicles
            .iter()
            .filter(|v| v.approach == approach)
            .all(|v| v.progress >= MIN_GAP);
        if !entry_clear {
            return;
        }

        let roll: u32 = self.rng.random_range(0..100);
        let (category, cruise_speed) = match roll {
            0..80 => ("car", self.rng.random_range(10.0..14.0)),
            80..92 => ("truck", self.rng.random_range(7.0..10.0)),
            _ => ("bus", self.rng.random_range(8.0..11.0)),
        };

        self.vehicles.push(Vehicle {
            id: format!("veh{}", self.next_id),
            approach,
            category,
            cruise_speed,
            speed: cruise_speed,
            progress: 0.0,
        });
        self.next_id = self.next_id.saturating_add(1);
    }

    fn snapshot(&self) -> StepSnapshot {
        let entities = self
            .vehicles
            .iter()
            .map(|v| (v.id.clone(), v.snapshot()))
            .collect();
        let mut signals = BTreeMap::new();
        signals.insert(
            SIGNAL_ID.to_owned(),
            SignalSnapshot {
                current_state: self.current_state().to_owned(),
                phase_sequence: PHASES.iter().map(|&p| p.to_owned()).collect(),
            },
        );
        StepSnapshot {
            entities,
            signals,
            sim_time: self.time,
        }
    }
}

impl Stepper for DemoStepper {
    fn advance(&mut self) -> Result<StepOutcome, SourceError> {
        self.time += STEP_LENGTH;
        self.advance_signal();
        self.move_vehicles();
        self.spawn();
        Ok(StepOutcome::Advanced(self.snapshot()))
    }

    fn shutdown(&mut self) {
        self.vehicles.clear();
    }
}
