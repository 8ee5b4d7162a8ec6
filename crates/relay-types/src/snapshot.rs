//! Per-tick simulation state: entities, signals, and the broadcast frame.
//!
//! Field names on the wire follow the viewer protocol (`vehicles`,
//! `trafficLights`, `time`) while the Rust names describe the data
//! generically. Snapshots are regenerated in full every tick; nothing
//! here is incremental.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// State of one simulated object at a single tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct EntitySnapshot {
    /// Identifier assigned by the simulation engine.
    pub id: String,
    /// X coordinate in engine units.
    pub x: f64,
    /// Y coordinate in engine units.
    pub y: f64,
    /// Heading in degrees.
    pub angle: f64,
    /// Current speed in engine units per second.
    pub speed: f64,
    /// Engine-defined category (vehicle type).
    #[serde(rename = "type")]
    pub category: String,
    /// Ordered waypoint (edge) identifiers the entity will traverse.
    pub route: Vec<String>,
}

/// State of one controlled signal at a single tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct SignalSnapshot {
    /// Current signal state string (one character per controlled lane).
    #[serde(rename = "state")]
    pub current_state: String,
    /// Every state of the signal program, in cycle order.
    #[serde(rename = "phases", default)]
    pub phase_sequence: Vec<String>,
}

/// Everything a stepper reports after advancing one tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepSnapshot {
    /// Entities keyed by id.
    #[serde(rename = "vehicles", default)]
    pub entities: BTreeMap<String, EntitySnapshot>,
    /// Signals keyed by id.
    #[serde(rename = "trafficLights", default)]
    pub signals: BTreeMap<String, SignalSnapshot>,
    /// Simulation clock in seconds after the advance.
    #[serde(rename = "time", default)]
    pub sim_time: f64,
}

/// One broadcast payload describing the simulation at a given tick.
///
/// Built by the run controller from a [`StepSnapshot`], sent once to
/// every session, then dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct Frame {
    /// Zero-based step number within the current run.
    pub step: u64,
    /// Entities keyed by id.
    #[serde(rename = "vehicles")]
    pub entities: BTreeMap<String, EntitySnapshot>,
    /// Signals keyed by id.
    #[serde(rename = "trafficLights")]
    pub signals: BTreeMap<String, SignalSnapshot>,
    /// Simulation clock in seconds.
    #[serde(rename = "time")]
    pub sim_time: f64,
}

impl Frame {
    /// Build the frame for `step` from a stepper snapshot.
    pub fn from_snapshot(step: u64, snapshot: StepSnapshot) -> Self {
        Self {
            step,
            entities: snapshot.entities,
            signals: snapshot.signals,
            sim_time: snapshot.sim_time,
        }
    }
}
