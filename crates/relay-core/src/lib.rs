//! Run control, pacing, and configuration for the telemetry relay.
//!
//! This crate owns the one piece of shared mutable state in the relay:
//! the run state (phase, speed, tick count) and the step loop that turns
//! a [`SnapshotSource`] into a stream of broadcast frames.
//!
//! # Modules
//!
//! - [`config`] -- Configuration loading from `relay-config.yaml` into
//!   strongly-typed structs, with environment overrides.
//! - [`controller`] -- [`RunController`]: start/stop/set-speed and the
//!   step loop.
//! - [`pacer`] -- [`Pacer`] trait for the inter-tick delay.
//! - [`source`] -- [`SnapshotSource`] contract and [`ScriptedSource`].
//!
//! [`SnapshotSource`]: source::SnapshotSource
//! [`ScriptedSource`]: source::ScriptedSource
//! [`RunController`]: controller::RunController
//! [`Pacer`]: pacer::Pacer

pub mod config;
pub mod controller;
pub mod pacer;
pub mod source;
