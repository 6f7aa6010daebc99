//! Orchestrator - day cycle and checkpoints
//!
//! `controller` drives participants through the phases of each day;
//! `checkpoint` captures what is needed to resume a run.

pub mod checkpoint;
pub mod controller;

pub use checkpoint::{compute_config_hash, validate_snapshot, CheckpointError, SimulationSnapshot};
pub use controller::{DayCycleController, DayReport, MarketSimulation, ParticipationFailure, PhaseReport, StopHandle};
