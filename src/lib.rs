//! Deterministic discrete-time simulation of populations distributed
//! across named states, driven by a rule book of inter-state transitions.
//!
//! A [`model::Task`] describes the states, the transitions and the run
//! settings; the [`Engine`] advances the population step by step — in
//! native floats or on a scaled-decimal pipeline, sequentially or with
//! one worker task per transition — and packages the outcome as
//! [`SimulationResult`] series and tables.

// === Public Modules (The Canonical Paths) ===
pub mod error;
pub mod math;
pub mod model;
pub mod report;

// === Private Implementation Details ===
mod engine;
mod sim;

// === Facades (Re-exporting internals) ===
pub use crate::engine::{CancelHandle, Engine, FnResultSink, ResultSink};
pub use crate::report::{ResultShape, SimulationResult, StateSeries, TableRow, TableView};
pub use crate::sim::progress::{FnProgressSink, ProgressBarSink, ProgressSink};
