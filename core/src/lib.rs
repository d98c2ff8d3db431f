//! workforce-core — multi-year workforce and retirement-plan simulation.
//!
//! The orchestrator advances a population one year at a time: generate
//! events, accumulate state, validate, persist, checkpoint, report.
//! Everything stored is derived from the append-only event log.

pub mod accumulator;
pub mod attribution;
pub mod cache;
pub mod calendar;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod event;
pub mod generator;
pub mod money;
pub mod optimizer;
pub mod orchestrator;
pub mod parity;
pub mod pool;
pub mod report;
pub mod rng;
pub mod snapshot;
pub mod state;
pub mod store;
pub mod types;
pub mod validation;
