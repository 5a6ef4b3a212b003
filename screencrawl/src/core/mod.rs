//! Deterministic, pure logic shared by the exploration controller.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! plans, evidence and reports and return deterministic outputs suitable for
//! tests.

pub mod budget;
pub mod classifier;
pub mod evaluator;
pub mod fingerprint;
pub mod immutability;
pub mod invariants;
pub mod machine;
pub mod plan;
pub mod selector;
pub mod stall;
pub mod state_update;
pub mod types;
