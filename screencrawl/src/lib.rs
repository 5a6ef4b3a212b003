//! Goal-directed screen exploration for mobile apps.
//!
//! A session turns an app description into a coverage plan, then loops:
//! explore one flow on the device, evaluate the captured evidence against the
//! plan, decide whether to continue, replan a section or stop.
//!
//! - **[`core`]**: pure, deterministic logic (plan model, selection, stall
//!   detection, evaluation, decisions). No I/O.
//! - **[`io`]**: side effects (devices, agent processes, config, artifacts).
//! - **[`explore`]**, **[`planner`]**, **[`agents`]**: the collaborators the
//!   loop drives, each behind a trait.
//! - **[`manager`]** runs one session; **[`sessions`]** keeps live sessions
//!   addressable by id.

pub mod agents;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod explore;
pub mod io;
pub mod logging;
pub mod manager;
pub mod planner;
pub mod sessions;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
