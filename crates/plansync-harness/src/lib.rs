//! Deterministic simulation harness for plansync testing.
//!
//! Provides a seeded [`Environment`](plansync_core::Environment)
//! implementation, a small scheduling model to host in scenarios, and a
//! simulated deployment that wires a server driver to several clients
//! through in-memory queues.
//!
//! # Reference model
//!
//! [`PlanDetail`] places jobs on resources that may not overlap. It exercises
//! every detail hook the processor uses: validation refusals, cancelled
//! simulations, move retries, capable-to-promise scratch runs and
//! cross-reference restoration.
//!
//! # Simulated world
//!
//! [`SimWorld`] delivers messages in FIFO order and only advances time when
//! asked, so every run with the same seed produces the same history.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod plan;
pub mod sim_env;
pub mod world;

pub use plan::{Job, PLAN_COMMAND, PlanCommand, PlanDetail, Reschedule, ctp_query, import};
pub use sim_env::{SimEnv, SimInstant};
pub use world::{SimClient, SimServerDriver, SimWorld, WorldConfig, WorldError};
