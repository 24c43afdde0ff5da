//! Client
//!
//! Action-based client state machine for plansync. Keeps local replicas of
//! the scenarios a user opened and keeps them consistent with the server.
//!
//! # Architecture
//!
//! The client follows the same Sans-IO and action-based patterns as
//! [`plansync_core`]. It receives events ([`ClientEvent`]), processes them
//! through pure state machine logic, and returns actions ([`ClientAction`])
//! for the caller to execute.
//!
//! Transmissions are never applied optimistically. A submitted transmission
//! takes effect locally when the server forwards it back in sequence, so
//! every replica sees one total order.
//!
//! # Components
//!
//! - [`Client`]: Top-level state machine managing resident scenarios
//! - [`ClientEvent`]: Events fed into the client
//! - [`ClientAction`]: Actions produced by the client

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod client;
mod error;
mod event;

pub use client::{Client, ClientConfig};
pub use error::ClientError;
pub use event::{ClientAction, ClientEvent};
pub use plansync_core::{ClientMessage, Environment, ServerMessage};
