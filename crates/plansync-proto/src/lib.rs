//! Plansync protocol types.
//!
//! A *transmission* is a single ordered, typed mutation request flowing
//! between client and server. This crate defines the transmission envelope
//! ([`Transmission`]), its closed set of bodies ([`TransmissionBody`]), the
//! denormalized audit view kept in the undo log ([`TransmissionInfo`]), and the
//! version-gated binary codec every persisted or transmitted entity goes
//! through ([`codec`]).
//!
//! # Wire layout
//!
//! ```text
//! [magic: u32 BE][format version: u16 BE][kind: u16 BE][CBOR body]
//! ```
//!
//! The fixed header is raw binary so a reader can reject foreign or
//! too-new data before touching the body. Bodies are CBOR: self-describing,
//! compact, and tolerant of added fields through `#[serde(default)]`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod codec;
mod errors;
mod ids;
mod info;
mod transmission;

pub use codec::{PayloadKind, Versioned};
pub use errors::{CodecError, Result};
pub use ids::{ScenarioId, TransmissionId, UndoNumber, UserId};
pub use info::TransmissionInfo;
pub use transmission::{
    ClockAdvance, CopyScenario, DomainPayload, HoldSettings, Isolate, KpiVisibility,
    MoveRequest, NewScenario, PublishStatus, ScenarioChange, ScenarioKind, SettingsSave, Target,
    Transmission, TransmissionBody, TransmissionHeader, UndoRequest,
};
