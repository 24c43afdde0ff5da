//! Scenario summary: the small, always-readable half of a scenario.
//!
//! Kept apart from the detail so listings and lifecycle checks can read
//! names and flags while the detail is write-locked by a long transmission.

use std::collections::{BTreeMap, BTreeSet};

use plansync_proto::{CodecError, PayloadKind, ScenarioKind, Versioned, codec};
use serde::{Deserialize, Serialize};

/// A stored KPI snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KpiSnapshot {
    /// Transmission timestamp the snapshot was taken at.
    pub taken_at_ms: u64,
    /// Values at that point.
    pub values: BTreeMap<String, i64>,
}

/// Name, category, flags and settings of a scenario.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioSummary {
    /// Display name.
    pub name: String,
    /// Category.
    pub kind: ScenarioKind,
    /// Persisted scenario settings.
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
    /// Holds the production flag.
    #[serde(default)]
    pub production: bool,
    /// Flagged for comparison views.
    #[serde(default)]
    pub compare: bool,
    /// Isolated from live updates.
    #[serde(default)]
    pub isolated: bool,
    /// Published.
    #[serde(default)]
    pub published: bool,
    /// Planning clock.
    #[serde(default)]
    pub clock_ms: u64,
    /// Hold horizon.
    #[serde(default)]
    pub hold_until_ms: Option<u64>,
    /// Last computed KPI values.
    #[serde(default)]
    pub kpi_values: BTreeMap<String, i64>,
    /// KPIs hidden from views.
    #[serde(default)]
    pub hidden_kpis: BTreeSet<String>,
    /// Stored KPI snapshots, oldest first.
    #[serde(default)]
    pub kpi_snapshots: Vec<KpiSnapshot>,
}

impl ScenarioSummary {
    /// Summary for a freshly created scenario.
    pub fn new(name: impl Into<String>, kind: ScenarioKind) -> Self {
        Self { name: name.into(), kind, ..Self::default() }
    }
}

/// Layout written by format version 1: no flags beyond production, settings
/// stored as a list of pairs.
#[derive(Deserialize)]
struct SummaryV1 {
    name: String,
    kind: ScenarioKind,
    production: bool,
    settings: Vec<(String, String)>,
}

impl From<SummaryV1> for ScenarioSummary {
    fn from(v1: SummaryV1) -> Self {
        Self {
            name: v1.name,
            kind: v1.kind,
            production: v1.production,
            settings: v1.settings.into_iter().collect(),
            ..Self::default()
        }
    }
}

impl Versioned for ScenarioSummary {
    const KIND: PayloadKind = PayloadKind::ScenarioSummary;

    fn decode_legacy(version: u16, body: &[u8]) -> Result<Self, CodecError> {
        match version {
            1 => codec::decode_body::<SummaryV1>(body).map(Self::from),
            // v2 lacks the KPI fields only; serde defaults fill them
            _ => codec::decode_body(body),
        }
    }
}
