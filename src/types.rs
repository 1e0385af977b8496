use std::fmt;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumIter, EnumString};

pub trait FromKeyValue: Sized + private::Sealed {
    /// Creates a new instance from the given key and value.
    ///
    /// # Errors
    ///
    /// Returns an error if the key or value cannot be deserialized.
    fn from_key_value(key: &[u8], value: &[u8]) -> Result<Self>;
}

mod private {
    use crate::tables;

    pub trait Sealed {}

    impl Sealed for tables::AnomalyLog {}
    impl Sealed for tables::Equipment {}
    impl Sealed for tables::Recommendation {}
    impl Sealed for tables::SensorReading {}
    impl Sealed for tables::Threshold {}
    impl Sealed for tables::Ticket {}
}

pub type EquipmentId = u32;
pub type ReadingId = u32;
pub type AnomalyId = u32;
pub type RecommendationId = u32;
pub type TicketId = u32;

/// Operational state of a piece of equipment.
#[derive(
    Clone, Copy, Debug, Deserialize, Display, EnumString, Eq, Hash, PartialEq, Serialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EquipmentStatus {
    Active,
    Maintenance,
    Down,
}

#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Display,
    EnumString,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// State of a maintenance ticket.
///
/// A ticket moves `open → in_progress → resolved`, or is cancelled while it is
/// still `open`.
#[derive(
    Clone, Copy, Debug, Deserialize, Display, EnumString, Eq, Hash, PartialEq, Serialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TicketStatus {
    Open,
    InProgress,
    Resolved,
    Cancelled,
}

impl TicketStatus {
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Open, Self::InProgress | Self::Cancelled) | (Self::InProgress, Self::Resolved)
        )
    }

    /// Returns `true` if a ticket in this state keeps its equipment under
    /// maintenance.
    #[must_use]
    pub fn is_open(self) -> bool {
        matches!(self, Self::Open | Self::InProgress)
    }
}

/// A numeric parameter carried by every sensor reading.
#[derive(
    AsRefStr,
    Clone,
    Copy,
    Debug,
    Deserialize,
    Display,
    EnumIter,
    EnumString,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Parameter {
    RotationalSpeed,
    ProcessTemperature,
    AirTemperature,
    Torque,
    ToolWear,
}

/// Which side of the normal range a value fell on.
#[derive(Clone, Copy, Debug, Deserialize, Display, Eq, PartialEq, Serialize)]
#[strum(serialize_all = "snake_case")]
pub enum Direction {
    Below,
    Above,
}

/// What an anomaly log entry is about.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum AnomalyKind {
    OutOfRange {
        parameter: Parameter,
        direction: Direction,
    },
    /// The reading itself carried an explicit failure signal.
    FailureSignal { failure_type: Option<String> },
}

impl AnomalyKind {
    pub(crate) const FAILURE_CATEGORY: &'static str = "failure";

    /// The key used to look up recommendation rules for this anomaly.
    #[must_use]
    pub fn category(&self) -> &str {
        match self {
            Self::OutOfRange { parameter, .. } => parameter.as_ref(),
            Self::FailureSignal { .. } => Self::FAILURE_CATEGORY,
        }
    }

    #[must_use]
    pub fn parameter(&self) -> Option<Parameter> {
        match self {
            Self::OutOfRange { parameter, .. } => Some(*parameter),
            Self::FailureSignal { .. } => None,
        }
    }
}

impl fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfRange {
                parameter,
                direction,
            } => write!(f, "{parameter} {direction} normal range"),
            Self::FailureSignal {
                failure_type: Some(failure_type),
            } => write!(f, "failure reported: {failure_type}"),
            Self::FailureSignal { failure_type: None } => f.write_str("failure reported"),
        }
    }
}
