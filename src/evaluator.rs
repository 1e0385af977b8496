//! Classification of readings against the threshold catalog.

use strum::IntoEnumIterator;

use crate::{
    tables::{Measurement, Threshold},
    types::{AnomalyKind, Direction, Parameter, Severity},
    Error, IndexedTable,
};

/// Where thresholds are looked up during evaluation.
pub trait ThresholdCatalog {
    /// Returns the threshold for `parameter` on equipment of the given type.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if no threshold is configured, or another
    /// error if the lookup itself fails.
    fn lookup(&self, equipment_type: &str, parameter: Parameter) -> Result<Threshold, Error>;
}

impl ThresholdCatalog for IndexedTable<'_, Threshold> {
    fn lookup(&self, equipment_type: &str, parameter: Parameter) -> Result<Threshold, Error> {
        self.get(equipment_type, parameter)?
            .ok_or_else(|| Error::NotFound(format!("threshold for {equipment_type} {parameter}")))
    }
}

impl ThresholdCatalog for [Threshold] {
    fn lookup(&self, equipment_type: &str, parameter: Parameter) -> Result<Threshold, Error> {
        self.iter()
            .find(|t| t.equipment_type == equipment_type && t.parameter == parameter)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("threshold for {equipment_type} {parameter}")))
    }
}

/// An anomaly found in a reading, before it is recorded.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub kind: AnomalyKind,
    pub severity: Severity,
    pub confidence: f64,
    pub value: Option<f64>,
}

/// Finds the anomalies in one reading of equipment of the given type.
///
/// A reported failure yields a single critical detection. Otherwise each
/// parameter outside its normal range yields one detection; parameters without
/// a threshold are skipped.
///
/// # Errors
///
/// Returns an error if a catalog lookup fails for a reason other than a
/// missing threshold.
pub fn evaluate<C>(
    equipment_type: &str,
    measurement: &Measurement,
    catalog: &C,
) -> Result<Vec<Detection>, Error>
where
    C: ThresholdCatalog + ?Sized,
{
    if measurement.target {
        return Ok(vec![Detection {
            kind: AnomalyKind::FailureSignal {
                failure_type: measurement.failure_type.clone(),
            },
            severity: Severity::Critical,
            confidence: 1.0,
            value: None,
        }]);
    }

    let mut detections = Vec::new();
    for parameter in Parameter::iter() {
        let threshold = match catalog.lookup(equipment_type, parameter) {
            Ok(threshold) => threshold,
            Err(Error::NotFound(_)) => {
                tracing::debug!("no threshold for {equipment_type} {parameter}; skipped");
                continue;
            }
            Err(e) => return Err(e),
        };
        if let Some(detection) = classify(&threshold, measurement.value(parameter)) {
            detections.push(detection);
        }
    }
    Ok(detections)
}

/// Classifies one value against its threshold. Returns `None` if the value is
/// within the normal range.
#[must_use]
pub fn classify(threshold: &Threshold, value: f64) -> Option<Detection> {
    let (direction, boundary, warning) = if value < threshold.min_normal {
        (Direction::Below, threshold.min_normal, threshold.min_warning)
    } else if value > threshold.max_normal {
        (Direction::Above, threshold.max_normal, threshold.max_warning)
    } else {
        return None;
    };

    let severity = match direction {
        Direction::Below if value >= threshold.min_warning => Severity::Medium,
        Direction::Above if value <= threshold.max_warning => Severity::Medium,
        _ => Severity::High,
    };

    let band = (warning - boundary).abs();
    let confidence = if band > 0.0 {
        ((value - boundary).abs() / band).min(1.0)
    } else {
        1.0
    };

    Some(Detection {
        kind: AnomalyKind::OutOfRange {
            parameter: threshold.parameter,
            direction,
        },
        severity,
        confidence,
        value: Some(value),
    })
}
