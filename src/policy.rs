//! Engine configuration: when and how recommendations are generated, and which
//! reading values are plausible at all.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    tables::Measurement,
    types::{AnomalyKind, Parameter, Severity},
    Error,
};

const WILDCARD: &str = "*";
const HOUR: u64 = 60 * 60;

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    pub recommendation: RecommendationPolicy,
    pub limits: ReadingLimits,
}

impl EngineConfig {
    /// Parses a configuration from TOML. Missing sections take their default
    /// values.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` if the text is not a valid configuration.
    pub fn from_toml(text: &str) -> Result<Self, Error> {
        let config: Self =
            toml::from_str(text).map_err(|e| Error::Validation(format!("invalid config: {e}")))?;
        config.limits.validate()?;
        Ok(config)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct RecommendationPolicy {
    /// Anomalies below this severity get no recommendation.
    pub min_severity: Severity,
    pub rules: Vec<Rule>,
    /// Used when no rule matches.
    pub fallback: Template,
}

impl Default for RecommendationPolicy {
    fn default() -> Self {
        let rule = |category: &str, action: &str, hours: u64| Rule {
            equipment_type: WILDCARD.to_string(),
            category: category.to_string(),
            template: Template {
                action: action.to_string(),
                horizon: Duration::from_secs(hours * HOUR),
            },
        };
        Self {
            min_severity: Severity::High,
            rules: vec![
                rule(
                    Parameter::RotationalSpeed.as_ref(),
                    "Check the drive and bearings of the {equipment_type}: rotational speed is {direction} the normal range ({severity}).",
                    168,
                ),
                rule(
                    Parameter::ProcessTemperature.as_ref(),
                    "Inspect cooling and lubrication of the {equipment_type}: process temperature is {direction} the normal range ({severity}).",
                    72,
                ),
                rule(
                    Parameter::AirTemperature.as_ref(),
                    "Verify ventilation around the {equipment_type}: air temperature is {direction} the normal range ({severity}).",
                    240,
                ),
                rule(
                    Parameter::Torque.as_ref(),
                    "Inspect the load and spindle of the {equipment_type}: torque is {direction} the normal range ({severity}).",
                    96,
                ),
                rule(
                    Parameter::ToolWear.as_ref(),
                    "Replace the cutting tool of the {equipment_type} ({severity} tool wear).",
                    48,
                ),
                rule(
                    AnomalyKind::FAILURE_CATEGORY,
                    "Stop the {equipment_type} and inspect it for {parameter}.",
                    4,
                ),
            ],
            fallback: Template {
                action: "Inspect the {equipment_type}: {parameter} is {direction} the normal range ({severity}).".to_string(),
                horizon: Duration::from_secs(120 * HOUR),
            },
        }
    }
}

impl RecommendationPolicy {
    /// Finds the template for an anomaly category, preferring a rule for the
    /// exact equipment type over a wildcard rule.
    #[must_use]
    pub fn template_for(&self, equipment_type: &str, category: &str) -> &Template {
        let find = |ty: &str| {
            self.rules
                .iter()
                .find(|rule| rule.equipment_type == ty && rule.category == category)
        };
        find(equipment_type)
            .or_else(|| find(WILDCARD))
            .map_or(&self.fallback, |rule| &rule.template)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Rule {
    /// An equipment type, or `*` for any.
    #[serde(default = "wildcard")]
    pub equipment_type: String,
    /// A parameter name, or `failure` for reported failures.
    pub category: String,
    #[serde(flatten)]
    pub template: Template,
}

fn wildcard() -> String {
    WILDCARD.to_string()
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Template {
    /// Action text. `{equipment_type}`, `{parameter}`, `{direction}` and
    /// `{severity}` are replaced when a recommendation is generated.
    pub action: String,
    /// Expected time to failure at zero confidence.
    #[serde(with = "humantime_serde")]
    pub horizon: Duration,
}

impl Template {
    #[must_use]
    pub fn render(&self, equipment_type: &str, kind: &AnomalyKind, severity: Severity) -> String {
        let (parameter, direction) = match kind {
            AnomalyKind::OutOfRange {
                parameter,
                direction,
            } => (parameter.to_string(), direction.to_string()),
            AnomalyKind::FailureSignal { failure_type } => (
                failure_type
                    .clone()
                    .unwrap_or_else(|| AnomalyKind::FAILURE_CATEGORY.to_string()),
                "reported".to_string(),
            ),
        };
        self.action
            .replace("{equipment_type}", equipment_type)
            .replace("{parameter}", &parameter)
            .replace("{direction}", &direction)
            .replace("{severity}", &severity.to_string())
    }

    /// Time until the predicted failure: the base horizon shortened by up to
    /// three quarters as confidence grows, and halved again for critical
    /// anomalies.
    #[must_use]
    pub fn horizon_for(&self, severity: Severity, confidence: f64) -> Duration {
        let horizon = self
            .horizon
            .mul_f64(1.0 - 0.75 * confidence.clamp(0.0, 1.0));
        if severity == Severity::Critical {
            horizon / 2
        } else {
            horizon
        }
    }
}

/// Plausible range of a reading value. Values outside are rejected as bad
/// input rather than classified.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct Limit {
    pub min: f64,
    pub max: f64,
}

impl Limit {
    fn contains(self, value: f64) -> bool {
        (self.min..=self.max).contains(&value)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct ReadingLimits {
    pub rotational_speed: Limit,
    pub process_temperature: Limit,
    pub air_temperature: Limit,
    pub torque: Limit,
    pub tool_wear: Limit,
}

impl Default for ReadingLimits {
    fn default() -> Self {
        let temperature = Limit {
            min: 200.0,
            max: 400.0,
        };
        Self {
            rotational_speed: Limit {
                min: 0.0,
                max: 3000.0,
            },
            process_temperature: temperature,
            air_temperature: temperature,
            torque: Limit {
                min: 0.0,
                max: 100.0,
            },
            tool_wear: Limit {
                min: 0.0,
                max: 300.0,
            },
        }
    }
}

impl ReadingLimits {
    #[must_use]
    pub fn limit(&self, parameter: Parameter) -> Limit {
        match parameter {
            Parameter::RotationalSpeed => self.rotational_speed,
            Parameter::ProcessTemperature => self.process_temperature,
            Parameter::AirTemperature => self.air_temperature,
            Parameter::Torque => self.torque,
            Parameter::ToolWear => self.tool_wear,
        }
    }

    /// Checks that every value of `measurement` is finite and plausible.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` naming the first offending parameter.
    pub fn check(&self, measurement: &Measurement) -> Result<(), Error> {
        use strum::IntoEnumIterator;

        for parameter in Parameter::iter() {
            let value = measurement.value(parameter);
            if !value.is_finite() {
                return Err(Error::Validation(format!("{parameter} must be finite")));
            }
            let limit = self.limit(parameter);
            if !limit.contains(value) {
                return Err(Error::Validation(format!(
                    "{parameter} {value} outside {}..={}",
                    limit.min, limit.max
                )));
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), Error> {
        use strum::IntoEnumIterator;

        for parameter in Parameter::iter() {
            let limit = self.limit(parameter);
            if !(limit.min.is_finite() && limit.max.is_finite() && limit.min <= limit.max) {
                return Err(Error::Validation(format!(
                    "invalid limit for {parameter}: {}..={}",
                    limit.min, limit.max
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;

    use super::{EngineConfig, RecommendationPolicy, ReadingLimits};
    use crate::{
        tables::Measurement,
        types::{AnomalyKind, Direction, Parameter, Severity},
    };

    fn measurement() -> Measurement {
        Measurement {
            time: Utc::now(),
            rotational_speed: 1551.0,
            process_temperature: 308.6,
            air_temperature: 298.1,
            torque: 42.8,
            tool_wear: 0.0,
            target: false,
            failure_type: None,
        }
    }

    #[test]
    fn template_lookup_order() {
        let config = EngineConfig::from_toml(
            r#"
            [recommendation]
            min_severity = "medium"

            [[recommendation.rules]]
            equipment_type = "pump"
            category = "torque"
            action = "Check the impeller of the {equipment_type}."
            horizon = "3days"

            [[recommendation.rules]]
            category = "torque"
            action = "Check the load."
            horizon = "36h"

            [recommendation.fallback]
            action = "Look at it."
            horizon = "1day"
            "#,
        )
        .unwrap();
        let policy = &config.recommendation;
        assert_eq!(policy.min_severity, Severity::Medium);
        assert_eq!(
            policy.template_for("pump", "torque").horizon,
            Duration::from_secs(72 * 3600)
        );
        assert_eq!(policy.template_for("lathe", "torque").action, "Check the load.");
        assert_eq!(policy.template_for("pump", "tool_wear").action, "Look at it.");
        assert_eq!(config.limits, ReadingLimits::default());
    }

    #[test]
    fn defaults_cover_every_category() {
        use strum::IntoEnumIterator;

        let policy = RecommendationPolicy::default();
        assert_eq!(policy.min_severity, Severity::High);
        for parameter in Parameter::iter() {
            assert_ne!(
                policy.template_for("pump", parameter.as_ref()),
                &policy.fallback
            );
        }
        assert_eq!(
            policy.template_for("pump", "failure").horizon,
            Duration::from_secs(4 * 3600)
        );
        assert_eq!(policy.template_for("pump", "vibration"), &policy.fallback);
    }

    #[test]
    fn render_placeholders() {
        let policy = RecommendationPolicy::default();
        let kind = AnomalyKind::OutOfRange {
            parameter: Parameter::Torque,
            direction: Direction::Above,
        };
        let text = policy
            .template_for("mill", "torque")
            .render("mill", &kind, Severity::High);
        assert_eq!(
            text,
            "Inspect the load and spindle of the mill: torque is above the normal range (high)."
        );

        let kind = AnomalyKind::FailureSignal {
            failure_type: Some("Power Failure".to_string()),
        };
        let text = policy
            .template_for("mill", kind.category())
            .render("mill", &kind, Severity::Critical);
        assert_eq!(text, "Stop the mill and inspect it for Power Failure.");
    }

    #[test]
    fn horizon_scaling() {
        let policy = RecommendationPolicy::default();
        let template = policy.template_for("pump", "process_temperature");
        let hours = |d: Duration| d.as_secs_f64() / 3600.0;
        assert!((hours(template.horizon_for(Severity::High, 0.0)) - 72.0).abs() < 1e-6);
        assert!((hours(template.horizon_for(Severity::High, 1.0)) - 18.0).abs() < 1e-6);
        assert!((hours(template.horizon_for(Severity::Critical, 1.0)) - 9.0).abs() < 1e-6);
        assert!((hours(template.horizon_for(Severity::High, 0.5)) - 45.0).abs() < 1e-6);
    }

    #[test]
    fn reading_limits() {
        let limits = ReadingLimits::default();
        assert!(limits.check(&measurement()).is_ok());

        let stalled = Measurement {
            rotational_speed: 0.0,
            ..measurement()
        };
        assert!(limits.check(&stalled).is_ok());

        let hot = Measurement {
            process_temperature: 450.0,
            ..measurement()
        };
        assert!(limits.check(&hot).is_err());

        let nan = Measurement {
            torque: f64::NAN,
            ..measurement()
        };
        assert!(limits.check(&nan).is_err());

        let inf = Measurement {
            tool_wear: f64::INFINITY,
            ..measurement()
        };
        assert!(limits.check(&inf).is_err());
    }

    #[test]
    fn rejects_bad_config() {
        assert!(EngineConfig::from_toml("recommendation = 3").is_err());
        assert!(EngineConfig::from_toml(
            "[limits.torque]\nmin = 50.0\nmax = 10.0\n"
        )
        .is_err());
        assert_eq!(EngineConfig::from_toml("").unwrap(), EngineConfig::default());
    }
}
