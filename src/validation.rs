//! Validation gate for predictor state.
//!
//! Every write path runs state through here before it reaches a backend.
//! All violations are collected, not just the first one.

use crate::error::{ValidationError, Violation};
use crate::predictor::{PredictorRecord, PredictorState};

/// Constraint name for a required field that is absent.
pub const NOT_NULL: &str = "NotNull";

/// Constraint name for a required text field that is empty.
pub const NOT_BLANK: &str = "NotBlank";

/// Accumulates violations across fields.
#[derive(Debug, Default)]
struct Violations(Vec<Violation>);

impl Violations {
    fn require<T>(&mut self, field: &'static str, value: Option<T>) -> Option<T> {
        if value.is_none() {
            self.0.push(Violation::new(field, NOT_NULL, "must not be null"));
        }
        value
    }

    fn require_text(&mut self, field: &'static str, value: &str) {
        if value.trim().is_empty() {
            self.0.push(Violation::new(field, NOT_BLANK, "must not be blank"));
        }
    }

    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn finish(self) -> Result<(), ValidationError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::new(self.0))
        }
    }
}

/// Validates a predictor type on its own, as done when enabling.
///
/// # Errors
/// Returns `predictorType (NotBlank)` for empty or whitespace-only input.
pub fn validate_predictor_type(predictor_type: &str) -> Result<(), ValidationError> {
    let mut violations = Violations::default();
    violations.require_text("predictorType", predictor_type);
    violations.finish()
}

impl PredictorState {
    /// Checks the non-null invariants and returns the persistable record.
    ///
    /// The utilization key and its three fields cannot be absent in this
    /// representation, so only the optional columns and the predictor type
    /// are checked at runtime.
    ///
    /// # Errors
    /// Returns a [`ValidationError`] listing every violated field.
    pub fn validate(&self) -> Result<PredictorRecord, ValidationError> {
        let mut violations = Violations::default();
        violations.require_text("predictorType", &self.predictor_type);
        let latest_utilization = violations.require("latestUtilization", self.latest_utilization);
        let internal_state = violations.require("internalState", self.internal_state.clone());

        match (latest_utilization, internal_state) {
            (Some(latest_utilization), Some(internal_state)) if violations.is_empty() => {
                Ok(PredictorRecord {
                    predictor_id: self.predictor_id,
                    predictor_type: self.predictor_type.clone(),
                    utilization_key: self.utilization_key,
                    latest_utilization,
                    more_utilizations: self.more_utilizations,
                    internal_state,
                })
            }
            _ => Err(ValidationError::new(violations.0)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predictor::{InternalState, PredictorId};
    use crate::utilization::{CapacityType, FacilityId, Usage, UtilizationKey};
    use chrono::Utc;

    fn state() -> PredictorState {
        PredictorState::new(
            PredictorId::new(1),
            "type",
            UtilizationKey::new(FacilityId::new(1), CapacityType::Car, Usage::ParkAndRide),
        )
    }

    #[test]
    fn valid_state_converts_to_record() {
        let mut s = state();
        let now = Utc::now();
        s.latest_utilization = Some(now);
        s.internal_state = Some(InternalState::new("x"));
        s.more_utilizations = false;

        let record = s.validate().unwrap();
        assert_eq!(record.latest_utilization, now);
        assert_eq!(record.internal_state.as_str(), "x");
        assert!(!record.more_utilizations);
        assert_eq!(record.predictor_id, s.predictor_id);
    }

    #[test]
    fn reports_all_missing_fields_together() {
        let mut s = state();
        s.latest_utilization = None;
        s.internal_state = None;

        let err = s.validate().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("latestUtilization (NotNull)"), "{msg}");
        assert!(msg.contains("internalState (NotNull)"), "{msg}");
        assert_eq!(err.violations().len(), 2);
    }

    #[test]
    fn blank_predictor_type_is_reported_with_other_violations() {
        let mut s = state();
        s.predictor_type = "  ".to_string();
        s.internal_state = None;

        let err = s.validate().unwrap_err();
        assert!(err.has_violation("predictorType"));
        assert!(err.has_violation("internalState"));
        assert!(!err.has_violation("latestUtilization"));
    }

    #[test]
    fn empty_internal_state_is_valid() {
        let s = state();
        assert!(s.internal_state.as_ref().is_some_and(InternalState::is_empty));
        assert!(s.validate().is_ok());
    }

    #[test]
    fn standalone_predictor_type_check() {
        assert!(validate_predictor_type("linear").is_ok());
        let err = validate_predictor_type("").unwrap_err();
        assert_eq!(err.to_string(), "Invalid data. Violations in predictorType (NotBlank)");
    }
}
