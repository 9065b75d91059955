//! Record validation seam.

use crate::event::{EventError, MetricEvent, SchemaOptions};

/// Split of a batch into persistable and rejected records.
#[derive(Debug, Default)]
pub struct ValidationOutcome {
    pub valid: Vec<MetricEvent>,
    pub invalid: Vec<(MetricEvent, EventError)>,
}

impl ValidationOutcome {
    pub fn total(&self) -> usize {
        self.valid.len() + self.invalid.len()
    }
}

/// Pluggable batch validator.
pub trait RecordValidator: Send + Sync {
    fn validate(&self, records: Vec<MetricEvent>) -> ValidationOutcome;
}

/// Wire-schema validator; the default.
#[derive(Debug, Clone, Default)]
pub struct SchemaValidator {
    options: SchemaOptions,
}

impl SchemaValidator {
    pub fn new(options: SchemaOptions) -> Self {
        Self { options }
    }
}

impl RecordValidator for SchemaValidator {
    fn validate(&self, records: Vec<MetricEvent>) -> ValidationOutcome {
        let mut outcome = ValidationOutcome::default();
        for record in records {
            match record.validate(&self.options) {
                Ok(()) => outcome.valid.push(record),
                Err(e) => outcome.invalid.push((record, e)),
            }
        }
        outcome
    }
}
