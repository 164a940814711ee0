//! The staged processing pipeline: adapters, bundle builder, safety checks.

pub mod adapter;
pub mod fhir;
pub mod types;
pub mod validator;

use thiserror::Error;

/// A stage failure, classified for the retry policy.
///
/// The agent's handling is a pure function of the variant: `Transient`
/// requeues up to the configured ceiling, `Permanent` fails the document
/// immediately without consuming retries.
#[derive(Error, Debug)]
pub enum StageError {
    #[error("transient: {0}")]
    Transient(String),

    #[error("permanent: {0}")]
    Permanent(String),
}

impl StageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}
