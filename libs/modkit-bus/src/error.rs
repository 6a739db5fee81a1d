//! Crate-wide error type for consumer registration and endpoint wiring.

use crate::config::ConfigError;
use crate::hub::ServiceHubError;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The resolution context failed while looking up a collaborator or creating a consumer.
    #[error("resolution failed: {0}")]
    ResolutionFailure(#[from] ServiceHubError),

    #[error("consumer '{consumer}' is not registered")]
    ConsumerNotRegistered { consumer: &'static str },

    #[error("invalid endpoint address '{address}': {reason}")]
    InvalidEndpointAddress { address: String, reason: &'static str },

    #[error("invalid specification for consumer '{consumer}': {reason}")]
    InvalidSpecification { consumer: String, reason: String },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl BusError {
    /// `true` for failures raised by the resolution context rather than by caller misuse.
    #[must_use]
    pub fn is_resolution_failure(&self) -> bool {
        matches!(self, BusError::ResolutionFailure(_))
    }
}
