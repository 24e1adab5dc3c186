//! Error taxonomy for the control core.
//!
//! Errors cross component boundaries as values with a kind tag; they are
//! never used for control flow within a component. The decision engine
//! and controller may downgrade any error to "no action this tick".

use thiserror::Error;

/// Coarse classification used by callers to pick a recovery strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Single failed probe or back-end call; retried next tick.
    Transient,
    /// Repeated transient failures; the member is stale until a good sample.
    Degraded,
    /// Invalid or missing option; fatal at startup, rejected at reload.
    Configuration,
    /// A caller broke a documented precondition; logged, then continue.
    InvariantViolation,
    /// Unrecoverable; the daemon exits non-zero after flushing events.
    Fatal,
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("member {member} degraded after {ticks} failed ticks")]
    Degraded { member: String, ticks: u32 },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("insufficient data: have {have} samples, need {need}")]
    InsufficientData { have: usize, need: usize },

    #[error("fatal: {0}")]
    Fatal(String),
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Transient(_) | CoreError::InsufficientData { .. } => ErrorKind::Transient,
            CoreError::Degraded { .. } => ErrorKind::Degraded,
            CoreError::Configuration(_) => ErrorKind::Configuration,
            CoreError::InvariantViolation(_) => ErrorKind::InvariantViolation,
            CoreError::Fatal(_) => ErrorKind::Fatal,
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_variants() {
        assert_eq!(
            CoreError::Transient("probe timeout".into()).kind(),
            ErrorKind::Transient
        );
        assert_eq!(
            CoreError::InsufficientData { have: 3, need: 10 }.kind(),
            ErrorKind::Transient
        );
        assert_eq!(
            CoreError::Configuration("bad alpha".into()).kind(),
            ErrorKind::Configuration
        );
        assert_eq!(
            CoreError::InvariantViolation("unknown member".into()).kind(),
            ErrorKind::InvariantViolation
        );
        assert_eq!(CoreError::Fatal("lock lost".into()).kind(), ErrorKind::Fatal);
    }

    #[test]
    fn display_carries_context() {
        let e = CoreError::Degraded {
            member: "cell_a".into(),
            ticks: 4,
        };
        let msg = e.to_string();
        assert!(msg.contains("cell_a"));
        assert!(msg.contains('4'));
    }
}
