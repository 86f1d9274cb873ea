use thiserror::Error;

use crate::model::StepStatus;

/// Everything that can go wrong while building, running or storing a plan.
#[derive(Debug, Error)]
pub enum PlanError {
    // --- Structure ---
    #[error("plan has no steps")]
    Empty,

    #[error("duplicate step id '{0}'")]
    DuplicateStep(String),

    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("step '{0}' depends on itself")]
    SelfDependency(String),

    #[error("dependency cycle: {}", .steps.join(" -> "))]
    Cycle { steps: Vec<String> },

    #[error("invalid decomposition: {0}")]
    InvalidDecomposition(String),

    // --- Execution ---
    #[error("unknown step '{0}'")]
    UnknownStep(String),

    #[error("step '{step}' is {actual}, cannot move from {from} to {to}")]
    InvalidTransition {
        step: String,
        actual: StepStatus,
        from: StepStatus,
        to: StepStatus,
    },

    #[error("plan stalled: blocked {blocked:?}, failed {failed:?}")]
    Stalled { blocked: Vec<String>, failed: Vec<String> },

    #[error("model gateway failed: {0}")]
    Gateway(String),

    #[error("internal error: {0}")]
    Internal(String),

    // --- Persistence ---
    #[error("plan '{0}' not found")]
    NotFound(String),

    #[error("invalid plan id '{0}'")]
    InvalidId(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PlanError {
    /// Stable category name, matching `TerminationReason::category` in spirit.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Cycle { .. } => "cycle",
            Self::Stalled { .. } => "stalled",
            Self::Empty
            | Self::DuplicateStep(_)
            | Self::UnknownDependency { .. }
            | Self::SelfDependency(_)
            | Self::InvalidDecomposition(_) => "invalid_plan",
            Self::UnknownStep(_) | Self::InvalidTransition { .. } => "transition",
            Self::Gateway(_) => "gateway",
            Self::Internal(_) => "internal",
            Self::NotFound(_) | Self::InvalidId(_) | Self::Io(_) | Self::Serialization(_) => "store",
        }
    }
}
