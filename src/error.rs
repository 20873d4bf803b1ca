use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Malformed pipeline: {}", .errors.join("; "))]
    MalformedPipeline { errors: Vec<String> },

    #[error("Stage '{stage}' step {step_index}: credential '{name}' is not available")]
    MissingCredential {
        stage: String,
        step_index: usize,
        name: String,
    },

    #[error("Stage '{stage}' step {step_index} failed with exit code {exit_code}: {message}")]
    StepFailure {
        stage: String,
        step_index: usize,
        exit_code: i32,
        message: String,
    },

    #[error("Stage '{stage}' step {step_index} timed out after {}s", .timeout.as_secs())]
    TimeoutFailure {
        stage: String,
        step_index: usize,
        timeout: Duration,
    },

    #[error("Gate '{gate}' on stage '{stage}' could not be evaluated: {reason}")]
    GateEvaluation {
        gate: String,
        stage: String,
        reason: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedPipeline {
            errors: vec![message.into()],
        }
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::MalformedPipeline { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_lists_every_error() {
        let err = PipelineError::MalformedPipeline {
            errors: vec!["first".into(), "second".into()],
        };
        assert_eq!(err.to_string(), "Malformed pipeline: first; second");
        assert!(err.is_malformed());
    }

    #[test]
    fn step_errors_carry_location() {
        let err = PipelineError::TimeoutFailure {
            stage: "scan".into(),
            step_index: 2,
            timeout: Duration::from_secs(5),
        };
        assert_eq!(err.to_string(), "Stage 'scan' step 2 timed out after 5s");
    }
}
