// Error taxonomy; every failure class maps to one process exit code

use thiserror::Error;

/// Pipeline stage, in running order. Carries the per-stage exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Probe,
    Concat,
    Segment,
    InterpUp,
    InterpDown,
    WriteList,
    Assemble,
}

impl Stage {
    pub fn exit_code(self) -> i32 {
        match self {
            Stage::Probe => 6,
            Stage::Concat => 7,
            Stage::Segment => 8,
            Stage::InterpUp => 9,
            Stage::InterpDown => 10,
            Stage::WriteList => 11,
            Stage::Assemble => 12,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Stage::Probe => "probe",
            Stage::Concat => "concat",
            Stage::Segment => "segment",
            Stage::InterpUp => "interpolate-up",
            Stage::InterpDown => "interpolate-down",
            Stage::WriteList => "write list",
            Stage::Assemble => "assemble",
        }
    }
}

/// Top-level error for the whole run. Only `main` inspects this; everything
/// below propagates with `?`.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Bad inputs, bad output path, or a blown space budget.
    #[error("{0}")]
    Usage(String),

    /// ffmpeg or ffprobe is not on PATH.
    #[error("required external tool not found: {0}")]
    MissingTool(String),

    /// A stage ran and failed (non-zero worker exit or error-classed stderr).
    #[error("{} stage failed: {msg}", .stage.name())]
    StageFailed { stage: Stage, msg: String },

    /// The watchdog lost a worker it could not account for.
    #[error("worker crash: {0}")]
    WorkerCrash(String),

    /// The user asked us to stop (signal) or an invariant breach forced it.
    #[error("terminated: {0}")]
    Terminated(String),

    /// Anything else; surfaces as the generic failure code.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::Usage(_) => 2,
            PipelineError::MissingTool(_) => 3,
            PipelineError::StageFailed { stage, .. } => stage.exit_code(),
            PipelineError::WorkerCrash(_) => 23,
            PipelineError::Terminated(_) => 42,
            PipelineError::Internal(_) => 1,
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_exit_codes_are_contiguous() {
        let stages = [
            Stage::Probe,
            Stage::Concat,
            Stage::Segment,
            Stage::InterpUp,
            Stage::InterpDown,
            Stage::WriteList,
            Stage::Assemble,
        ];
        for (i, stage) in stages.iter().enumerate() {
            assert_eq!(stage.exit_code(), 6 + i as i32);
        }
    }

    #[test]
    fn test_error_exit_codes() {
        assert_eq!(PipelineError::Usage("x".into()).exit_code(), 2);
        assert_eq!(PipelineError::MissingTool("ffmpeg".into()).exit_code(), 3);
        assert_eq!(
            PipelineError::StageFailed {
                stage: Stage::Assemble,
                msg: "x".into()
            }
            .exit_code(),
            12
        );
        assert_eq!(PipelineError::WorkerCrash("x".into()).exit_code(), 23);
        assert_eq!(PipelineError::Terminated("x".into()).exit_code(), 42);
    }
}
