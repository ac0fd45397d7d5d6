use crate::stages::Stage;
use thiserror::Error;

/// Terminal outcome of a failed pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid pipeline settings: {0}")]
    InvalidSettings(String),
    #[error("pipeline failed during {stage}: {source:#}")]
    StageFailed {
        stage: Stage,
        #[source]
        source: anyhow::Error,
    },
}

impl PipelineError {
    pub fn stage(&self) -> Option<Stage> {
        match self {
            PipelineError::InvalidSettings(_) => None,
            PipelineError::StageFailed { stage, .. } => Some(*stage),
        }
    }
}
