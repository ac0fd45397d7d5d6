use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// The five pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Stage {
    Metadata,
    FrameExtraction,
    AnalysisPrep,
    AiAnalysis,
    Finalization,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Metadata,
        Stage::FrameExtraction,
        Stage::AnalysisPrep,
        Stage::AiAnalysis,
        Stage::Finalization,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Metadata => "Metadata",
            Stage::FrameExtraction => "Frame Extraction",
            Stage::AnalysisPrep => "Analysis Prep",
            Stage::AiAnalysis => "AI Analysis",
            Stage::Finalization => "Finalization",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Stage::ALL.into_iter().find(|s| s.name() == name)
    }

    /// Progress reported to the status sink when this stage starts.
    pub fn progress(&self) -> u8 {
        match self {
            Stage::Metadata => 20,
            Stage::FrameExtraction => 30,
            Stage::AnalysisPrep => 50,
            Stage::AiAnalysis => 80,
            Stage::Finalization => 90,
        }
    }

    fn position(&self) -> usize {
        *self as usize
    }

    pub fn predecessor(&self) -> Option<Stage> {
        self.position().checked_sub(1).map(|i| Stage::ALL[i])
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StageStatus {
    Pending,
    InProgress,
    Complete,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StageStatus::Pending => "Pending",
            StageStatus::InProgress => "In Progress",
            StageStatus::Complete => "Complete",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("stage {stage} cannot move back from {from} to {to}")]
    Regression { stage: Stage, from: StageStatus, to: StageStatus },
    #[error("stage {stage} cannot start or finish before {predecessor} is complete")]
    PredecessorIncomplete { stage: Stage, predecessor: Stage },
    #[error("stage {stage} cannot complete before it is in progress")]
    NotStarted { stage: Stage },
}

/// Per-run state of the five stages. Statuses only move forward, and a stage
/// only leaves Pending once the stage before it is Complete. Completion
/// requires passing through InProgress.
#[derive(Debug, Clone)]
pub struct StageTracker {
    statuses: [StageStatus; 5],
}

impl StageTracker {
    pub fn new() -> Self {
        StageTracker { statuses: [StageStatus::Pending; 5] }
    }

    pub fn status(&self, stage: Stage) -> StageStatus {
        self.statuses[stage.position()]
    }

    pub fn transition(&mut self, stage: Stage, to: StageStatus) -> Result<(), TransitionError> {
        let from = self.status(stage);
        if to < from {
            return Err(TransitionError::Regression { stage, from, to });
        }
        if to > StageStatus::Pending {
            if let Some(predecessor) = stage.predecessor() {
                if self.status(predecessor) != StageStatus::Complete {
                    return Err(TransitionError::PredecessorIncomplete { stage, predecessor });
                }
            }
        }
        if from == StageStatus::Pending && to == StageStatus::Complete {
            return Err(TransitionError::NotStarted { stage });
        }
        if to != from {
            tracing::info!(stage = stage.name(), status = %to, "stage updated");
        }
        self.statuses[stage.position()] = to;
        Ok(())
    }

    /// Name-based update; unknown names and rejected transitions are logged
    /// and leave every status untouched.
    pub fn update(&mut self, name: &str, to: StageStatus) -> bool {
        let Some(stage) = Stage::from_name(name) else {
            tracing::warn!("attempted to update an unknown stage: {}", name);
            return false;
        };
        match self.transition(stage, to) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("{}", e);
                false
            }
        }
    }

    /// The stage currently running, if any.
    pub fn current(&self) -> Option<Stage> {
        Stage::ALL.into_iter().find(|s| self.status(*s) == StageStatus::InProgress)
    }

    pub fn is_finished(&self) -> bool {
        self.statuses.iter().all(|s| *s == StageStatus::Complete)
    }

    pub fn snapshot(&self) -> Vec<(Stage, StageStatus)> {
        Stage::ALL.into_iter().map(|s| (s, self.status(s))).collect()
    }
}

impl Default for StageTracker {
    fn default() -> Self {
        Self::new()
    }
}
