//! Pipeline stage machine.
//!
//! The graph tasks carry out the work; this table decides which moves are
//! legal so a mis-wired graph fails loudly instead of skipping a stage.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::events::ProgressStage;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    #[default]
    Clarifying,
    Briefing,
    Researching,
    Compressing,
    Reporting,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    AwaitUser,
    Proceed,
    Delegate,
    RoundComplete,
    ResearchFinished,
    ReportWritten,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid stage transition {transition:?} from {from:?}")]
pub struct InvalidTransition {
    pub from: Stage,
    pub transition: Transition,
}

impl Stage {
    pub fn next(self, transition: Transition) -> Result<Stage, InvalidTransition> {
        use Stage::*;
        use Transition::*;

        match (self, transition) {
            (Clarifying, AwaitUser) => Ok(Clarifying),
            (Clarifying, Proceed) => Ok(Briefing),
            (Briefing, Proceed) => Ok(Researching),
            (Researching, Delegate) => Ok(Compressing),
            (Compressing, RoundComplete) => Ok(Researching),
            (Researching, ResearchFinished) => Ok(Reporting),
            (Reporting, ReportWritten) => Ok(Done),
            (from, transition) => Err(InvalidTransition { from, transition }),
        }
    }

    /// Stage name reported to progress observers; `None` once the run is done.
    pub fn progress_stage(self) -> Option<ProgressStage> {
        match self {
            Stage::Clarifying => Some(ProgressStage::Clarify),
            Stage::Briefing => Some(ProgressStage::Brief),
            Stage::Researching | Stage::Compressing => Some(ProgressStage::Research),
            Stage::Reporting => Some(ProgressStage::Report),
            Stage::Done => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Done)
    }
}
