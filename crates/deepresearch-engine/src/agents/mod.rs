//! The model-driven stages of a research run.

mod brief;
mod clarify;
mod compressor;
mod report;
mod researcher;
mod supervisor;

pub use brief::BriefSynthesizer;
pub use clarify::{ClarificationGate, ClarifyWithUser};
pub use compressor::Compressor;
pub use report::ReportGenerator;
pub use researcher::{Researcher, ResearcherStep};
pub use supervisor::{
    NotesLedger, ResearchSupervisor, SupervisorDecision, SupervisorOutcome, Termination,
};
