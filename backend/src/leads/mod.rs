//! Lead engines: scoring, owner assignment, duplicate detection and merging

pub mod assignment;
pub mod duplicates;
pub mod merge;
pub mod scoring;

pub use assignment::{AssignmentEngine, AssignmentOutcome};
pub use duplicates::DuplicateDetector;
pub use merge::{MergeExecutor, MergeRequest};
pub use scoring::{RecalculationReport, ScoreChange, ScoringEngine};
