pub mod alerts;
pub mod backfill;
pub mod merge;
pub mod orchestrator;
pub mod retry;
pub mod scheduler;
