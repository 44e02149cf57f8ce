pub mod execution;
pub mod job;
pub mod recovery;
pub mod workflow;
