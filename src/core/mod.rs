pub mod orchestrator;
pub mod worker;
