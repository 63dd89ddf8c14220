pub mod agents;
pub mod tasks;
pub mod token_usage;
pub mod workflows;
