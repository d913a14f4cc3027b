pub mod cache;
pub mod catalog;
pub mod episode;
pub mod evaluator;
pub mod events;
pub mod executor;
pub mod markers;
pub mod orchestrator;
pub mod progress;
pub mod queue;
pub mod resolver;
pub mod restore;
pub mod scanner;
