pub mod orchestrator;
mod runner;
pub mod types;

pub use orchestrator::{TaskOrchestrator, TaskRegistry};
pub use types::{Task, TaskEvent, TaskKind, TaskOutput, TaskStatus, TextSource};
