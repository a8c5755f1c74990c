pub mod commands;
pub mod conversation;
pub mod store;
pub mod templates;
pub mod worker;

pub use commands::CommandProcessor;
pub use store::SharedStore;
pub use worker::{ChatWorker, WorkerRegistry};
