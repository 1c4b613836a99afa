pub mod artifacts;
pub mod change_id;
pub mod command;
pub mod config;
pub mod controller;
pub mod conversion;
pub mod decision;
pub mod disk;
pub mod error;
pub mod export;
pub mod full_copy;
pub mod hypervisor;
pub mod incremental;
pub mod logger;
pub mod nbd;
pub mod pipeline;
pub mod post_import;
pub mod snapshot;
pub mod status;
pub mod target;
pub mod worker;

pub use error::MigrateError;

pub type Result<T> = std::result::Result<T, MigrateError>;

// Convenience re-exports for wiring a worker
pub use change_id::{ChangeIdStore, ChangeToken};
pub use config::WorkerConfig;
pub use controller::{CommandKind, Controller, MigrationCommand, WorkerStatus};
pub use pipeline::{CycleReport, CycleRequest, Pipeline};
pub use worker::{Worker, WorkerDeps, WorkerSettings};
