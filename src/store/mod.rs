//! The store engine, sessions, and checkpoint driving.

mod checkpoint_ops;
mod context;
mod functions;
mod io_worker;
mod kv;
mod recovery;
mod session;
mod settings;

pub use checkpoint_ops::CheckpointOutcome;
pub use functions::{AddFunctions, OverwriteFunctions, StoreFunctions};
pub use kv::TideKv;
pub use session::Session;
pub use settings::{
    CheckpointBackend, CheckpointSettings, LogSettings, SettingsError, StoreSettings,
};
