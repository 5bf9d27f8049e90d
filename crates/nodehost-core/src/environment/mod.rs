//! Per-application and per-activation environment management.

mod cleanup;
mod context;
mod diagnostics;
mod manager;

pub use cleanup::CleanupPlan;
pub use context::{ApplicationEnvironmentContext, ServicePackageInstanceEnvironmentContext};
pub use diagnostics::{DiagnosticsProvider, CRASH_DUMPS_FOLDER_NAME};
pub use manager::EnvironmentManager;
