//! Garbage collection of application content left on the node.

mod content;
mod manager;
mod query;

pub use content::{ContentSet, ManifestReader};
pub use manager::{DeletionManager, DeletionStats};
pub use query::{ApplicationQueryClient, ApplicationTracker, ProvisionedPackages, SecurityGroupCleaner};
