//! The configuration registry: loads, validates, and hot-reloads the
//! Analysis/Corrective profile tree that drives the vision model prompts,
//! and watches the config directory for changes.

pub mod file_watcher;
pub mod profile;
pub mod registry;

pub use file_watcher::{FileChangeEvent, FileChangeKind, FileWatcher, FileWatcherConfig};
pub use profile::{AnalysisProfile, CorrectiveProfile, ProfileError, ProfileSet};
pub use registry::{ConfigRegistry, RegistryError};
