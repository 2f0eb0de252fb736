//! Plugin lifecycle subsystem.
//!
//! The filesystem-driven controller behind the swivel server:
//! - Dynamic loading/unloading of plugin artifacts ([`DynamicLoader`])
//! - Directory watching with typed events ([`DirectoryWatcher`])
//! - Debounced interpretation of the event stream ([`WriteDebouncer`],
//!   [`DeleteBatcher`])
//! - Bounded backup history and rollback ([`BackupStore`])
//! - The live routing table ([`PluginRegistry`])
//! - The state machine composing all of the above ([`PluginManager`])

pub mod artifact;
pub mod backup;
pub mod debounce;
pub mod loader;
pub mod manager;
pub mod registry;
pub mod watcher;

pub use backup::BackupStore;
pub use debounce::{DeleteBatcher, PendingDelete, WriteDebouncer};
pub use loader::{DynamicLoader, DynamicPlugin, LoadError};
pub use manager::{ManagerError, PluginManager};
pub use registry::{LoadedEntry, PluginRegistry};
pub use watcher::{DirectoryWatcher, WatchEvent, WatchEventKind};
