//! Device runtime: configuration, durable snapshots, the single-writer
//! handle and its background loops.

pub mod config;
pub mod persistence;
pub mod handle;
pub mod runtime;

pub use config::{ConfigError, DeviceConfig};
pub use persistence::{
    DurableSnapshot, FileSnapshotStore, MemorySnapshotStore, PersistenceError, SnapshotStore,
    SNAPSHOT_VERSION,
};
pub use handle::{Device, LedgerView, SyncOutcome};
pub use runtime::DeviceRuntime;
