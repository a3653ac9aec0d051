//! # Clicker Sync
//!
//! Ledger, idle accrual, motion dedup and two-device reconciliation core for
//! an idle clicker game played on a phone (primary) and a wrist device
//! (companion).
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        CLICKER SYNC                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Deterministic primitives                  │
//! │  ├── amount.rs   - Decimal currency and constants            │
//! │  ├── hash.rs     - Sync-view hashing                         │
//! │  └── clock.rs    - Injectable wall clock                     │
//! │                                                              │
//! │  economy/        - Single-device economy (deterministic)     │
//! │  ├── catalog.rs  - Upgrade and exchange tables               │
//! │  ├── ledger.rs   - Balance and cumulative counters           │
//! │  ├── income.rs   - Yields from owned upgrades                │
//! │  ├── gateway.rs  - Atomic priced intents                     │
//! │  ├── idle.rs     - Idle accrual watermark                    │
//! │  └── motion.rs   - Motion-sample deduplication               │
//! │                                                              │
//! │  sync/           - Cross-device plumbing (non-deterministic) │
//! │  ├── protocol.rs - Wire format                               │
//! │  ├── reconciler.rs - Max-merge and companion deltas          │
//! │  ├── link.rs     - Loopback and WebSocket transports         │
//! │  └── scheduler.rs - Cancellable periodic tasks               │
//! │                                                              │
//! │  device/         - Single-writer runtime                     │
//! │  ├── config.rs   - Device configuration                      │
//! │  ├── persistence.rs - Durable snapshots                      │
//! │  ├── handle.rs   - Intent and snapshot API                   │
//! │  └── runtime.rs  - Tick and sync loops                       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Determinism Guarantee
//!
//! The `core/` and `economy/` modules never read the system clock, never use
//! floating point for currency and iterate only `BTreeMap`s. Given the same
//! inputs and timestamps they produce the same ledger on every platform.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod economy;
pub mod sync;
pub mod device;

// Re-export commonly used types
pub use core::amount::Amount;
pub use core::clock::{Clock, ManualClock, SystemClock};
pub use economy::catalog::Catalog;
pub use economy::ledger::{IncomeSource, Ledger};
pub use economy::gateway::TransactionError;
pub use economy::motion::{MotionSample, MotionSource, SensorError};
pub use sync::protocol::{DeviceId, DeviceRole, PeerMessage};
pub use sync::link::{LoopbackLink, PeerLink, SyncError, WsPeerLink};
pub use device::{Device, DeviceConfig, DeviceRuntime, LedgerView, PersistenceError};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
