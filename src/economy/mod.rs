//! Single-device economy.
//!
//! The ledger, the catalog and income model that derive its yields, the
//! transaction gateway that mutates it, and the two time/sensor inputs
//! (idle clock, motion deduplicator) that feed it.

pub mod catalog;
pub mod ledger;
pub mod income;
pub mod gateway;
pub mod idle;
pub mod motion;

// Re-export commonly used types
pub use catalog::{Catalog, CatalogError, ExchangeTier, ExchangeTierId, Upgrade, UpgradeId};
pub use ledger::{IncomeSource, Ledger, LedgerError};
pub use income::{Yields, compute_yields, refresh_yields};
pub use gateway::{PurchaseReceipt, TransactionError};
pub use idle::{Accrual, IdleClock};
pub use motion::{
    MotionDedupState, MotionDeduplicator, MotionSample, MotionSource, SampleId, SensorError,
    StepAward,
};
