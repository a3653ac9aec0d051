//! Cross-device sync: wire protocol, reconciliation, transport and cadence.

pub mod protocol;
pub mod reconciler;
pub mod link;
pub mod scheduler;

pub use protocol::{
    DeviceId, DeviceRole, LedgerDelta, MessageKind, PeerMessage, SyncFields,
    WIRE_VERSION, MIN_WIRE_VERSION, sync_view_hash,
};
pub use reconciler::{AbsorbOutcome, MergeOutcome, Reconciler, ReconcilerState, join, merge_fields};
pub use link::{LoopbackLink, PeerLink, SyncEndpoint, SyncError, WsPeerLink, serve_peer};
pub use scheduler::PeriodicTask;
