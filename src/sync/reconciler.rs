//! Cross-Device Reconciler
//!
//! Keeps the primary and companion replicas eventually consistent.
//!
//! ## Merge rule
//!
//! ```text
//!   remote.epoch > local.epoch  →  adopt the reset, then max-merge
//!   remote.epoch < local.epoch  →  stale, ignore every field
//!   equal                       →  max-merge
//!
//!   max-merge:  every monotonic field / count entry = max(local, remote)
//!               total_ever_earned = max(merged total, Σ merged buckets)
//!               balance = total_ever_earned − total_spent   (never merged)
//!               yields  = income model over merged upgrade counts
//! ```
//!
//! The rule is a join: commutative, associative and idempotent, so replays
//! and out-of-order delivery converge to the same state.
//!
//! ## Companion deltas
//!
//! Max-merge alone would drop earnings made on the companion while the
//! primary kept accruing. The companion therefore also ships each local
//! earning as a sequenced [`LedgerDelta`]; the primary credits every delta
//! above its per-device watermark exactly once and acknowledges it, and the
//! companion forgets acknowledged deltas.

use std::collections::BTreeMap;
use rust_decimal::Decimal;
use serde::{Serialize, Deserialize};
use tracing::{debug, info, warn};

use crate::core::amount::{Amount, max_amount};
use crate::core::hash::StateHash;
use crate::economy::catalog::Catalog;
use crate::economy::income::refresh_yields;
use crate::economy::ledger::{Ledger, IncomeSource};
use crate::sync::protocol::{
    DeviceId, DeviceRole, LedgerDelta, MessageKind, PeerMessage, SyncFields,
    WIRE_VERSION, sync_view_hash,
};

// =============================================================================
// FIELD MERGE
// =============================================================================

/// How a remote snapshot related to the local replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Same epoch, max-merged.
    Merged,
    /// Remote was from a newer epoch; local reset adopted first.
    AdoptedReset,
    /// Remote was from an older epoch; ignored.
    Stale,
}

/// Merge a remote snapshot into `ledger`.
///
/// The merge runs on a copy; `ledger` only changes once it completed.
pub fn merge_fields(ledger: &mut Ledger, remote: &SyncFields, catalog: &Catalog) -> MergeOutcome {
    let mut staged = ledger.clone();
    let outcome = merge_into(&mut staged, remote, catalog);
    if outcome != MergeOutcome::Stale {
        *ledger = staged;
    }
    outcome
}

fn merge_into(ledger: &mut Ledger, remote: &SyncFields, catalog: &Catalog) -> MergeOutcome {
    let remote_epoch = remote.reset_epoch.unwrap_or(ledger.reset_epoch);

    let outcome = if remote_epoch < ledger.reset_epoch {
        return MergeOutcome::Stale;
    } else if remote_epoch > ledger.reset_epoch {
        let per_step_yield = ledger.per_step_yield;
        *ledger = Ledger::new(per_step_yield);
        ledger.reset_epoch = remote_epoch;
        MergeOutcome::AdoptedReset
    } else {
        MergeOutcome::Merged
    };

    fn raise(local: &mut Amount, remote: Option<Amount>) {
        if let Some(r) = remote {
            *local = max_amount(*local, r);
        }
    }

    raise(&mut ledger.total_ever_earned, remote.total_ever_earned);
    raise(&mut ledger.total_spent, remote.total_spent);
    raise(&mut ledger.earned_from_clicks, remote.earned_from_clicks);
    raise(&mut ledger.earned_from_idle, remote.earned_from_idle);
    raise(&mut ledger.earned_from_steps, remote.earned_from_steps);
    raise(&mut ledger.earned_from_mini_games, remote.earned_from_mini_games);
    if let Some(steps) = remote.total_steps {
        ledger.total_steps = ledger.total_steps.max(steps);
    }
    for (id, &count) in &remote.upgrade_counts {
        let entry = ledger.upgrade_quantities.entry(id.clone()).or_insert(0);
        *entry = (*entry).max(count);
    }
    for (id, &count) in &remote.exchange_counts {
        let entry = ledger.exchanged_counts.entry(id.clone()).or_insert(0);
        *entry = (*entry).max(count);
    }

    // Buckets merged independently can only sum above the merged total when
    // the two sides earned from different sources; the total follows them.
    let buckets = ledger.bucket_sum();
    ledger.total_ever_earned = max_amount(ledger.total_ever_earned, buckets);
    ledger.total_spent = ledger.total_spent.min(ledger.total_ever_earned);

    ledger.rebalance();
    refresh_yields(catalog, ledger);
    outcome
}

/// Pure join of two replicas.
pub fn join(a: &Ledger, b: &Ledger, catalog: &Catalog) -> Ledger {
    let mut merged = a.clone();
    merge_fields(&mut merged, &SyncFields::from_ledger(b), catalog);
    merged
}

// =============================================================================
// DELTAS
// =============================================================================

/// Credit one delta atomically.
fn apply_delta(ledger: &mut Ledger, delta: &LedgerDelta) -> bool {
    let mut staged = ledger.clone();
    let ok = staged.credit(delta.clicks, IncomeSource::Click).is_ok()
        && staged.credit_step_earnings(delta.steps, delta.step_earnings).is_ok();
    if ok {
        *ledger = staged;
    }
    ok
}

/// Summary of one absorbed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbsorbOutcome {
    /// Field merge result (`None` when the message was rejected).
    pub merge: Option<MergeOutcome>,
    /// Deltas credited.
    pub deltas_applied: usize,
    /// Deltas skipped as replays or stale epochs.
    pub deltas_skipped: usize,
    /// Outbox entries released by the peer's acknowledgement.
    pub deltas_acked: usize,
}

impl AbsorbOutcome {
    fn rejected() -> Self {
        Self { merge: None, deltas_applied: 0, deltas_skipped: 0, deltas_acked: 0 }
    }
}

// =============================================================================
// RECONCILER
// =============================================================================

/// Persisted per-device sync bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcilerState {
    /// Local mutation counter, sent as the logical timestamp.
    pub revision: u64,
    /// Companion: highest delta seq assigned.
    pub last_delta_seq: u64,
    /// Companion: highest delta seq that has left the device.
    pub sent_delta_seq: u64,
    /// Companion: deltas not yet acknowledged.
    pub outbox: Vec<LedgerDelta>,
    /// Primary: highest applied delta seq per companion.
    pub applied_delta_seq: BTreeMap<DeviceId, u64>,
    /// Sync-view hash the peer last confirmed.
    pub last_acked_hash: Option<StateHash>,
}

/// Sync state machine for one device.
#[derive(Debug, Clone)]
pub struct Reconciler {
    device_id: DeviceId,
    role: DeviceRole,
    state: ReconcilerState,
}

impl Reconciler {
    /// Create with restored (or default) bookkeeping.
    pub fn new(device_id: DeviceId, role: DeviceRole, state: ReconcilerState) -> Self {
        Self { device_id, role, state }
    }

    /// This device.
    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    /// This device's role.
    pub fn role(&self) -> DeviceRole {
        self.role
    }

    /// Bookkeeping to persist.
    pub fn state(&self) -> &ReconcilerState {
        &self.state
    }

    /// Deltas waiting for acknowledgement.
    pub fn pending_deltas(&self) -> &[LedgerDelta] {
        &self.state.outbox
    }

    /// Bump the logical timestamp after a local mutation batch.
    pub fn note_local_change(&mut self) {
        self.state.revision = self.state.revision.saturating_add(1);
    }

    /// Companion: queue a locally applied earning for the primary.
    pub fn record_local_delta(&mut self, epoch: u64, clicks: Amount, steps: u64, step_earnings: Amount) {
        if self.role != DeviceRole::Companion {
            return;
        }
        if clicks.is_zero() && steps == 0 && step_earnings.is_zero() {
            return;
        }

        // Coalesce into the newest unsent entry of the same epoch.
        if let Some(last) = self.state.outbox.last_mut() {
            if last.epoch == epoch && last.seq > self.state.sent_delta_seq {
                last.clicks = last.clicks.saturating_add(clicks);
                last.steps = last.steps.saturating_add(steps);
                last.step_earnings = last.step_earnings.saturating_add(step_earnings);
                return;
            }
        }

        self.state.last_delta_seq = self.state.last_delta_seq.saturating_add(1);
        self.state.outbox.push(LedgerDelta {
            seq: self.state.last_delta_seq,
            epoch,
            clicks,
            steps,
            step_earnings,
        });
    }

    /// Seal the outbox so later earnings get a new seq.
    ///
    /// A delta the peer may already have applied must never grow afterwards.
    fn seal_outbox(&mut self) {
        self.state.sent_delta_seq = self.state.last_delta_seq;
    }

    /// Whether a sync send would carry anything new.
    pub fn needs_send(&self, ledger: &Ledger) -> bool {
        !self.state.outbox.is_empty()
            || self.state.last_acked_hash != Some(sync_view_hash(ledger))
    }

    /// Build an outgoing message from the current replica.
    pub fn outgoing(&mut self, ledger: &Ledger, kind: MessageKind) -> PeerMessage {
        self.seal_outbox();
        PeerMessage {
            version: WIRE_VERSION,
            kind,
            sender: self.device_id,
            role: self.role,
            revision: self.state.revision,
            fields: SyncFields::from_ledger(ledger).to_wire(),
            deltas: self.state.outbox.clone(),
            delta_acks: self.state.applied_delta_seq.clone(),
        }
    }

    /// Fold a peer message into the local replica.
    pub fn absorb(&mut self, ledger: &mut Ledger, catalog: &Catalog, msg: &PeerMessage) -> AbsorbOutcome {
        if !msg.is_supported_version() {
            warn!("Ignoring peer message with unsupported version {}", msg.version);
            return AbsorbOutcome::rejected();
        }
        if msg.sender == self.device_id {
            warn!("Ignoring peer message echoed from this device");
            return AbsorbOutcome::rejected();
        }

        let mut outcome = AbsorbOutcome::rejected();

        // Acknowledgements release our outbox.
        if let Some(&acked) = msg.delta_acks.get(&self.device_id) {
            let before = self.state.outbox.len();
            self.state.outbox.retain(|d| d.seq > acked);
            outcome.deltas_acked = before - self.state.outbox.len();
        }

        let fields = msg.sync_fields();
        let remote_epoch = fields.reset_epoch.unwrap_or(ledger.reset_epoch);
        let adopting = remote_epoch > ledger.reset_epoch;

        if adopting {
            info!(
                "Adopting reset epoch {} from {} (local {})",
                remote_epoch, msg.sender, ledger.reset_epoch
            );
            self.state.outbox.clear();
        }

        // Deltas go in before the snapshot: the snapshot already contains
        // them, so max-merging it afterwards adds nothing twice.
        if self.role == DeviceRole::Primary && msg.role == DeviceRole::Companion {
            let watermark = self.state.applied_delta_seq.entry(msg.sender).or_insert(0);
            for delta in &msg.deltas {
                if delta.seq <= *watermark {
                    outcome.deltas_skipped += 1;
                    continue;
                }
                *watermark = delta.seq;
                if adopting || delta.epoch != ledger.reset_epoch {
                    debug!("Skipping delta {} from epoch {}", delta.seq, delta.epoch);
                    outcome.deltas_skipped += 1;
                    continue;
                }
                if apply_delta(ledger, delta) {
                    outcome.deltas_applied += 1;
                } else {
                    warn!("Dropping unappliable delta {} from {}", delta.seq, msg.sender);
                    outcome.deltas_skipped += 1;
                }
            }
        }

        outcome.merge = Some(merge_fields(ledger, &fields, catalog));
        outcome
    }

    /// Record that the peer has confirmed our current sync view.
    pub fn mark_acked(&mut self, ledger: &Ledger) {
        self.state.last_acked_hash = Some(sync_view_hash(ledger));
    }

    /// Forget every queued delta (local reset).
    pub fn clear_outbox(&mut self) {
        self.state.outbox.clear();
    }
}

/// Click earnings still waiting in an outbox.
pub fn pending_click_total(deltas: &[LedgerDelta]) -> Amount {
    deltas.iter().fold(Decimal::ZERO, |acc, d| acc.saturating_add(d.clicks))
}

// =============================================================================
// TESTS
// =============================================================================
