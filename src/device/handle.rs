//! Device Handle
//!
//! The single-writer boundary for one device. Every intent, timer tick,
//! sensor batch and peer message funnels through one `tokio::sync::Mutex`
//! around [`DeviceState`]; the lock is never held across a peer round trip
//! or a sensor query.
//!
//! ```text
//!   UI intents ─┐
//!   idle tick ──┤                 ┌──────────────┐
//!   sensor ─────┼──► Device ─────►│ DeviceState  │──► SnapshotStore
//!   peer msg ───┘    (Mutex)      │ ledger       │
//!                                 │ motion dedup │
//!                                 │ idle clock   │
//!                                 │ reconciler   │
//!                                 └──────────────┘
//! ```
//!
//! Persistence: taps only mark the state dirty (flushed on the next tick);
//! every other mutation batch is written immediately. A failed write keeps
//! the in-memory state authoritative and is retried with the next batch.

use std::collections::BTreeMap;
use std::sync::Arc;
use async_trait::async_trait;
use serde::{Serialize, Deserialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::core::amount::Amount;
use crate::core::clock::Clock;
use crate::core::hash::short_hex;
use crate::device::config::DeviceConfig;
use crate::device::persistence::{DurableSnapshot, PersistenceError, SnapshotStore, SNAPSHOT_VERSION};
use crate::economy::catalog::{Catalog, ExchangeTierId, UpgradeId};
use crate::economy::gateway::{self, TransactionError};
use crate::economy::idle::{Accrual, IdleClock};
use crate::economy::income::refresh_yields;
use crate::economy::ledger::{IncomeSource, Ledger};
use crate::economy::motion::{
    MotionDeduplicator, MotionSample, MotionSource, SensorError, StepAward,
};
use crate::sync::link::{PeerLink, SyncEndpoint, SyncError};
use crate::sync::protocol::{DeviceId, DeviceRole, MessageKind, PeerMessage, sync_view_hash};
use crate::sync::reconciler::{MergeOutcome, Reconciler, ReconcilerState, pending_click_total};

// =============================================================================
// VIEWS
// =============================================================================

/// Read-only ledger snapshot for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerView {
    /// Device role.
    pub role: DeviceRole,
    /// Spendable currency.
    pub balance: Amount,
    /// Lifetime earnings.
    pub total_ever_earned: Amount,
    /// Lifetime spending.
    pub total_spent: Amount,
    /// Currency per tap.
    pub per_click_yield: Amount,
    /// Currency per idle second.
    pub per_second_yield: Amount,
    /// Currency per awarded step.
    pub per_step_yield: Amount,
    /// Lifetime awarded steps.
    pub total_steps: u64,
    /// Click bucket.
    pub earned_from_clicks: Amount,
    /// Idle bucket.
    pub earned_from_idle: Amount,
    /// Step bucket.
    pub earned_from_steps: Amount,
    /// Mini-game bucket.
    pub earned_from_mini_games: Amount,
    /// Owned upgrades.
    pub upgrade_quantities: BTreeMap<UpgradeId, u64>,
    /// Exchange counts.
    pub exchanged_counts: BTreeMap<ExchangeTierId, u64>,
    /// Reset generation.
    pub reset_epoch: u64,
    /// Companion deltas not yet acknowledged by the primary.
    pub pending_deltas: usize,
    /// Click earnings inside those deltas.
    pub pending_clicks: Amount,
    /// Whether the last sync attempts kept failing.
    pub peer_unreachable: bool,
    /// Sensor guidance not yet shown to the user.
    pub sensor_guidance: Option<String>,
}

/// Result of one [`Device::sync_once`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Nothing new to send.
    UpToDate,
    /// Another sync on this device is still running.
    InProgress,
    /// Round trip completed and the reply was merged.
    Synced {
        /// How the reply's snapshot related to ours.
        merge: MergeOutcome,
        /// Companion deltas credited from the reply.
        deltas_applied: usize,
        /// Own outbox entries released by the reply.
        deltas_acked: usize,
    },
}

// =============================================================================
// STATE
// =============================================================================

/// Everything guarded by the device lock.
#[derive(Debug)]
struct DeviceState {
    ledger: Ledger,
    motion: MotionDeduplicator,
    idle: IdleClock,
    reconciler: Reconciler,
    dirty: bool,
    sensor_issue: Option<SensorError>,
    guidance_pending: bool,
    sync_failures: u32,
}

impl DeviceState {
    fn view(&self, sync_failure_threshold: u32) -> LedgerView {
        let l = &self.ledger;
        LedgerView {
            role: self.reconciler.role(),
            balance: l.balance(),
            total_ever_earned: l.total_ever_earned(),
            total_spent: l.total_spent(),
            per_click_yield: l.per_click_yield(),
            per_second_yield: l.per_second_yield(),
            per_step_yield: l.per_step_yield(),
            total_steps: l.total_steps(),
            earned_from_clicks: l.earned_from(IncomeSource::Click),
            earned_from_idle: l.earned_from(IncomeSource::Idle),
            earned_from_steps: l.earned_from(IncomeSource::Step),
            earned_from_mini_games: l.earned_from(IncomeSource::MiniGame),
            upgrade_quantities: l.upgrade_quantities().clone(),
            exchanged_counts: l.exchanged_counts().clone(),
            reset_epoch: l.reset_epoch(),
            pending_deltas: self.reconciler.pending_deltas().len(),
            pending_clicks: pending_click_total(self.reconciler.pending_deltas()),
            peer_unreachable: self.sync_failures >= sync_failure_threshold,
            sensor_guidance: self
                .sensor_issue
                .as_ref()
                .filter(|_| self.guidance_pending)
                .map(|e| e.guidance().to_string()),
        }
    }

    /// Settle idle income through `settle`; a refused credit rewinds the
    /// idle watermark so the interval is not lost.
    fn accrue_idle<F>(&mut self, settle: F) -> Accrual
    where
        F: FnOnce(&mut IdleClock, Amount) -> Accrual,
    {
        let watermark = self.idle.last_accounted();
        let accrual = settle(&mut self.idle, self.ledger.per_second_yield());
        if accrual.is_empty() {
            return accrual;
        }
        match self.ledger.credit(accrual.amount, IncomeSource::Idle) {
            Ok(()) => {
                self.reconciler.note_local_change();
                self.dirty = true;
                accrual
            }
            Err(e) => {
                warn!("Idle accrual of {} deferred: {}", accrual.amount, e);
                self.idle.rewind(watermark);
                Accrual::NONE
            }
        }
    }

    /// Award a sample batch atomically: watermarks and ledger move together.
    fn apply_motion(&mut self, samples: &[MotionSample]) -> Result<StepAward, TransactionError> {
        let staged = self.motion.stage(samples);
        let award = staged.award;

        let mut ledger = self.ledger.clone();
        let earnings = ledger.credit_steps(award.steps)?;

        self.ledger = ledger;
        self.motion.commit(staged);
        if award.steps > 0 {
            let epoch = self.ledger.reset_epoch();
            self.reconciler
                .record_local_delta(epoch, Amount::ZERO, award.steps, earnings);
            self.reconciler.note_local_change();
        }
        self.dirty = true;
        Ok(award)
    }

    fn snapshot(&self, saved_at: chrono::DateTime<chrono::Utc>) -> DurableSnapshot {
        DurableSnapshot {
            version: SNAPSHOT_VERSION,
            device_id: self.reconciler.device_id(),
            role: self.reconciler.role(),
            saved_at,
            ledger: self.ledger.clone(),
            motion: self.motion.state().clone(),
            idle: self.idle.clone(),
            sync: self.reconciler.state().clone(),
        }
    }
}

// =============================================================================
// DEVICE
// =============================================================================

struct DeviceInner {
    config: DeviceConfig,
    catalog: Arc<Catalog>,
    clock: Arc<dyn Clock>,
    store: Arc<dyn SnapshotStore>,
    state: Mutex<DeviceState>,
    sync_gate: Mutex<()>,
}

/// Cloneable handle to one device's state.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl Device {
    /// Restore from `store`, or start fresh when it holds nothing.
    ///
    /// A read failure is returned to the caller, which decides whether to
    /// continue with [`Device::fresh`].
    pub async fn open(
        config: DeviceConfig,
        catalog: Arc<Catalog>,
        store: Arc<dyn SnapshotStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, PersistenceError> {
        let restored = store.load().await?;
        Ok(Self::build(config, catalog, store, clock, restored))
    }

    /// Start with a fresh ledger, ignoring whatever `store` holds.
    pub fn fresh(
        config: DeviceConfig,
        catalog: Arc<Catalog>,
        store: Arc<dyn SnapshotStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::build(config, catalog, store, clock, None)
    }

    fn build(
        config: DeviceConfig,
        catalog: Arc<Catalog>,
        store: Arc<dyn SnapshotStore>,
        clock: Arc<dyn Clock>,
        restored: Option<DurableSnapshot>,
    ) -> Self {
        let device_id = config
            .device_id
            .or(restored.as_ref().map(|s| s.device_id))
            .unwrap_or_else(Uuid::new_v4);

        let (mut ledger, motion, idle, sync) = match restored {
            Some(snap) => {
                if snap.role != config.role {
                    warn!("Snapshot was written as {:?}, running as {:?}", snap.role, config.role);
                }
                info!(
                    "Restored device {} (balance {}, epoch {})",
                    device_id,
                    snap.ledger.balance(),
                    snap.ledger.reset_epoch()
                );
                (snap.ledger, snap.motion, snap.idle, snap.sync)
            }
            None => {
                info!("Starting device {} as {:?} with a fresh ledger", device_id, config.role);
                (
                    Ledger::new(config.per_step_yield),
                    Default::default(),
                    IdleClock::new(),
                    ReconcilerState::default(),
                )
            }
        };
        ledger.per_step_yield = config.per_step_yield;
        refresh_yields(&catalog, &mut ledger);

        let state = DeviceState {
            ledger,
            motion: MotionDeduplicator::with_state(motion, config.step_correction),
            idle,
            reconciler: Reconciler::new(device_id, config.role, sync),
            dirty: false,
            sensor_issue: None,
            guidance_pending: false,
            sync_failures: 0,
        };

        Self {
            inner: Arc::new(DeviceInner {
                config,
                catalog,
                clock,
                store,
                state: Mutex::new(state),
                sync_gate: Mutex::new(()),
            }),
        }
    }

    /// This device's id.
    pub async fn device_id(&self) -> DeviceId {
        self.inner.state.lock().await.reconciler.device_id()
    }

    /// This device's role.
    pub fn role(&self) -> DeviceRole {
        self.inner.config.role
    }

    /// Configuration in use.
    pub fn config(&self) -> &DeviceConfig {
        &self.inner.config
    }

    /// Current read-only snapshot.
    pub async fn snapshot(&self) -> LedgerView {
        let st = self.inner.state.lock().await;
        st.view(self.inner.config.sync_failure_threshold)
    }

    /// Return pending sensor guidance once; later calls get `None` until a
    /// different sensor problem shows up.
    pub async fn take_sensor_guidance(&self) -> Option<&'static str> {
        let mut st = self.inner.state.lock().await;
        if !st.guidance_pending {
            return None;
        }
        st.guidance_pending = false;
        st.sensor_issue.as_ref().map(|e| e.guidance())
    }

    fn require_primary(&self, intent: &'static str) -> Result<(), TransactionError> {
        if self.inner.config.role != DeviceRole::Primary {
            debug!("Rejecting {} on companion", intent);
            return Err(TransactionError::PrimaryOnly(intent));
        }
        Ok(())
    }

    /// Write the snapshot. On failure the state stays dirty for a retry.
    async fn persist(&self, st: &mut DeviceState) -> Result<(), PersistenceError> {
        let snapshot = st.snapshot(self.inner.clock.now());
        match self.inner.store.save(&snapshot).await {
            Ok(()) => {
                st.dirty = false;
                Ok(())
            }
            Err(e) => {
                st.dirty = true;
                warn!("Snapshot write failed, will retry: {}", e);
                Err(e)
            }
        }
    }

    /// Persist after an intent. Failures are logged and retried later.
    async fn persist_batch(&self, st: &mut DeviceState) {
        let _ = self.persist(st).await;
    }

    // -------------------------------------------------------------------------
    // Intents
    // -------------------------------------------------------------------------

    /// Credit one tap.
    pub async fn tap(&self) -> Result<LedgerView, TransactionError> {
        let mut st = self.inner.state.lock().await;
        let amount = gateway::tap(&mut st.ledger)?;
        let epoch = st.ledger.reset_epoch();
        st.reconciler.record_local_delta(epoch, amount, 0, Amount::ZERO);
        st.reconciler.note_local_change();
        st.dirty = true;
        Ok(st.view(self.inner.config.sync_failure_threshold))
    }

    /// Buy `quantity` units of an upgrade.
    #[instrument(skip(self))]
    pub async fn purchase(&self, upgrade_id: &str, quantity: u64) -> Result<LedgerView, TransactionError> {
        self.require_primary("purchase")?;
        let mut st = self.inner.state.lock().await;
        let receipt = match gateway::purchase(&mut st.ledger, &self.inner.catalog, upgrade_id, quantity) {
            Ok(receipt) => receipt,
            Err(e) => {
                info!("Purchase declined: {}", e);
                return Err(e);
            }
        };
        info!(
            "Bought {} x{} for {} (now {}/s, {}/tap)",
            upgrade_id, quantity, receipt.total_cost, receipt.yields.per_second, receipt.yields.per_click
        );
        st.reconciler.note_local_change();
        self.persist_batch(&mut st).await;
        Ok(st.view(self.inner.config.sync_failure_threshold))
    }

    /// Buy one exchange of a tier.
    #[instrument(skip(self))]
    pub async fn exchange(&self, tier_id: &str) -> Result<LedgerView, TransactionError> {
        self.require_primary("exchange")?;
        let mut st = self.inner.state.lock().await;
        let count = match gateway::exchange(&mut st.ledger, &self.inner.catalog, tier_id) {
            Ok(count) => count,
            Err(e) => {
                info!("Exchange declined: {}", e);
                return Err(e);
            }
        };
        info!("Exchanged {} (count {})", tier_id, count);
        st.reconciler.note_local_change();
        self.persist_batch(&mut st).await;
        Ok(st.view(self.inner.config.sync_failure_threshold))
    }

    /// Credit a mini-game payout of `reward × multiplier`.
    pub async fn record_mini_game_result(
        &self,
        reward: Amount,
        multiplier: Amount,
    ) -> Result<LedgerView, TransactionError> {
        self.require_primary("mini-game payout")?;
        let mut st = self.inner.state.lock().await;
        let payout = gateway::apply_mini_game_reward(&mut st.ledger, reward, multiplier)?;
        debug!("Mini-game paid {}", payout);
        st.reconciler.note_local_change();
        self.persist_batch(&mut st).await;
        Ok(st.view(self.inner.config.sync_failure_threshold))
    }

    /// Award a batch of motion samples.
    pub async fn record_motion_samples(
        &self,
        samples: &[MotionSample],
    ) -> Result<LedgerView, TransactionError> {
        let mut st = self.inner.state.lock().await;
        let award = st.apply_motion(samples)?;
        debug!(
            "Motion batch: {} steps from {} samples ({} duplicate, {} superseded, {} rejected)",
            award.steps, award.accepted, award.duplicates, award.superseded, award.rejected
        );
        self.persist_batch(&mut st).await;
        Ok(st.view(self.inner.config.sync_failure_threshold))
    }

    /// Query `source` for new samples and award them.
    ///
    /// The query runs without the device lock. On a sensor error, or when the
    /// ledger refuses the award, nothing is awarded and the watermarks stay
    /// where they were.
    pub async fn pull_motion(&self, source: &dyn MotionSource) -> Result<StepAward, SensorError> {
        let since = self.inner.state.lock().await.motion.last_processed_end();

        let result = source.query(since).await;

        let mut st = self.inner.state.lock().await;
        let samples = match result {
            Ok(samples) => samples,
            Err(e) => {
                if st.sensor_issue.as_ref() != Some(&e) {
                    warn!("Motion sensor problem: {}", e);
                    st.guidance_pending = true;
                    st.sensor_issue = Some(e.clone());
                }
                return Err(e);
            }
        };
        if st.sensor_issue.take().is_some() {
            info!("Motion sensor recovered");
            st.guidance_pending = false;
        }

        let award = match st.apply_motion(&samples) {
            Ok(award) => award,
            Err(e) => {
                error!("Ledger refused motion batch of {} samples: {}", samples.len(), e);
                return Err(SensorError::QueryFailed(format!("step award refused: {}", e)));
            }
        };
        self.persist_batch(&mut st).await;
        Ok(award)
    }

    /// Zero the ledger and start a new reset epoch.
    #[instrument(skip(self))]
    pub async fn reset(&self) -> Result<LedgerView, TransactionError> {
        self.require_primary("reset")?;
        let mut st = self.inner.state.lock().await;
        st.ledger.reset();
        refresh_yields(&self.inner.catalog, &mut st.ledger);
        st.reconciler.clear_outbox();
        st.reconciler.note_local_change();
        info!("Ledger reset to epoch {}", st.ledger.reset_epoch());
        self.persist_batch(&mut st).await;
        Ok(st.view(self.inner.config.sync_failure_threshold))
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Foreground tick: accrue idle income (primary) and flush batched taps.
    pub async fn tick(&self) -> Accrual {
        let now = self.inner.clock.now();
        let mut st = self.inner.state.lock().await;

        let accrual = if self.inner.config.role == DeviceRole::Primary {
            st.accrue_idle(|idle, per_second| idle.tick(now, per_second))
        } else {
            Accrual::NONE
        };

        if st.dirty {
            self.persist_batch(&mut st).await;
        }
        accrual
    }

    /// App going to background: settle idle income and persist.
    pub async fn suspend(&self) -> Result<Accrual, PersistenceError> {
        let now = self.inner.clock.now();
        let mut st = self.inner.state.lock().await;
        let accrual = if self.inner.config.role == DeviceRole::Primary {
            st.accrue_idle(|idle, per_second| idle.suspend(now, per_second))
        } else {
            Accrual::NONE
        };
        debug!("Suspended at {}", now);
        self.persist(&mut st).await?;
        Ok(accrual)
    }

    /// App active again: credit the suspended gap once.
    pub async fn resume(&self) -> Accrual {
        let now = self.inner.clock.now();
        let mut st = self.inner.state.lock().await;
        let accrual = if self.inner.config.role == DeviceRole::Primary {
            st.accrue_idle(|idle, per_second| idle.resume(now, per_second))
        } else {
            Accrual::NONE
        };
        if !accrual.is_empty() {
            info!("Resumed after {}s idle, credited {}", accrual.elapsed_seconds, accrual.amount);
        }
        if st.dirty {
            self.persist_batch(&mut st).await;
        }
        accrual
    }

    /// Write the snapshot if anything is unsaved.
    pub async fn flush(&self) -> Result<(), PersistenceError> {
        let mut st = self.inner.state.lock().await;
        if st.dirty {
            self.persist(&mut st).await?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Sync
    // -------------------------------------------------------------------------

    /// One sync attempt over `link`.
    ///
    /// Failures leave local state untouched and are retried on the next
    /// call. A call made while another is in flight returns `InProgress`.
    pub async fn sync_once(&self, link: &dyn PeerLink) -> Result<SyncOutcome, SyncError> {
        let Ok(_gate) = self.inner.sync_gate.try_lock() else {
            return Ok(SyncOutcome::InProgress);
        };

        let (msg, sent_hash) = {
            let mut guard = self.inner.state.lock().await;
            let st = &mut *guard;
            if !st.reconciler.needs_send(&st.ledger) {
                return Ok(SyncOutcome::UpToDate);
            }
            let msg = st.reconciler.outgoing(&st.ledger, MessageKind::Sync);
            (msg, sync_view_hash(&st.ledger))
        };

        let result = link.send(msg).await;

        let mut guard = self.inner.state.lock().await;
        let st = &mut *guard;
        let reply = match result {
            Ok(reply) => reply,
            Err(e) => {
                st.sync_failures = st.sync_failures.saturating_add(1);
                if st.sync_failures == self.inner.config.sync_failure_threshold {
                    warn!("Peer unreachable for {} attempts: {}", st.sync_failures, e);
                } else {
                    debug!("Sync deferred: {}", e);
                }
                return Err(e);
            }
        };
        st.sync_failures = 0;

        if !reply.is_supported_version() {
            return Err(SyncError::VersionMismatch(reply.version));
        }

        let unchanged_in_flight = sync_view_hash(&st.ledger) == sent_hash;
        let outcome = st.reconciler.absorb(&mut st.ledger, &self.inner.catalog, &reply);
        let Some(merge) = outcome.merge else {
            return Err(SyncError::Codec("reply rejected".to_string()));
        };

        // The peer's reply covers what we sent; later local changes still
        // need their own round trip.
        if unchanged_in_flight {
            st.reconciler.mark_acked(&st.ledger);
        }
        st.dirty = true;
        self.persist_batch(st).await;

        debug!(
            "Synced with {} ({:?}, {} deltas applied, {} acked, view {})",
            reply.sender,
            merge,
            outcome.deltas_applied,
            outcome.deltas_acked,
            short_hex(&sync_view_hash(&st.ledger))
        );
        Ok(SyncOutcome::Synced {
            merge,
            deltas_applied: outcome.deltas_applied,
            deltas_acked: outcome.deltas_acked,
        })
    }
}

#[async_trait]
impl SyncEndpoint for Device {
    async fn handle_peer_message(&self, msg: PeerMessage) -> Result<PeerMessage, SyncError> {
        if !msg.is_supported_version() {
            return Err(SyncError::VersionMismatch(msg.version));
        }

        let mut guard = self.inner.state.lock().await;
        let st = &mut *guard;
        let outcome = st.reconciler.absorb(&mut st.ledger, &self.inner.catalog, &msg);
        if outcome.merge.is_none() {
            return Err(SyncError::Codec("message rejected".to_string()));
        }
        if outcome.deltas_applied > 0 {
            info!("Applied {} deltas from {}", outcome.deltas_applied, msg.sender);
        }

        let reply = st.reconciler.outgoing(&st.ledger, MessageKind::SyncReply);

        // Watermarks must be durable before the reply acknowledges them.
        st.dirty = true;
        self.persist_batch(st).await;
        Ok(reply)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, Utc};
    use rust_decimal::Decimal;
    use crate::core::clock::ManualClock;
    use crate::device::persistence::MemorySnapshotStore;
    use crate::economy::catalog::Upgrade;
    use crate::sync::link::LoopbackLink;
    use crate::sync::protocol::{keys, WIRE_VERSION};

    fn dec(n: i64) -> Amount {
        Decimal::from(n)
    }

    fn t0() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap()
    }

    struct Pair {
        clock: Arc<ManualClock>,
        primary: Device,
        companion: Device,
        primary_store: Arc<MemorySnapshotStore>,
        companion_store: Arc<MemorySnapshotStore>,
        link: LoopbackLink,
    }

    fn device(role: DeviceRole, id: u128, store: Arc<MemorySnapshotStore>, clock: Arc<ManualClock>) -> Device {
        let config = DeviceConfig {
            role,
            device_id: Some(Uuid::from_u128(id)),
            ..DeviceConfig::default()
        };
        Device::fresh(config, Arc::new(Catalog::standard()), store, clock)
    }

    fn pair() -> Pair {
        let clock = Arc::new(ManualClock::new(t0()));
        let primary_store = Arc::new(MemorySnapshotStore::new());
        let companion_store = Arc::new(MemorySnapshotStore::new());
        let primary = device(DeviceRole::Primary, 1, primary_store.clone(), clock.clone());
        let companion = device(DeviceRole::Companion, 2, companion_store.clone(), clock.clone());
        let link = LoopbackLink::new(Arc::new(primary.clone()));
        Pair { clock, primary, companion, primary_store, companion_store, link }
    }

    async fn fund(device: &Device, taps: usize) {
        for _ in 0..taps {
            device.tap().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_purchase_through_device() {
        let catalog = Catalog::from_records(vec![Upgrade::new("chromebook", 100, 1, 0)], vec![]).unwrap();
        let clock = Arc::new(ManualClock::new(t0()));
        let store = Arc::new(MemorySnapshotStore::new());
        let device = Device::fresh(DeviceConfig::default(), Arc::new(catalog), store.clone(), clock);

        fund(&device, 150).await;
        let view = device.purchase("chromebook", 1).await.unwrap();
        assert_eq!(view.balance, dec(50));
        assert_eq!(view.per_second_yield, dec(1));
        assert_eq!(view.upgrade_quantities.get(&UpgradeId::new("chromebook")), Some(&1));

        // Purchases persist immediately, taps included.
        let stored = store.stored().await.unwrap();
        assert_eq!(stored.ledger.balance(), dec(50));

        let before = device.snapshot().await;
        assert!(matches!(
            device.purchase("chromebook", 1).await,
            Err(TransactionError::InsufficientFunds { .. })
        ));
        assert_eq!(device.snapshot().await, before);
    }

    #[tokio::test]
    async fn test_companion_rejects_primary_only_intents() {
        let p = pair();
        fund(&p.companion, 200).await;

        assert_eq!(
            p.companion.purchase("chromebook", 1).await,
            Err(TransactionError::PrimaryOnly("purchase"))
        );
        assert_eq!(
            p.companion.exchange("bronze").await,
            Err(TransactionError::PrimaryOnly("exchange"))
        );
        assert!(matches!(
            p.companion.record_mini_game_result(dec(1), dec(1)).await,
            Err(TransactionError::PrimaryOnly(_))
        ));
        assert!(matches!(p.companion.reset().await, Err(TransactionError::PrimaryOnly(_))));
        assert_eq!(p.companion.snapshot().await.balance, dec(200));
    }

    #[tokio::test]
    async fn test_taps_batch_until_tick() {
        let p = pair();
        fund(&p.primary, 3).await;
        assert!(p.primary_store.stored().await.is_none());

        p.primary.tick().await;
        assert_eq!(p.primary_store.stored().await.unwrap().ledger.balance(), dec(3));
    }

    #[tokio::test]
    async fn test_idle_accrual_resume_gap() {
        let p = pair();
        fund(&p.primary, 100).await;
        p.primary.purchase("chromebook", 1).await.unwrap();
        p.primary.tick().await;

        p.primary.suspend().await.unwrap();
        p.clock.advance(Duration::seconds(5));
        let accrual = p.primary.resume().await;
        assert_eq!(accrual.amount, dec(5));

        // Backward clock credits nothing.
        p.primary.suspend().await.unwrap();
        p.clock.advance(Duration::seconds(-2));
        assert!(p.primary.resume().await.is_empty());

        let view = p.primary.snapshot().await;
        assert_eq!(view.earned_from_idle, dec(5));
        assert_eq!(view.balance, dec(5));
    }

    #[tokio::test]
    async fn test_companion_does_not_accrue_idle() {
        let p = pair();
        p.companion.tick().await;
        p.clock.advance(Duration::seconds(30));
        assert!(p.companion.tick().await.is_empty());
    }

    #[tokio::test]
    async fn test_offline_companion_converges() {
        let p = pair();
        fund(&p.primary, 20).await;
        p.companion.sync_once(&p.link).await.unwrap();
        assert_eq!(p.companion.snapshot().await.balance, dec(20));

        // Companion taps while out of range; primary keeps earning.
        p.link.set_reachable(false);
        fund(&p.companion, 7).await;
        assert!(matches!(
            p.companion.sync_once(&p.link).await,
            Err(SyncError::PeerUnreachable(_))
        ));
        fund(&p.primary, 4).await;
        assert_eq!(p.companion.snapshot().await.pending_deltas, 1);
        assert_eq!(p.companion.snapshot().await.pending_clicks, dec(7));

        p.link.set_reachable(true);
        let outcome = p.companion.sync_once(&p.link).await.unwrap();
        assert!(matches!(outcome, SyncOutcome::Synced { .. }));

        let primary = p.primary.snapshot().await;
        let companion = p.companion.snapshot().await;
        assert_eq!(primary.balance, dec(31));
        assert_eq!(companion.balance, dec(31));
        assert_eq!(companion.pending_deltas, 0);

        // Nothing new: no further round trip needed.
        assert_eq!(p.companion.sync_once(&p.link).await.unwrap(), SyncOutcome::UpToDate);

        // A replayed delta is never credited twice.
        let stored = p.primary_store.stored().await.unwrap();
        assert_eq!(stored.sync.applied_delta_seq.get(&Uuid::from_u128(2)), Some(&1));
        assert_eq!(stored.ledger.balance(), dec(31));
    }

    #[tokio::test]
    async fn test_companion_steps_reach_primary() {
        let p = pair();
        let samples = vec![
            MotionSample::new(Uuid::from_u128(10), t0(), t0() + Duration::minutes(5), dec(100)),
            MotionSample::new(Uuid::from_u128(11), t0(), t0() + Duration::minutes(6), dec(50)),
        ];
        let view = p.companion.record_motion_samples(&samples).await.unwrap();
        assert_eq!(view.total_steps, 90);
        assert_eq!(view.earned_from_steps, dec(90));

        // Retried batch awards nothing.
        let again = p.companion.record_motion_samples(&samples).await.unwrap();
        assert_eq!(again.total_steps, 90);

        p.companion.sync_once(&p.link).await.unwrap();
        let primary = p.primary.snapshot().await;
        assert_eq!(primary.total_steps, 90);
        assert_eq!(primary.balance, dec(90));
    }

    #[tokio::test]
    async fn test_reset_propagates_by_epoch() {
        let p = pair();
        fund(&p.companion, 5).await;
        p.companion.sync_once(&p.link).await.unwrap();
        assert_eq!(p.primary.snapshot().await.balance, dec(5));

        p.primary.reset().await.unwrap();
        fund(&p.primary, 2).await;

        // Companion's stale snapshot cannot resurrect the old balance.
        fund(&p.companion, 1).await;
        p.companion.sync_once(&p.link).await.unwrap();

        let primary = p.primary.snapshot().await;
        let companion = p.companion.snapshot().await;
        assert_eq!(primary.reset_epoch, 1);
        assert_eq!(primary.balance, dec(2));
        assert_eq!(companion.reset_epoch, 1);
        assert_eq!(companion.balance, dec(2));
        assert_eq!(companion.pending_deltas, 0);
    }

    #[tokio::test]
    async fn test_write_failure_keeps_state_and_retries() {
        let p = pair();
        fund(&p.primary, 100).await;
        p.primary_store.set_fail_writes(true);

        let view = p.primary.purchase("chromebook", 1).await.unwrap();
        assert_eq!(view.balance, dec(0));
        assert!(p.primary_store.stored().await.is_none());
        assert!(p.primary.flush().await.is_err());

        p.primary_store.set_fail_writes(false);
        p.primary.tick().await;
        let stored = p.primary_store.stored().await.unwrap();
        assert_eq!(stored.ledger.upgrade_quantity("chromebook"), 1);
    }

    #[tokio::test]
    async fn test_restart_restores_dedup_and_outbox() {
        let p = pair();
        let sample = MotionSample::new(Uuid::from_u128(20), t0(), t0() + Duration::minutes(1), dec(10));
        p.companion.record_motion_samples(std::slice::from_ref(&sample)).await.unwrap();
        fund(&p.companion, 2).await;
        p.companion.flush().await.unwrap();

        let reopened = Device::open(
            DeviceConfig::companion(),
            Arc::new(Catalog::standard()),
            p.companion_store.clone(),
            p.clock.clone(),
        )
        .await
        .unwrap();
        assert_eq!(reopened.device_id().await, Uuid::from_u128(2));

        let view = reopened.record_motion_samples(&[sample]).await.unwrap();
        assert_eq!(view.total_steps, 6);
        assert_eq!(view.balance, dec(8));
        assert_eq!(view.pending_deltas, 1);
    }

    struct FailingSensor(SensorError);

    #[async_trait]
    impl MotionSource for FailingSensor {
        async fn query(
            &self,
            _since: Option<DateTime<Utc>>,
        ) -> Result<Vec<MotionSample>, SensorError> {
            Err(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_sensor_guidance_surfaces_once() {
        let p = pair();
        let sensor = FailingSensor(SensorError::AuthDenied);

        assert_eq!(p.primary.pull_motion(&sensor).await, Err(SensorError::AuthDenied));
        assert!(p.primary.snapshot().await.sensor_guidance.is_some());
        assert_eq!(
            p.primary.take_sensor_guidance().await,
            Some(SensorError::AuthDenied.guidance())
        );

        // Same failure again: no repeated guidance.
        let _ = p.primary.pull_motion(&sensor).await;
        assert_eq!(p.primary.take_sensor_guidance().await, None);
        assert_eq!(p.primary.snapshot().await.total_steps, 0);
    }

    #[tokio::test]
    async fn test_unreachable_threshold_flag() {
        let p = pair();
        p.link.set_reachable(false);
        fund(&p.companion, 1).await;
        for _ in 0..DeviceConfig::default().sync_failure_threshold {
            assert!(p.companion.sync_once(&p.link).await.is_err());
        }
        assert!(p.companion.snapshot().await.peer_unreachable);

        p.link.set_reachable(true);
        p.companion.sync_once(&p.link).await.unwrap();
        assert!(!p.companion.snapshot().await.peer_unreachable);
    }

    struct FixedSensor(Vec<MotionSample>);

    #[async_trait]
    impl MotionSource for FixedSensor {
        async fn query(
            &self,
            _since: Option<DateTime<Utc>>,
        ) -> Result<Vec<MotionSample>, SensorError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_intents_keep_ledger_consistent() {
        let p = pair();
        fund(&p.companion, 20).await;

        // A companion message that will be delivered many times over.
        let replay = {
            let mut guard = p.companion.inner.state.lock().await;
            let st = &mut *guard;
            st.reconciler.outgoing(&st.ledger, MessageKind::Sync)
        };
        let sensor: Arc<dyn MotionSource> = Arc::new(FixedSensor(vec![MotionSample::new(
            Uuid::from_u128(30),
            t0(),
            t0() + Duration::minutes(10),
            dec(100),
        )]));
        let link = Arc::new(p.link.clone());

        let mut tasks = Vec::new();
        for i in 0..80 {
            let primary = p.primary.clone();
            let companion = p.companion.clone();
            let sensor = sensor.clone();
            let link = link.clone();
            let replay = replay.clone();
            tasks.push(tokio::spawn(async move {
                match i % 4 {
                    0 => {
                        primary.tap().await.unwrap();
                    }
                    1 => {
                        primary.pull_motion(sensor.as_ref()).await.unwrap();
                    }
                    2 => {
                        primary.handle_peer_message(replay).await.unwrap();
                    }
                    _ => {
                        companion.sync_once(link.as_ref()).await.unwrap();
                    }
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        p.companion.sync_once(&p.link).await.unwrap();

        let view = p.primary.snapshot().await;
        assert_eq!(view.earned_from_clicks, dec(40));
        assert_eq!(view.total_steps, 60);
        assert_eq!(view.earned_from_steps, dec(60));
        assert_eq!(view.total_ever_earned, dec(100));
        assert_eq!(view.balance, view.total_ever_earned - view.total_spent);
        assert!(p.primary.inner.state.lock().await.ledger.is_consistent());
        assert_eq!(p.companion.snapshot().await.pending_deltas, 0);
    }

    #[tokio::test]
    async fn test_overlapping_sync_reports_in_progress() {
        let p = pair();
        fund(&p.companion, 1).await;

        let gate = p.companion.inner.sync_gate.lock().await;
        assert_eq!(p.companion.sync_once(&p.link).await.unwrap(), SyncOutcome::InProgress);
        assert_eq!(p.companion.snapshot().await.pending_deltas, 1);
        drop(gate);

        assert!(matches!(
            p.companion.sync_once(&p.link).await.unwrap(),
            SyncOutcome::Synced { .. }
        ));
    }

    #[tokio::test]
    async fn test_refused_step_award_reported() {
        let config = DeviceConfig {
            per_step_yield: Decimal::MAX,
            ..DeviceConfig::default()
        };
        let device = Device::fresh(
            config,
            Arc::new(Catalog::standard()),
            Arc::new(MemorySnapshotStore::new()),
            Arc::new(ManualClock::new(t0())),
        );
        let sensor = FixedSensor(vec![MotionSample::new(
            Uuid::from_u128(40),
            t0(),
            t0() + Duration::minutes(1),
            dec(100),
        )]);

        assert!(matches!(
            device.pull_motion(&sensor).await,
            Err(SensorError::QueryFailed(_))
        ));
        let view = device.snapshot().await;
        assert_eq!(view.total_steps, 0);
        assert_eq!(view.balance, dec(0));
        assert_eq!(device.inner.state.lock().await.motion.last_processed_end(), None);
    }

    #[tokio::test]
    async fn test_refused_idle_credit_keeps_interval() {
        let p = pair();
        fund(&p.primary, 100).await;
        p.primary.purchase("chromebook", 1).await.unwrap();
        p.primary.tick().await;

        // Lifetime earnings at the representable limit.
        let mut fields = BTreeMap::new();
        fields.insert(keys::EARNED_FROM_MINI_GAMES.to_string(), Decimal::MAX.to_string());
        let msg = PeerMessage {
            version: WIRE_VERSION,
            kind: MessageKind::Sync,
            sender: Uuid::from_u128(2),
            role: DeviceRole::Companion,
            revision: 1,
            fields,
            deltas: Vec::new(),
            delta_acks: BTreeMap::new(),
        };
        p.primary.handle_peer_message(msg).await.unwrap();
        assert_eq!(p.primary.snapshot().await.total_ever_earned, Decimal::MAX);

        p.clock.advance(Duration::seconds(5));
        assert!(p.primary.tick().await.is_empty());

        let st = p.primary.inner.state.lock().await;
        assert_eq!(st.idle.last_accounted(), Some(t0()));
        assert!(st.ledger.earned_from(IncomeSource::Idle).is_zero());
        assert!(st.ledger.is_consistent());
    }
}
