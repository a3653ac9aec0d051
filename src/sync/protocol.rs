//! Peer Sync Protocol
//!
//! Wire format for primary <-> companion messages.
//!
//! Ledger fields travel as a flat `field name → stringified value` map.
//! Receivers ignore keys they do not know and treat absent or unparsable keys
//! as "no information", never as zero. The envelope around the map is a
//! versioned struct; JSON text frames are used by default, bincode binary
//! frames are accepted as well.

use std::collections::BTreeMap;
use serde::{Serialize, Deserialize};
use tracing::debug;
use uuid::Uuid;

use crate::core::amount::{Amount, format_amount, parse_amount};
use crate::core::hash::{StateHash, hash_string_map};
use crate::economy::catalog::{UpgradeId, ExchangeTierId};
use crate::economy::ledger::Ledger;

/// Current envelope version.
pub const WIRE_VERSION: u16 = 1;

/// Oldest envelope version still understood.
pub const MIN_WIRE_VERSION: u16 = 1;

/// Device identifier.
pub type DeviceId = Uuid;

/// Field names used in the flat map.
pub mod keys {
    /// Display hint only; receivers re-derive balance.
    pub const BALANCE: &str = "balance";
    /// Lifetime earnings.
    pub const TOTAL_EVER_EARNED: &str = "totalEverEarned";
    /// Lifetime spending.
    pub const TOTAL_SPENT: &str = "totalSpent";
    /// Display hint only; receivers re-derive yields.
    pub const PER_CLICK_YIELD: &str = "perClickYield";
    /// Display hint only; receivers re-derive yields.
    pub const PER_SECOND_YIELD: &str = "perSecondYield";
    /// Lifetime awarded steps.
    pub const TOTAL_STEPS: &str = "totalSteps";
    /// Click bucket.
    pub const EARNED_FROM_CLICKS: &str = "earnedFromClicks";
    /// Idle bucket.
    pub const EARNED_FROM_IDLE: &str = "earnedFromIdle";
    /// Step bucket.
    pub const EARNED_FROM_STEPS: &str = "earnedFromSteps";
    /// Mini-game bucket.
    pub const EARNED_FROM_MINI_GAMES: &str = "earnedFromMiniGames";
    /// Reset generation.
    pub const RESET_EPOCH: &str = "resetEpoch";
    /// Prefix for `upgrade.<id>` count entries.
    pub const UPGRADE_PREFIX: &str = "upgrade.";
    /// Prefix for `exchange.<id>` count entries.
    pub const EXCHANGE_PREFIX: &str = "exchange.";
}

// =============================================================================
// DEVICE ROLE
// =============================================================================

/// Which side of the pair a device is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceRole {
    /// Phone: authoritative, runs idle accrual and purchases.
    Primary,
    /// Wrist device: taps and steps, queues deltas while unreachable.
    Companion,
}

// =============================================================================
// SYNC FIELDS
// =============================================================================

/// Typed view of the flat field map. `None` means "no information".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncFields {
    /// Reset generation.
    pub reset_epoch: Option<u64>,
    /// Sender's balance (hint).
    pub balance: Option<Amount>,
    /// Lifetime earnings.
    pub total_ever_earned: Option<Amount>,
    /// Lifetime spending.
    pub total_spent: Option<Amount>,
    /// Sender's per-click yield (hint).
    pub per_click_yield: Option<Amount>,
    /// Sender's per-second yield (hint).
    pub per_second_yield: Option<Amount>,
    /// Lifetime awarded steps.
    pub total_steps: Option<u64>,
    /// Click bucket.
    pub earned_from_clicks: Option<Amount>,
    /// Idle bucket.
    pub earned_from_idle: Option<Amount>,
    /// Step bucket.
    pub earned_from_steps: Option<Amount>,
    /// Mini-game bucket.
    pub earned_from_mini_games: Option<Amount>,
    /// Upgrade counts present in the message.
    pub upgrade_counts: BTreeMap<UpgradeId, u64>,
    /// Exchange counts present in the message.
    pub exchange_counts: BTreeMap<ExchangeTierId, u64>,
}

impl SyncFields {
    /// Full view of a ledger.
    pub fn from_ledger(ledger: &Ledger) -> Self {
        Self {
            reset_epoch: Some(ledger.reset_epoch),
            balance: Some(ledger.balance),
            total_ever_earned: Some(ledger.total_ever_earned),
            total_spent: Some(ledger.total_spent),
            per_click_yield: Some(ledger.per_click_yield),
            per_second_yield: Some(ledger.per_second_yield),
            total_steps: Some(ledger.total_steps),
            earned_from_clicks: Some(ledger.earned_from_clicks),
            earned_from_idle: Some(ledger.earned_from_idle),
            earned_from_steps: Some(ledger.earned_from_steps),
            earned_from_mini_games: Some(ledger.earned_from_mini_games),
            upgrade_counts: ledger.upgrade_quantities.clone(),
            exchange_counts: ledger.exchanged_counts.clone(),
        }
    }

    /// Encode to the flat wire map. `None` fields are omitted.
    pub fn to_wire(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        let mut put_amount = |key: &str, value: Option<Amount>| {
            if let Some(v) = value {
                map.insert(key.to_string(), format_amount(v));
            }
        };
        put_amount(keys::BALANCE, self.balance);
        put_amount(keys::TOTAL_EVER_EARNED, self.total_ever_earned);
        put_amount(keys::TOTAL_SPENT, self.total_spent);
        put_amount(keys::PER_CLICK_YIELD, self.per_click_yield);
        put_amount(keys::PER_SECOND_YIELD, self.per_second_yield);
        put_amount(keys::EARNED_FROM_CLICKS, self.earned_from_clicks);
        put_amount(keys::EARNED_FROM_IDLE, self.earned_from_idle);
        put_amount(keys::EARNED_FROM_STEPS, self.earned_from_steps);
        put_amount(keys::EARNED_FROM_MINI_GAMES, self.earned_from_mini_games);

        if let Some(steps) = self.total_steps {
            map.insert(keys::TOTAL_STEPS.to_string(), steps.to_string());
        }
        if let Some(epoch) = self.reset_epoch {
            map.insert(keys::RESET_EPOCH.to_string(), epoch.to_string());
        }
        for (id, count) in &self.upgrade_counts {
            map.insert(format!("{}{}", keys::UPGRADE_PREFIX, id), count.to_string());
        }
        for (id, count) in &self.exchange_counts {
            map.insert(format!("{}{}", keys::EXCHANGE_PREFIX, id), count.to_string());
        }
        map
    }

    /// Decode from the flat wire map.
    pub fn from_wire(map: &BTreeMap<String, String>) -> Self {
        let mut fields = Self::default();

        for (key, raw) in map {
            let amount = || {
                let parsed = parse_amount(raw);
                if parsed.is_none() {
                    debug!("Ignoring unparsable value {:?} for {}", raw, key);
                }
                parsed
            };
            let count = || {
                let parsed = raw.trim().parse::<u64>().ok();
                if parsed.is_none() {
                    debug!("Ignoring unparsable count {:?} for {}", raw, key);
                }
                parsed
            };

            match key.as_str() {
                keys::BALANCE => fields.balance = amount(),
                keys::TOTAL_EVER_EARNED => fields.total_ever_earned = amount(),
                keys::TOTAL_SPENT => fields.total_spent = amount(),
                keys::PER_CLICK_YIELD => fields.per_click_yield = amount(),
                keys::PER_SECOND_YIELD => fields.per_second_yield = amount(),
                keys::EARNED_FROM_CLICKS => fields.earned_from_clicks = amount(),
                keys::EARNED_FROM_IDLE => fields.earned_from_idle = amount(),
                keys::EARNED_FROM_STEPS => fields.earned_from_steps = amount(),
                keys::EARNED_FROM_MINI_GAMES => fields.earned_from_mini_games = amount(),
                keys::TOTAL_STEPS => fields.total_steps = count(),
                keys::RESET_EPOCH => fields.reset_epoch = count(),
                other => {
                    if let Some(id) = other.strip_prefix(keys::UPGRADE_PREFIX) {
                        if let (false, Some(n)) = (id.is_empty(), count()) {
                            fields.upgrade_counts.insert(UpgradeId::new(id), n);
                        }
                    } else if let Some(id) = other.strip_prefix(keys::EXCHANGE_PREFIX) {
                        if let (false, Some(n)) = (id.is_empty(), count()) {
                            fields.exchange_counts.insert(ExchangeTierId::new(id), n);
                        }
                    } else {
                        debug!("Ignoring unknown sync key {}", other);
                    }
                }
            }
        }

        // Negative monotonic values carry no usable information.
        for value in [
            &mut fields.total_ever_earned,
            &mut fields.total_spent,
            &mut fields.earned_from_clicks,
            &mut fields.earned_from_idle,
            &mut fields.earned_from_steps,
            &mut fields.earned_from_mini_games,
        ] {
            if value.is_some_and(|v| v.is_sign_negative() && !v.is_zero()) {
                *value = None;
            }
        }

        fields
    }
}

/// Hash of a ledger's sync view, for change detection.
pub fn sync_view_hash(ledger: &Ledger) -> StateHash {
    hash_string_map(&SyncFields::from_ledger(ledger).to_wire())
}

// =============================================================================
// DELTAS
// =============================================================================

/// Companion-originated earnings awaiting the primary's acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerDelta {
    /// Per-device sequence number, strictly increasing.
    pub seq: u64,
    /// Reset epoch the delta was earned in.
    pub epoch: u64,
    /// Currency earned from taps.
    pub clicks: Amount,
    /// Steps awarded.
    pub steps: u64,
    /// Currency earned from those steps.
    pub step_earnings: Amount,
}

// =============================================================================
// ENVELOPE
// =============================================================================

/// Message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Sender-initiated sync.
    Sync,
    /// Reply carrying the receiver's merged state.
    SyncReply,
}

/// One peer message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerMessage {
    /// Envelope version.
    pub version: u16,
    /// Message kind.
    pub kind: MessageKind,
    /// Sending device.
    pub sender: DeviceId,
    /// Sending device's role.
    pub role: DeviceRole,
    /// Sender's logical timestamp (local mutation counter).
    pub revision: u64,
    /// Flat ledger field map.
    pub fields: BTreeMap<String, String>,
    /// Pending companion deltas.
    #[serde(default)]
    pub deltas: Vec<LedgerDelta>,
    /// Highest delta seq applied per companion device.
    #[serde(default)]
    pub delta_acks: BTreeMap<DeviceId, u64>,
}

impl PeerMessage {
    /// Typed view of the field map.
    pub fn sync_fields(&self) -> SyncFields {
        SyncFields::from_wire(&self.fields)
    }

    /// Whether this build can interpret the envelope.
    pub fn is_supported_version(&self) -> bool {
        self.version >= MIN_WIRE_VERSION
    }

    /// Merged balance carried by a reply, if any.
    pub fn balance_hint(&self) -> Option<Amount> {
        self.fields.get(keys::BALANCE).and_then(|raw| parse_amount(raw))
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Serialize to binary.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from binary.
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}
