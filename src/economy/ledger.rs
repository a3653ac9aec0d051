//! Currency Ledger
//!
//! The authoritative economic state of one device replica.
//!
//! ## Invariants
//!
//! - `balance == total_ever_earned - total_spent` after every operation
//! - every `total_*` / `earned_from_*` counter and `total_steps` only grows
//! - `earned_from_*` buckets sum to `total_ever_earned` on a replica that has
//!   only been mutated locally; after a merge the sum may fall below it, never
//!   above
//! - upgrade and exchange counts only grow, barring [`Ledger::reset`]
//!
//! Every mutating method either applies all of its documented changes or
//! returns an error with the ledger untouched.

use std::collections::BTreeMap;
use std::fmt;
use rust_decimal::Decimal;
use serde::{Serialize, Deserialize};

use crate::core::amount::{Amount, BASE_PER_CLICK, DEFAULT_PER_STEP_YIELD};
use crate::economy::catalog::{UpgradeId, ExchangeTierId};
use crate::economy::income::Yields;

// =============================================================================
// INCOME SOURCE
// =============================================================================

/// Attribution bucket for credited currency.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncomeSource {
    /// Manual taps.
    Click,
    /// Time-based passive income.
    Idle,
    /// Motion-sensor steps.
    Step,
    /// Mini-game payouts.
    MiniGame,
}

impl fmt::Display for IncomeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IncomeSource::Click => "click",
            IncomeSource::Idle => "idle",
            IncomeSource::Step => "step",
            IncomeSource::MiniGame => "minigame",
        };
        f.write_str(name)
    }
}

// =============================================================================
// ERRORS
// =============================================================================

/// Ledger operation errors. The ledger is unchanged whenever one is returned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    /// Debit larger than the current balance.
    #[error("Insufficient funds: need {needed}, have {available}")]
    InsufficientFunds {
        /// Requested debit.
        needed: Amount,
        /// Balance at the time of the request.
        available: Amount,
    },

    /// Negative, non-finite or overflowing amount.
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),
}

// =============================================================================
// LEDGER
// =============================================================================

/// Authoritative currency value plus all cumulative counters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ledger {
    pub(crate) balance: Amount,
    pub(crate) total_ever_earned: Amount,
    pub(crate) total_spent: Amount,
    pub(crate) per_click_yield: Amount,
    pub(crate) per_second_yield: Amount,
    pub(crate) per_step_yield: Amount,
    pub(crate) total_steps: u64,
    pub(crate) earned_from_clicks: Amount,
    pub(crate) earned_from_idle: Amount,
    pub(crate) earned_from_steps: Amount,
    pub(crate) earned_from_mini_games: Amount,
    pub(crate) upgrade_quantities: BTreeMap<UpgradeId, u64>,
    pub(crate) exchanged_counts: BTreeMap<ExchangeTierId, u64>,
    /// Bumped by every reset; orders replicas across resets.
    pub(crate) reset_epoch: u64,
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new(DEFAULT_PER_STEP_YIELD)
    }
}

impl Ledger {
    /// Fresh ledger with the given per-step yield.
    pub fn new(per_step_yield: Amount) -> Self {
        Self {
            balance: Decimal::ZERO,
            total_ever_earned: Decimal::ZERO,
            total_spent: Decimal::ZERO,
            per_click_yield: BASE_PER_CLICK,
            per_second_yield: Decimal::ZERO,
            per_step_yield,
            total_steps: 0,
            earned_from_clicks: Decimal::ZERO,
            earned_from_idle: Decimal::ZERO,
            earned_from_steps: Decimal::ZERO,
            earned_from_mini_games: Decimal::ZERO,
            upgrade_quantities: BTreeMap::new(),
            exchanged_counts: BTreeMap::new(),
            reset_epoch: 0,
        }
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    /// Spendable currency.
    pub fn balance(&self) -> Amount {
        self.balance
    }

    /// Lifetime earnings across all sources.
    pub fn total_ever_earned(&self) -> Amount {
        self.total_ever_earned
    }

    /// Lifetime spending.
    pub fn total_spent(&self) -> Amount {
        self.total_spent
    }

    /// Currency per tap.
    pub fn per_click_yield(&self) -> Amount {
        self.per_click_yield
    }

    /// Currency per second of idle time.
    pub fn per_second_yield(&self) -> Amount {
        self.per_second_yield
    }

    /// Currency per awarded step.
    pub fn per_step_yield(&self) -> Amount {
        self.per_step_yield
    }

    /// Lifetime awarded steps.
    pub fn total_steps(&self) -> u64 {
        self.total_steps
    }

    /// Earnings bucket for one source.
    pub fn earned_from(&self, source: IncomeSource) -> Amount {
        match source {
            IncomeSource::Click => self.earned_from_clicks,
            IncomeSource::Idle => self.earned_from_idle,
            IncomeSource::Step => self.earned_from_steps,
            IncomeSource::MiniGame => self.earned_from_mini_games,
        }
    }

    /// Owned quantity of an upgrade (0 when never bought).
    pub fn upgrade_quantity(&self, id: &str) -> u64 {
        self.upgrade_quantities
            .get(&UpgradeId::new(id))
            .copied()
            .unwrap_or(0)
    }

    /// All owned upgrade quantities.
    pub fn upgrade_quantities(&self) -> &BTreeMap<UpgradeId, u64> {
        &self.upgrade_quantities
    }

    /// How many times an exchange tier was bought.
    pub fn exchanged_count(&self, id: &str) -> u64 {
        self.exchanged_counts
            .get(&ExchangeTierId::new(id))
            .copied()
            .unwrap_or(0)
    }

    /// All exchange counts.
    pub fn exchanged_counts(&self) -> &BTreeMap<ExchangeTierId, u64> {
        &self.exchanged_counts
    }

    /// Reset generation.
    pub fn reset_epoch(&self) -> u64 {
        self.reset_epoch
    }

    // -------------------------------------------------------------------------
    // Mutation
    // -------------------------------------------------------------------------

    /// Add `amount` to the balance, lifetime earnings and the `source` bucket.
    pub fn credit(&mut self, amount: Amount, source: IncomeSource) -> Result<(), LedgerError> {
        if amount.is_sign_negative() && !amount.is_zero() {
            return Err(LedgerError::InvalidAmount(format!(
                "negative credit {} from {}",
                amount, source
            )));
        }

        let overflow = || LedgerError::InvalidAmount(format!("credit {} overflows", amount));
        let balance = self.balance.checked_add(amount).ok_or_else(overflow)?;
        let total = self.total_ever_earned.checked_add(amount).ok_or_else(overflow)?;
        let bucket = self.earned_from(source).checked_add(amount).ok_or_else(overflow)?;

        self.balance = balance;
        self.total_ever_earned = total;
        *self.bucket_mut(source) = bucket;
        Ok(())
    }

    /// Credit awarded steps: `steps * per_step_yield` to the step bucket and
    /// `steps` to the lifetime step count, together.
    pub fn credit_steps(&mut self, steps: u64) -> Result<Amount, LedgerError> {
        let earnings = Decimal::from(steps)
            .checked_mul(self.per_step_yield)
            .ok_or_else(|| LedgerError::InvalidAmount(format!("{} steps overflow", steps)))?;

        self.credit_step_earnings(steps, earnings)?;
        Ok(earnings)
    }

    /// Credit steps whose earnings were priced elsewhere (companion deltas).
    pub(crate) fn credit_step_earnings(&mut self, steps: u64, earnings: Amount) -> Result<(), LedgerError> {
        let total_steps = self.total_steps.checked_add(steps).ok_or_else(|| {
            LedgerError::InvalidAmount(format!("step count {} overflows", steps))
        })?;

        self.credit(earnings, IncomeSource::Step)?;
        self.total_steps = total_steps;
        Ok(())
    }

    /// Subtract `amount` from the balance and add it to lifetime spending.
    pub fn debit(&mut self, amount: Amount) -> Result<(), LedgerError> {
        if amount.is_sign_negative() && !amount.is_zero() {
            return Err(LedgerError::InvalidAmount(format!("negative debit {}", amount)));
        }
        if amount > self.balance {
            return Err(LedgerError::InsufficientFunds {
                needed: amount,
                available: self.balance,
            });
        }

        let spent = self
            .total_spent
            .checked_add(amount)
            .ok_or_else(|| LedgerError::InvalidAmount(format!("debit {} overflows", amount)))?;

        self.balance -= amount;
        self.total_spent = spent;
        Ok(())
    }

    /// Zero every field and start a new reset epoch.
    pub fn reset(&mut self) {
        let epoch = self.reset_epoch + 1;
        *self = Self::new(self.per_step_yield);
        self.reset_epoch = epoch;
    }

    /// Check the ledger invariants.
    pub fn is_consistent(&self) -> bool {
        let buckets = self.bucket_sum();
        let non_negative = !self.balance.is_sign_negative() || self.balance.is_zero();

        non_negative
            && self.balance == self.total_ever_earned - self.total_spent
            && buckets <= self.total_ever_earned
    }

    /// Sum of the four attribution buckets, saturating at `Decimal::MAX`.
    pub fn bucket_sum(&self) -> Amount {
        self.earned_from_clicks
            .saturating_add(self.earned_from_idle)
            .saturating_add(self.earned_from_steps)
            .saturating_add(self.earned_from_mini_games)
    }

    // -------------------------------------------------------------------------
    // Crate-internal mutation (gateway / reconciler only)
    // -------------------------------------------------------------------------

    /// Install derived yields computed by the income model.
    pub(crate) fn set_yields(&mut self, yields: Yields) {
        self.per_click_yield = yields.per_click;
        self.per_second_yield = yields.per_second;
    }

    /// Raise an upgrade count.
    pub(crate) fn add_upgrades(&mut self, id: &UpgradeId, quantity: u64) {
        let entry = self.upgrade_quantities.entry(id.clone()).or_insert(0);
        *entry = entry.saturating_add(quantity);
    }

    /// Raise an exchange count by one.
    pub(crate) fn add_exchange(&mut self, id: &ExchangeTierId) {
        let entry = self.exchanged_counts.entry(id.clone()).or_insert(0);
        *entry = entry.saturating_add(1);
    }

    /// Re-derive `balance` from the merged totals.
    pub(crate) fn rebalance(&mut self) {
        self.balance = self.total_ever_earned - self.total_spent;
    }

    fn bucket_mut(&mut self, source: IncomeSource) -> &mut Amount {
        match source {
            IncomeSource::Click => &mut self.earned_from_clicks,
            IncomeSource::Idle => &mut self.earned_from_idle,
            IncomeSource::Step => &mut self.earned_from_steps,
            IncomeSource::MiniGame => &mut self.earned_from_mini_games,
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
