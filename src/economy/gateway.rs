//! Transaction Gateway
//!
//! Validates and applies discrete priced actions against a ledger.
//! Each operation either applies every field change or none: all checks run
//! before the first mutation, and the only fallible mutation (the debit or
//! credit) happens first.

use rust_decimal::Decimal;
use serde::{Serialize, Deserialize};
use tracing::{debug, warn};

use crate::core::amount::{Amount, amount_from_f64};
use crate::economy::catalog::Catalog;
use crate::economy::income::{refresh_yields, Yields};
use crate::economy::ledger::{Ledger, LedgerError, IncomeSource};

/// Rejected intents. The ledger is unchanged whenever one is returned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransactionError {
    /// Price exceeds the balance.
    #[error("Insufficient funds: need {needed}, have {available}")]
    InsufficientFunds {
        /// Total price.
        needed: Amount,
        /// Balance at the time of the request.
        available: Amount,
    },

    /// Negative, non-finite or overflowing amount.
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Upgrade id not in the catalog.
    #[error("Unknown upgrade: {0}")]
    UnknownUpgrade(String),

    /// Exchange tier id not in the catalog.
    #[error("Unknown exchange tier: {0}")]
    UnknownExchangeTier(String),

    /// Purchase quantity must be at least one.
    #[error("Invalid quantity: {0}")]
    InvalidQuantity(u64),

    /// Intent only accepted on the primary device.
    #[error("{0} is only available on the primary device")]
    PrimaryOnly(&'static str),
}

impl From<LedgerError> for TransactionError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::InsufficientFunds { needed, available } => {
                TransactionError::InsufficientFunds { needed, available }
            }
            LedgerError::InvalidAmount(msg) => TransactionError::InvalidAmount(msg),
        }
    }
}

/// Result of a successful purchase.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseReceipt {
    /// Amount debited.
    pub total_cost: Amount,
    /// Owned quantity after the purchase.
    pub owned: u64,
    /// Recomputed yields.
    pub yields: Yields,
}

/// Credit one tap at the current per-click yield.
pub fn tap(ledger: &mut Ledger) -> Result<Amount, TransactionError> {
    let amount = ledger.per_click_yield();
    ledger.credit(amount, IncomeSource::Click)?;
    Ok(amount)
}

/// Buy `quantity` units of an upgrade.
pub fn purchase(
    ledger: &mut Ledger,
    catalog: &Catalog,
    upgrade_id: &str,
    quantity: u64,
) -> Result<PurchaseReceipt, TransactionError> {
    let upgrade = catalog
        .upgrade(upgrade_id)
        .ok_or_else(|| TransactionError::UnknownUpgrade(upgrade_id.to_string()))?;
    if quantity == 0 {
        return Err(TransactionError::InvalidQuantity(quantity));
    }

    let total_cost = upgrade
        .cost
        .checked_mul(Decimal::from(quantity))
        .ok_or_else(|| TransactionError::InvalidAmount(format!("{} x {}", upgrade.cost, quantity)))?;

    if let Err(e) = ledger.debit(total_cost) {
        debug!("Purchase of {} x{} declined: {}", upgrade_id, quantity, e);
        return Err(e.into());
    }

    ledger.add_upgrades(&upgrade.id, quantity);
    let yields = refresh_yields(catalog, ledger);

    Ok(PurchaseReceipt {
        total_cost,
        owned: ledger.upgrade_quantity(upgrade_id),
        yields,
    })
}

/// Buy one exchange of a tier.
pub fn exchange(
    ledger: &mut Ledger,
    catalog: &Catalog,
    tier_id: &str,
) -> Result<u64, TransactionError> {
    let tier = catalog
        .exchange_tier(tier_id)
        .ok_or_else(|| TransactionError::UnknownExchangeTier(tier_id.to_string()))?;

    if let Err(e) = ledger.debit(tier.cost) {
        debug!("Exchange {} declined: {}", tier_id, e);
        return Err(e.into());
    }

    ledger.add_exchange(&tier.id);
    Ok(ledger.exchanged_count(tier_id))
}

/// Credit a mini-game payout of `raw_reward × multiplier`.
pub fn apply_mini_game_reward(
    ledger: &mut Ledger,
    raw_reward: Amount,
    multiplier: Amount,
) -> Result<Amount, TransactionError> {
    if raw_reward.is_sign_negative() && !raw_reward.is_zero() {
        warn!("Dropping negative mini-game reward {}", raw_reward);
        return Err(TransactionError::InvalidAmount(format!("negative reward {}", raw_reward)));
    }
    if multiplier.is_sign_negative() && !multiplier.is_zero() {
        warn!("Dropping negative mini-game multiplier {}", multiplier);
        return Err(TransactionError::InvalidAmount(format!(
            "negative multiplier {}",
            multiplier
        )));
    }

    let payout = raw_reward
        .checked_mul(multiplier)
        .ok_or_else(|| TransactionError::InvalidAmount(format!("{} x {}", raw_reward, multiplier)))?;
    ledger.credit(payout, IncomeSource::MiniGame)?;
    Ok(payout)
}

/// Float entry point for mini-game engines that report `f64` scores.
pub fn apply_mini_game_reward_f64(
    ledger: &mut Ledger,
    raw_reward: f64,
    multiplier: f64,
) -> Result<Amount, TransactionError> {
    let raw = amount_from_f64(raw_reward)
        .ok_or_else(|| TransactionError::InvalidAmount(format!("non-finite reward {}", raw_reward)))?;
    let mult = amount_from_f64(multiplier).ok_or_else(|| {
        TransactionError::InvalidAmount(format!("non-finite multiplier {}", multiplier))
    })?;
    apply_mini_game_reward(ledger, raw, mult)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::economy::catalog::Upgrade;

    fn dec(n: i64) -> Amount {
        Decimal::from(n)
    }

    fn chromebook_only() -> Catalog {
        Catalog::from_records(vec![Upgrade::new("chromebook", 100, 1, 0)], vec![]).unwrap()
    }

    fn funded(amount: i64) -> Ledger {
        let mut ledger = Ledger::default();
        ledger.credit(dec(amount), IncomeSource::Click).unwrap();
        ledger
    }

    #[test]
    fn test_purchase_chromebook_then_declined() {
        let catalog = chromebook_only();
        let mut ledger = funded(150);
        let per_second_before = ledger.per_second_yield();

        let receipt = purchase(&mut ledger, &catalog, "chromebook", 1).unwrap();
        assert_eq!(receipt.total_cost, dec(100));
        assert_eq!(ledger.balance(), dec(50));
        assert_eq!(ledger.per_second_yield(), per_second_before + dec(1));
        assert_eq!(ledger.upgrade_quantity("chromebook"), 1);

        let before = ledger.clone();
        let result = purchase(&mut ledger, &catalog, "chromebook", 1);
        assert_eq!(
            result,
            Err(TransactionError::InsufficientFunds { needed: dec(100), available: dec(50) })
        );
        assert_eq!(ledger, before);
    }

    #[test]
    fn test_purchase_multiple_no_partial() {
        let catalog = chromebook_only();
        let mut ledger = funded(250);
        let before = ledger.clone();

        // 3 x 100 > 250: nothing is bought, not even 2
        assert!(matches!(
            purchase(&mut ledger, &catalog, "chromebook", 3),
            Err(TransactionError::InsufficientFunds { .. })
        ));
        assert_eq!(ledger, before);

        let receipt = purchase(&mut ledger, &catalog, "chromebook", 2).unwrap();
        assert_eq!(receipt.owned, 2);
        assert_eq!(receipt.yields.per_second, dec(2));
        assert_eq!(ledger.total_spent(), dec(200));
    }

    #[test]
    fn test_purchase_unknown_and_zero_quantity() {
        let catalog = chromebook_only();
        let mut ledger = funded(1_000);
        let before = ledger.clone();

        assert_eq!(
            purchase(&mut ledger, &catalog, "toaster", 1),
            Err(TransactionError::UnknownUpgrade("toaster".into()))
        );
        assert_eq!(
            purchase(&mut ledger, &catalog, "chromebook", 0),
            Err(TransactionError::InvalidQuantity(0))
        );
        assert_eq!(ledger, before);
    }

    #[test]
    fn test_exchange() {
        let catalog = Catalog::standard();
        let mut ledger = funded(1_500);

        assert_eq!(exchange(&mut ledger, &catalog, "bronze").unwrap(), 1);
        assert_eq!(ledger.balance(), dec(500));
        assert_eq!(ledger.exchanged_count("bronze"), 1);

        let before = ledger.clone();
        assert!(matches!(
            exchange(&mut ledger, &catalog, "bronze"),
            Err(TransactionError::InsufficientFunds { .. })
        ));
        assert_eq!(
            exchange(&mut ledger, &catalog, "platinum"),
            Err(TransactionError::UnknownExchangeTier("platinum".into()))
        );
        assert_eq!(ledger, before);
    }

    #[test]
    fn test_mini_game_reward() {
        let mut ledger = Ledger::default();
        let payout = apply_mini_game_reward(&mut ledger, dec(100), Decimal::new(125, 2)).unwrap();

        assert_eq!(payout, dec(125));
        assert_eq!(ledger.earned_from(IncomeSource::MiniGame), dec(125));
        assert_eq!(ledger.balance(), dec(125));
    }

    #[test]
    fn test_mini_game_reward_f64() {
        let mut ledger = Ledger::default();
        let payout = apply_mini_game_reward_f64(&mut ledger, 100.0, 1.25).unwrap();
        assert_eq!(payout, dec(125));

        let before = ledger.clone();
        assert!(matches!(
            apply_mini_game_reward_f64(&mut ledger, f64::NAN, 1.0),
            Err(TransactionError::InvalidAmount(_))
        ));
        assert!(matches!(
            apply_mini_game_reward_f64(&mut ledger, 10.0, f64::INFINITY),
            Err(TransactionError::InvalidAmount(_))
        ));
        assert!(matches!(
            apply_mini_game_reward_f64(&mut ledger, -5.0, 1.0),
            Err(TransactionError::InvalidAmount(_))
        ));
        assert_eq!(ledger, before);
    }

    #[test]
    fn test_tap_uses_per_click_yield() {
        let catalog = Catalog::standard();
        let mut ledger = funded(15);
        purchase(&mut ledger, &catalog, "pencil", 1).unwrap();

        assert_eq!(tap(&mut ledger).unwrap(), dec(2));
        assert_eq!(ledger.earned_from(IncomeSource::Click), dec(17));
        assert_eq!(ledger.balance(), dec(2));
    }
}
