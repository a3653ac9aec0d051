//! Upgrade and Exchange Catalog
//!
//! Static reference data validated once at load time. Lookups by an id that
//! is not in the table fail explicitly; nothing downstream ever sees a
//! dangling id.

use std::collections::BTreeMap;
use std::fmt;
use rust_decimal::Decimal;
use serde::{Serialize, Deserialize};

use crate::core::amount::Amount;

// =============================================================================
// IDS
// =============================================================================

/// Upgrade identifier (e.g. `"chromebook"`).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UpgradeId(pub String);

impl UpgradeId {
    /// Create from a string id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UpgradeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Exchange tier identifier (e.g. `"bronze"`).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExchangeTierId(pub String);

impl ExchangeTierId {
    /// Create from a string id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExchangeTierId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// RECORDS
// =============================================================================

/// A purchasable upgrade.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Upgrade {
    /// Catalog id.
    pub id: UpgradeId,
    /// Price per unit.
    pub cost: Amount,
    /// Added to per-second yield per owned unit.
    pub per_second_delta: Amount,
    /// Added to per-click yield per owned unit.
    pub per_click_delta: Amount,
}

impl Upgrade {
    /// Build an upgrade record from integer parameters.
    pub fn new(id: &str, cost: i64, per_second_delta: i64, per_click_delta: i64) -> Self {
        Self {
            id: UpgradeId::new(id),
            cost: Decimal::from(cost),
            per_second_delta: Decimal::from(per_second_delta),
            per_click_delta: Decimal::from(per_click_delta),
        }
    }
}

/// A coin-exchange sink.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeTier {
    /// Catalog id.
    pub id: ExchangeTierId,
    /// Price of one exchange.
    pub cost: Amount,
}

impl ExchangeTier {
    /// Build an exchange tier from an integer cost.
    pub fn new(id: &str, cost: i64) -> Self {
        Self {
            id: ExchangeTierId::new(id),
            cost: Decimal::from(cost),
        }
    }
}

/// Catalog validation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    /// Same id listed twice.
    #[error("Duplicate catalog id: {0}")]
    DuplicateId(String),

    /// Cost must be strictly positive.
    #[error("Non-positive cost for {0}")]
    NonPositiveCost(String),

    /// Yield deltas must not be negative.
    #[error("Negative yield delta for {0}")]
    NegativeDelta(String),

    /// Empty id string.
    #[error("Empty catalog id")]
    EmptyId,
}

// =============================================================================
// CATALOG
// =============================================================================

/// Validated upgrade and exchange tables.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Catalog {
    upgrades: BTreeMap<UpgradeId, Upgrade>,
    exchange_tiers: BTreeMap<ExchangeTierId, ExchangeTier>,
}

impl Catalog {
    /// Build and validate a catalog.
    pub fn from_records(
        upgrades: Vec<Upgrade>,
        exchange_tiers: Vec<ExchangeTier>,
    ) -> Result<Self, CatalogError> {
        let mut upgrade_map = BTreeMap::new();
        for upgrade in upgrades {
            let id = upgrade.id.as_str();
            if id.is_empty() {
                return Err(CatalogError::EmptyId);
            }
            if upgrade.cost <= Decimal::ZERO {
                return Err(CatalogError::NonPositiveCost(id.to_string()));
            }
            if upgrade.per_second_delta.is_sign_negative()
                || upgrade.per_click_delta.is_sign_negative()
            {
                return Err(CatalogError::NegativeDelta(id.to_string()));
            }
            if upgrade_map.contains_key(&upgrade.id) {
                return Err(CatalogError::DuplicateId(id.to_string()));
            }
            upgrade_map.insert(upgrade.id.clone(), upgrade);
        }

        let mut tier_map = BTreeMap::new();
        for tier in exchange_tiers {
            let id = tier.id.as_str();
            if id.is_empty() {
                return Err(CatalogError::EmptyId);
            }
            if tier.cost <= Decimal::ZERO {
                return Err(CatalogError::NonPositiveCost(id.to_string()));
            }
            if tier_map.contains_key(&tier.id) {
                return Err(CatalogError::DuplicateId(id.to_string()));
            }
            tier_map.insert(tier.id.clone(), tier);
        }

        Ok(Self {
            upgrades: upgrade_map,
            exchange_tiers: tier_map,
        })
    }

    /// The shipped catalog.
    pub fn standard() -> Self {
        let upgrades = vec![
            Upgrade::new("pencil", 15, 0, 1),
            Upgrade::new("calculator", 60, 0, 3),
            Upgrade::new("chromebook", 100, 1, 0),
            Upgrade::new("laptop", 500, 5, 0),
            Upgrade::new("gaming_pc", 2_500, 20, 5),
            Upgrade::new("server_rack", 12_000, 100, 0),
            Upgrade::new("data_center", 75_000, 500, 25),
        ];
        let tiers = vec![
            ExchangeTier::new("bronze", 1_000),
            ExchangeTier::new("silver", 10_000),
            ExchangeTier::new("gold", 100_000),
            ExchangeTier::new("diamond", 1_000_000),
        ];
        // The shipped table is fixed and covered by test_standard_catalog_is_valid.
        match Self::from_records(upgrades, tiers) {
            Ok(catalog) => catalog,
            Err(e) => unreachable!("standard catalog invalid: {e}"),
        }
    }

    /// Look up an upgrade.
    pub fn upgrade(&self, id: &str) -> Option<&Upgrade> {
        self.upgrades.get(&UpgradeId::new(id))
    }

    /// Look up an exchange tier.
    pub fn exchange_tier(&self, id: &str) -> Option<&ExchangeTier> {
        self.exchange_tiers.get(&ExchangeTierId::new(id))
    }

    /// All upgrades in id order.
    pub fn upgrades(&self) -> impl Iterator<Item = &Upgrade> {
        self.upgrades.values()
    }

    /// All exchange tiers in id order.
    pub fn exchange_tiers(&self) -> impl Iterator<Item = &ExchangeTier> {
        self.exchange_tiers.values()
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_catalog_is_valid() {
        let upgrades = Catalog::standard().upgrades().cloned().collect::<Vec<_>>();
        let tiers = Catalog::standard().exchange_tiers().cloned().collect::<Vec<_>>();
        assert!(Catalog::from_records(upgrades, tiers).is_ok());
    }

    #[test]
    fn test_chromebook_record() {
        let catalog = Catalog::standard();
        let chromebook = catalog.upgrade("chromebook").unwrap();
        assert_eq!(chromebook.cost, Decimal::from(100));
        assert_eq!(chromebook.per_second_delta, Decimal::ONE);
        assert_eq!(chromebook.per_click_delta, Decimal::ZERO);
    }

    #[test]
    fn test_unknown_ids() {
        let catalog = Catalog::standard();
        assert!(catalog.upgrade("toaster").is_none());
        assert!(catalog.exchange_tier("platinum").is_none());
    }

    #[test]
    fn test_validation_rejects_bad_records() {
        let dup = Catalog::from_records(
            vec![Upgrade::new("a", 1, 0, 1), Upgrade::new("a", 2, 0, 1)],
            vec![],
        );
        assert_eq!(dup, Err(CatalogError::DuplicateId("a".into())));

        let free = Catalog::from_records(vec![Upgrade::new("a", 0, 1, 0)], vec![]);
        assert_eq!(free, Err(CatalogError::NonPositiveCost("a".into())));

        let negative = Catalog::from_records(vec![Upgrade::new("a", 5, -1, 0)], vec![]);
        assert_eq!(negative, Err(CatalogError::NegativeDelta("a".into())));

        let tier = Catalog::from_records(vec![], vec![ExchangeTier::new("t", -5)]);
        assert_eq!(tier, Err(CatalogError::NonPositiveCost("t".into())));

        let empty = Catalog::from_records(vec![Upgrade::new("", 5, 1, 0)], vec![]);
        assert_eq!(empty, Err(CatalogError::EmptyId));
    }
}
