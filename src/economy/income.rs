//! Income Model
//!
//! Per-click and per-second yields are a pure function of owned upgrade
//! quantities. They are never adjusted independently; every change to the
//! quantities is followed by [`refresh_yields`].

use std::collections::BTreeMap;
use rust_decimal::Decimal;
use serde::{Serialize, Deserialize};
use tracing::warn;

use crate::core::amount::{Amount, BASE_PER_CLICK};
use crate::economy::catalog::{Catalog, UpgradeId};
use crate::economy::ledger::Ledger;

/// Derived income rates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Yields {
    /// Currency per tap (≥ 1).
    pub per_click: Amount,
    /// Currency per second (≥ 0).
    pub per_second: Amount,
}

impl Default for Yields {
    fn default() -> Self {
        Self {
            per_click: BASE_PER_CLICK,
            per_second: Decimal::ZERO,
        }
    }
}

/// Compute yields from owned quantities.
///
/// `per_click = 1 + Σ qty × per_click_delta`,
/// `per_second = Σ qty × per_second_delta`.
/// Ids missing from the catalog contribute nothing.
pub fn compute_yields(catalog: &Catalog, quantities: &BTreeMap<UpgradeId, u64>) -> Yields {
    let mut yields = Yields::default();

    for (id, &quantity) in quantities {
        if quantity == 0 {
            continue;
        }
        let Some(upgrade) = catalog.upgrade(id.as_str()) else {
            warn!("Ignoring yields for unknown upgrade {}", id);
            continue;
        };
        let qty = Decimal::from(quantity);
        yields.per_click = yields
            .per_click
            .saturating_add(qty.saturating_mul(upgrade.per_click_delta));
        yields.per_second = yields
            .per_second
            .saturating_add(qty.saturating_mul(upgrade.per_second_delta));
    }

    yields
}

/// Recompute and install the ledger's derived yields.
pub fn refresh_yields(catalog: &Catalog, ledger: &mut Ledger) -> Yields {
    let yields = compute_yields(catalog, ledger.upgrade_quantities());
    ledger.set_yields(yields);
    yields
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quantities(pairs: &[(&str, u64)]) -> BTreeMap<UpgradeId, u64> {
        pairs.iter().map(|(id, q)| (UpgradeId::new(*id), *q)).collect()
    }

    #[test]
    fn test_base_yields() {
        let yields = compute_yields(&Catalog::standard(), &BTreeMap::new());
        assert_eq!(yields.per_click, Decimal::ONE);
        assert_eq!(yields.per_second, Decimal::ZERO);
    }

    #[test]
    fn test_yields_sum_over_upgrades() {
        // pencil: +1 click, chromebook: +1/s, gaming_pc: +20/s +5 click
        let q = quantities(&[("pencil", 3), ("chromebook", 2), ("gaming_pc", 1)]);
        let yields = compute_yields(&Catalog::standard(), &q);

        assert_eq!(yields.per_click, Decimal::from(1 + 3 + 5));
        assert_eq!(yields.per_second, Decimal::from(2 + 20));
    }

    #[test]
    fn test_unknown_upgrade_contributes_nothing() {
        let q = quantities(&[("toaster", 9), ("chromebook", 1)]);
        let yields = compute_yields(&Catalog::standard(), &q);
        assert_eq!(yields.per_second, Decimal::ONE);
        assert_eq!(yields.per_click, Decimal::ONE);
    }

    #[test]
    fn test_refresh_installs_on_ledger() {
        let catalog = Catalog::standard();
        let mut ledger = Ledger::default();
        ledger.add_upgrades(&UpgradeId::new("laptop"), 2);

        let yields = refresh_yields(&catalog, &mut ledger);
        assert_eq!(yields.per_second, Decimal::from(10));
        assert_eq!(ledger.per_second_yield(), Decimal::from(10));
        assert_eq!(ledger.per_click_yield(), Decimal::ONE);
    }
}
