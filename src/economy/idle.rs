//! Idle-Accrual Clock
//!
//! Time-based income is credited from wall-clock deltas, never from a count
//! of timer ticks, because the process does not run while suspended.
//!
//! ```text
//!   tick   tick   suspend ........ resume   tick
//!    │──────│──────│                 │───────│
//!    └ 1s ──┴ 1s ──┴──── gap ────────┴─ 1s ──┘
//! ```
//!
//! A single watermark (`last_accounted`) covers both the foreground ticks and
//! the resume gap, so no interval can be credited twice. A clock that moved
//! backwards credits zero and leaves the watermark in place, as does an
//! accrual too large to represent.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Serialize, Deserialize};

use crate::core::amount::{Amount, seconds_from_millis};

/// Outcome of one accrual step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Accrual {
    /// Seconds credited (0 when the clock went backwards).
    pub elapsed_seconds: Amount,
    /// `per_second_yield × elapsed_seconds`.
    pub amount: Amount,
}

impl Accrual {
    /// No time credited.
    pub const NONE: Accrual = Accrual {
        elapsed_seconds: Decimal::ZERO,
        amount: Decimal::ZERO,
    };

    /// Whether there is anything to credit.
    pub fn is_empty(&self) -> bool {
        self.amount.is_zero()
    }
}

/// Idle income watermark.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdleClock {
    last_accounted: Option<DateTime<Utc>>,
    suspended: bool,
}

impl IdleClock {
    /// New clock with no watermark yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Last instant up to which idle income has been credited.
    pub fn last_accounted(&self) -> Option<DateTime<Utc>> {
        self.last_accounted
    }

    /// Whether the app is currently suspended.
    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Foreground periodic tick. Ignored while suspended.
    pub fn tick(&mut self, now: DateTime<Utc>, per_second: Amount) -> Accrual {
        if self.suspended {
            return Accrual::NONE;
        }
        self.accrue(now, per_second)
    }

    /// App going to background: settle up to `now`, then stop ticking.
    pub fn suspend(&mut self, now: DateTime<Utc>, per_second: Amount) -> Accrual {
        let accrual = self.accrue(now, per_second);
        self.suspended = true;
        accrual
    }

    /// App became active: credit the gap since the last settlement once.
    pub fn resume(&mut self, now: DateTime<Utc>, per_second: Amount) -> Accrual {
        self.suspended = false;
        self.accrue(now, per_second)
    }

    /// Credit everything between the watermark and `now`.
    fn accrue(&mut self, now: DateTime<Utc>, per_second: Amount) -> Accrual {
        let Some(last) = self.last_accounted else {
            self.last_accounted = Some(now);
            return Accrual::NONE;
        };

        let millis = (now - last).num_milliseconds();
        if millis <= 0 {
            return Accrual::NONE;
        }

        let elapsed_seconds = seconds_from_millis(millis);
        let Some(amount) = per_second.checked_mul(elapsed_seconds) else {
            return Accrual::NONE;
        };
        self.last_accounted = Some(now);

        Accrual { elapsed_seconds, amount }
    }

    /// Move the watermark back to `at` after a credit was refused, so the
    /// interval is offered again on the next settlement.
    pub fn rewind(&mut self, at: Option<DateTime<Utc>>) {
        self.last_accounted = at;
    }
}
