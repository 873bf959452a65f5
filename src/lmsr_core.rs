//! src/lmsr_core.rs
//! Numerically stable LMSR pricing for binary YES/NO markets.
//!
//! Everything here is pure f64 math in *credits*; conversion to integer cents
//! happens in `money` and `trade_sizer`. `trade_cost` is the only pricing
//! primitive the ledger uses: every buy, sell, quote and liquidation is costed
//! through it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Beyond this distance (in units of `b`) the YES price saturates to 0 or 1.
pub const PRICE_CLAMP: f64 = 50.0;

/// Lowest and highest initial probability a market may be opened at.
pub const MIN_INITIAL_PROBABILITY: f64 = 0.01;
pub const MAX_INITIAL_PROBABILITY: f64 = 0.99;

/// Market side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Yes,
    No,
}

impl Side {
    /// Database / wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Yes => "YES",
            Side::No => "NO",
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Yes => Side::No,
            Side::No => Side::Yes,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "YES" => Ok(Side::Yes),
            "NO" => Ok(Side::No),
            _ => Err(format!("Invalid side: '{}', expected 'YES' or 'NO'", s)),
        }
    }
}

/// LMSR inventory of one market: outstanding YES/NO quantities and liquidity.
#[derive(Clone, Copy, PartialEq)]
pub struct Market {
    pub q_yes: f64,
    pub q_no: f64,
    pub b: f64,
}

impl fmt::Debug for Market {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Market")
            .field("q_yes", &self.q_yes)
            .field("q_no", &self.q_no)
            .field("b", &self.b)
            .field("p_yes", &self.price_yes())
            .finish()
    }
}

impl Market {
    pub fn new(q_yes: f64, q_no: f64, b: f64) -> Self {
        debug_assert!(b.is_finite() && b > 0.0, "b must be positive and finite");
        Self { q_yes, q_no, b }
    }

    /// Fresh market opened at `initial_probability`.
    pub fn opened_at(b: f64, initial_probability: f64) -> Self {
        let (q_yes, q_no) = initial_quantities(b, initial_probability);
        Self::new(q_yes, q_no, b)
    }

    pub fn price_yes(&self) -> f64 {
        price_yes(self.q_yes, self.q_no, self.b)
    }

    pub fn cost(&self) -> f64 {
        cost(self.q_yes, self.q_no, self.b)
    }

    /// Signed credits for shifting `side` by `delta_shares`.
    pub fn trade_cost(&self, side: Side, delta_shares: f64) -> f64 {
        trade_cost(self.q_yes, self.q_no, self.b, side, delta_shares)
    }

    /// Inventory after shifting only `side` by `delta_shares`.
    pub fn shifted(&self, side: Side, delta_shares: f64) -> Market {
        match side {
            Side::Yes => Market { q_yes: self.q_yes + delta_shares, ..*self },
            Side::No => Market { q_no: self.q_no + delta_shares, ..*self },
        }
    }
}

// -----------------------
// Numerically stable math
// -----------------------

#[inline]
pub fn log_sum_exp(a: f64, b: f64) -> f64 {
    let m = a.max(b);
    // if m is -inf (when both a,b are -inf), this still returns -inf
    m + ((a - m).exp() + (b - m).exp()).ln()
}

/// LMSR cost function `C(q) = b * ln(e^(q_yes/b) + e^(q_no/b))`, in credits.
#[inline]
pub fn cost(q_yes: f64, q_no: f64, b: f64) -> f64 {
    debug_assert!(b > 0.0 && b.is_finite(), "b invalid");
    b * log_sum_exp(q_yes / b, q_no / b)
}

/// Instantaneous YES price, `sigmoid((q_yes - q_no) / b)`, saturating outside ±50.
#[inline]
pub fn price_yes(q_yes: f64, q_no: f64, b: f64) -> f64 {
    let x = (q_yes - q_no) / b;
    if x >= PRICE_CLAMP {
        return 1.0;
    }
    if x <= -PRICE_CLAMP {
        return 0.0;
    }
    1.0 / (1.0 + (-x).exp())
}

/// Cost of moving one side of the book by `delta_shares`.
///
/// Positive means the trader pays, negative means the trader receives.
#[inline]
pub fn trade_cost(q_yes: f64, q_no: f64, b: f64, side: Side, delta_shares: f64) -> f64 {
    let before = cost(q_yes, q_no, b);
    let after = match side {
        Side::Yes => cost(q_yes + delta_shares, q_no, b),
        Side::No => cost(q_yes, q_no + delta_shares, b),
    };
    after - before
}

/// Starting quantities so that `price_yes` equals `p`.
///
/// `d = b * ln(p / (1 - p))`; the positive part goes to YES, the negative part to NO,
/// so one side always starts at zero.
pub fn initial_quantities(b: f64, p: f64) -> (f64, f64) {
    let d = b * (p / (1.0 - p)).ln();
    if d >= 0.0 {
        (d, 0.0)
    } else {
        (0.0, -d)
    }
}

// -----------------------
// Tests
// -----------------------
