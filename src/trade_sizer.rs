//! Budget-constrained trade sizing.
//!
//! Finds the largest share quantity whose rounded cost in cents fits inside a
//! budget. `trade_cost` is monotonic in the share delta for a fixed side, so an
//! exponential bracket followed by bisection converges on the boundary.

use crate::lmsr_core::{Market, Side};
use crate::money::credits_to_cents;

/// Doublings allowed while searching for an upper bound.
pub const BRACKET_ITERATIONS: usize = 60;
/// Halvings of the bracket; 70 takes a 2^60 bracket well below f64 resolution.
pub const BISECTION_ITERATIONS: usize = 70;

/// Signed cost in whole cents of shifting `side` by `delta_shares`.
#[inline]
pub fn cost_cents_for_delta(market: &Market, side: Side, delta_shares: f64) -> i64 {
    credits_to_cents(market.trade_cost(side, delta_shares))
}

/// Largest non-negative `delta_shares` with `cost_cents_for_delta <= max_cost_cents`.
///
/// Returns `0.0` when the budget cannot buy any positive quantity; callers treat
/// that as "trade too small".
pub fn max_shares_for_budget(market: &Market, side: Side, max_cost_cents: i64) -> f64 {
    if max_cost_cents <= 0 {
        return 0.0;
    }

    let mut low = 0.0_f64;
    let mut high = 1.0_f64;
    for _ in 0..BRACKET_ITERATIONS {
        if cost_cents_for_delta(market, side, high) > max_cost_cents {
            break;
        }
        high *= 2.0;
    }

    for _ in 0..BISECTION_ITERATIONS {
        let mid = (low + high) / 2.0;
        if cost_cents_for_delta(market, side, mid) <= max_cost_cents {
            low = mid;
        } else {
            high = mid;
        }
    }

    tracing::debug!(
        side = %side,
        max_cost_cents,
        shares = low,
        "sized trade for budget"
    );
    low
}
