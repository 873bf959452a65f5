//! Cross-module property tests over the pure trading layer: sizing, planning,
//! unwinding and settlement replayed in memory without a database.

mod helpers {
    use crate::lmsr_core::Side;
    use crate::models::{
        AmountType, MarketRecord, MarketStatus, Position, TradeKind, TradeRequest,
    };
    use chrono::{Duration, Utc};

    pub fn open_market(b: f64, q_yes: f64, q_no: f64) -> MarketRecord {
        let now = Utc::now();
        MarketRecord {
            id: 1,
            title: "Will the bridge open on time".into(),
            description: String::new(),
            rules: "City announcement".into(),
            closes_at: now + Duration::days(1),
            resolves_at: now + Duration::days(2),
            status: MarketStatus::Open,
            outcome: None,
            b,
            q_yes,
            q_no,
            volume_cents: 0,
            created_by: None,
            created_at: now,
            resolved_at: None,
        }
    }

    pub fn request(side: Side, kind: TradeKind, amount_type: AmountType, amount: f64) -> TradeRequest {
        TradeRequest {
            market_id: 1,
            side,
            kind,
            amount_type,
            amount,
        }
    }

    /// What the store does with a plan: shift the book, bump volume, move the position.
    pub fn apply(
        market: &mut MarketRecord,
        position: &mut Position,
        balance: &mut i64,
        side: Side,
        delta_shares: f64,
        cost_cents: i64,
    ) {
        match side {
            Side::Yes => market.q_yes += delta_shares,
            Side::No => market.q_no += delta_shares,
        }
        market.volume_cents += cost_cents.abs();
        position.apply(side, delta_shares, cost_cents);
        *balance -= cost_cents;
    }
}

mod ledger_properties {
    use super::helpers::*;
    use crate::lmsr_core::Side;
    use crate::models::{AmountType, Position, TradeBan, TradeKind};
    use crate::settlement::{payout_cents, plan_unwind, Unwind};
    use crate::trading::plan_trade;
    use chrono::Utc;
    use proptest::prelude::*;

    const USERS: usize = 4;
    const START_BALANCE: i64 = 50_000;

    #[derive(Debug, Clone)]
    struct Op {
        user: usize,
        yes: bool,
        buy: bool,
        amount: f64,
    }

    fn op() -> impl Strategy<Value = Op> {
        (0..USERS, any::<bool>(), any::<bool>(), 0.01f64..300.0).prop_map(
            |(user, yes, buy, amount)| Op {
                user,
                yes,
                buy,
                amount,
            },
        )
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        // Money only moves between users and the market maker, no balance or
        // holding goes negative, and the maker's loss at resolution is bounded by b*ln2.
        #[test]
        fn replayed_trades_conserve_money(
            b in 50.0f64..2_000.0,
            ops in prop::collection::vec(op(), 1..60),
            resolve_yes in any::<bool>(),
        ) {
            let now = Utc::now();
            let mut market = open_market(b, 0.0, 0.0);
            let initial_cost = market.lmsr().cost();
            let mut balances = [START_BALANCE; USERS];
            let mut positions: Vec<Position> = (0..USERS).map(|u| Position::empty(u as i32, 1)).collect();
            let mut collected_cents = 0i64;
            let mut applied = 0usize;

            for op in &ops {
                let side = if op.yes { Side::Yes } else { Side::No };
                let req = if op.buy {
                    request(side, TradeKind::Buy, AmountType::Credits, op.amount)
                } else {
                    let held = positions[op.user].shares(side);
                    if held <= 0.0 {
                        continue;
                    }
                    // sell a slice of the holding, sometimes all of it
                    let fraction = (op.amount / 300.0).min(1.0);
                    request(side, TradeKind::Sell, AmountType::Shares, held * fraction)
                };

                let plan = match plan_trade(
                    &market,
                    &positions[op.user],
                    balances[op.user],
                    &req,
                    TradeBan::None,
                    now,
                ) {
                    Ok(plan) => plan,
                    Err(_) => continue,
                };

                apply(
                    &mut market,
                    &mut positions[op.user],
                    &mut balances[op.user],
                    plan.side,
                    plan.delta_shares,
                    plan.cost_cents,
                );
                collected_cents += plan.cost_cents;
                applied += 1;

                prop_assert!(balances[op.user] >= 0);
                prop_assert!(positions[op.user].shares_yes >= 0.0);
                prop_assert!(positions[op.user].shares_no >= 0.0);
            }

            let user_total: i64 = balances.iter().sum();
            prop_assert_eq!(user_total + collected_cents, START_BALANCE * USERS as i64);

            // every trade rounds its exact cost to the nearest cent
            let exact_collected = (market.lmsr().cost() - initial_cost) * 100.0;
            let rounding = 0.5 * applied as f64 + 1e-6 * (applied as f64 + 1.0);
            prop_assert!((collected_cents as f64 - exact_collected).abs() <= rounding);

            let winner = if resolve_yes { Side::Yes } else { Side::No };
            let paid: i64 = positions.iter().map(|p| payout_cents(p.shares(winner))).sum();
            let maker_loss = paid - collected_cents;
            let bound = 100.0 * b * std::f64::consts::LN_2 + 0.5 * (USERS + applied) as f64 + 1.0;
            prop_assert!((maker_loss as f64) <= bound, "loss {} bound {}", maker_loss, bound);
        }

        // Unwinding every position leaves nobody holding shares and never charges a user.
        #[test]
        fn unwinding_everything_clears_positions(
            b in 50.0f64..2_000.0,
            buys in prop::collection::vec((0..USERS, any::<bool>(), 0.5f64..200.0), 1..30),
        ) {
            let now = Utc::now();
            let mut market = open_market(b, 0.0, 0.0);
            let mut balances = [START_BALANCE; USERS];
            let mut positions: Vec<Position> = (0..USERS).map(|u| Position::empty(u as i32, 1)).collect();

            for (user, yes, credits) in buys {
                let side = if yes { Side::Yes } else { Side::No };
                let req = request(side, TradeKind::Buy, AmountType::Credits, credits);
                if let Ok(plan) = plan_trade(&market, &positions[user], balances[user], &req, TradeBan::None, now) {
                    apply(&mut market, &mut positions[user], &mut balances[user], side, plan.delta_shares, plan.cost_cents);
                }
            }

            for user in 0..USERS {
                for side in [Side::Yes, Side::No] {
                    let held = positions[user].shares(side);
                    let plan = match plan_unwind(&market, side, held) {
                        Unwind::Nothing => continue,
                        Unwind::Dust(plan) | Unwind::Sell(plan) => plan,
                    };
                    prop_assert!(plan.cost_cents <= 0);
                    apply(&mut market, &mut positions[user], &mut balances[user], side, plan.delta_shares, plan.cost_cents);
                    prop_assert_eq!(positions[user].shares(side), 0.0);
                }
            }

            // book is back where it opened, up to float drift
            prop_assert!(market.q_yes.abs() < 1e-6 && market.q_no.abs() < 1e-6);
        }
    }
}

mod pricing_properties {
    use super::helpers::*;
    use crate::lmsr_core::Side;
    use crate::models::{AmountType, Position, TradeBan, TradeKind};
    use crate::trading::{plan_trade, quote_market};
    use chrono::Utc;
    use proptest::prelude::*;

    proptest! {
        // Buying and immediately selling the same shares nets to at most a cent.
        #[test]
        fn round_trip_costs_at_most_a_cent(
            b in 10.0f64..5_000.0,
            q_yes in 0.0f64..2_000.0,
            q_no in 0.0f64..2_000.0,
            shares in 0.1f64..500.0,
            yes in any::<bool>(),
        ) {
            let now = Utc::now();
            let side = if yes { Side::Yes } else { Side::No };
            let mut market = open_market(b, q_yes, q_no);
            let mut position = Position::empty(1, 1);
            let mut balance = i64::MAX / 4;

            let buy = request(side, TradeKind::Buy, AmountType::Shares, shares);
            let bought = match plan_trade(&market, &position, balance, &buy, TradeBan::None, now) {
                Ok(plan) => plan,
                Err(_) => return Ok(()),
            };
            apply(&mut market, &mut position, &mut balance, side, bought.delta_shares, bought.cost_cents);

            let sell = request(side, TradeKind::Sell, AmountType::Shares, shares);
            let sold = match plan_trade(&market, &position, balance, &sell, TradeBan::None, now) {
                Ok(plan) => plan,
                Err(_) => return Ok(()),
            };
            prop_assert!((bought.cost_cents + sold.cost_cents).abs() <= 1);
        }

        // A quote prices the same delta the trade would.
        #[test]
        fn quote_matches_plan_for_share_buys(
            b in 10.0f64..5_000.0,
            q_yes in 0.0f64..2_000.0,
            q_no in 0.0f64..2_000.0,
            shares in 0.1f64..500.0,
            yes in any::<bool>(),
        ) {
            let side = if yes { Side::Yes } else { Side::No };
            let market = open_market(b, q_yes, q_no);
            let quote = quote_market(&market, side, shares);
            let req = request(side, TradeKind::Buy, AmountType::Shares, shares);
            if let Ok(plan) = plan_trade(&market, &Position::empty(1, 1), i64::MAX / 4, &req, TradeBan::None, Utc::now()) {
                prop_assert_eq!(plan.cost_cents, quote.cost_cents);
            }
            match side {
                Side::Yes => {
                    prop_assert!(quote.price_yes_after >= quote.price_yes_before);
                }
                Side::No => {
                    prop_assert!(quote.price_yes_after <= quote.price_yes_before);
                }
            }
        }
    }

    #[test]
    fn budget_buy_never_exceeds_budget() {
        let market = open_market(1000.0, 0.0, 0.0);
        for credits in [0.05, 1.0, 12.34, 100.0, 999.99] {
            let req = request(Side::No, TradeKind::Buy, AmountType::Credits, credits);
            let plan = plan_trade(&market, &Position::empty(1, 1), 1_000_000, &req, TradeBan::None, Utc::now())
                .unwrap();
            assert!(plan.cost_cents <= crate::money::credits_to_cents(credits));
            assert!(plan.delta_shares > 0.0);
        }
    }
}

mod allowance_properties {
    use crate::allowance::{classify, AllowanceState};
    use proptest::prelude::*;

    proptest! {
        // Once a month's grant is recorded, asking again is a no-op.
        #[test]
        fn recorded_grant_is_idempotent(
            last in prop::option::of(24_000i32..24_400),
            last_cents in prop::option::of(0i64..200_000),
            now in 24_000i32..24_400,
            rate in 1i64..200_000,
        ) {
            match classify(last, last_cents, now, rate) {
                AllowanceState::GrantDue { months } => {
                    prop_assert!(months >= 1);
                    if let Some(last) = last {
                        prop_assert_eq!(months, now - last);
                    }
                }
                AllowanceState::NoGrantDue => {
                    prop_assert!(last.map_or(false, |l| l > now));
                }
                AllowanceState::CurrentAtRate | AllowanceState::CurrentAtStaleRate { .. } => {
                    prop_assert_eq!(last, Some(now));
                }
            }
            prop_assert_eq!(classify(Some(now), Some(rate), now, rate), AllowanceState::CurrentAtRate);
        }
    }
}
