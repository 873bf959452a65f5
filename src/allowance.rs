//! Monthly allowance grants.
//!
//! Each account is credited once per elapsed UTC calendar month. The decision
//! is a pure function of the account's allowance marker, the current month and
//! the configured rate (`classify`); `grant_allowance_tx` only carries out the
//! chosen transition, so re-running it in the same month is a no-op.

use chrono::{DateTime, Datelike, Utc};
use serde::Serialize;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, info, instrument};

use crate::config::Config;
use crate::db_adapter::{DbAdapter, LedgerPosting};
use crate::error::Result;
use crate::models::{Account, LedgerEntryType, UserId};
use crate::money::format_credits;

/// `year * 12 + month` with a 1-based month, in UTC.
pub fn current_ym(now: DateTime<Utc>) -> i32 {
    now.year() * 12 + now.month() as i32
}

/// Where an account stands relative to this month's allowance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllowanceState {
    /// The marker is ahead of the clock; nothing is owed.
    NoGrantDue,
    /// One or more whole months are owed. A never-granted account owes one.
    GrantDue { months: i32 },
    /// Granted this month at the configured rate.
    CurrentAtRate,
    /// Granted this month at a rate that has since been reconfigured.
    CurrentAtStaleRate { applied_cents: i64 },
}

pub fn classify(
    last_ym: Option<i32>,
    last_cents: Option<i64>,
    now_ym: i32,
    rate_cents: i64,
) -> AllowanceState {
    let Some(last_ym) = last_ym else {
        return AllowanceState::GrantDue { months: 1 };
    };

    if last_ym < now_ym {
        return AllowanceState::GrantDue {
            months: now_ym - last_ym,
        };
    }
    if last_ym > now_ym {
        return AllowanceState::NoGrantDue;
    }

    match last_cents {
        // Marker predates rate tracking: assume the current rate was applied
        None => AllowanceState::CurrentAtRate,
        Some(applied) if applied == rate_cents => AllowanceState::CurrentAtRate,
        Some(applied_cents) => AllowanceState::CurrentAtStaleRate { applied_cents },
    }
}

/// What a grant attempt did to the balance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AllowanceResult {
    pub current_ym: i32,
    pub months_granted: i32,
    pub allowance_cents: i64,
    pub adjustment_cents: i64,
}

impl AllowanceResult {
    fn nothing(current_ym: i32) -> Self {
        Self {
            current_ym,
            ..Self::default()
        }
    }

    pub fn credited_cents(&self) -> i64 {
        self.allowance_cents + self.adjustment_cents
    }
}

/// Grant whatever allowance is due to an already-locked account.
///
/// Must run inside the caller's transaction while it holds the user row lock.
pub async fn grant_allowance_tx(
    tx: &mut Transaction<'_, Postgres>,
    account: &Account,
    config: &Config,
    now: DateTime<Utc>,
) -> Result<AllowanceResult> {
    let now_ym = current_ym(now);
    let rate_cents = config.monthly_allowance_cents();

    let state = classify(
        account.last_allowance_ym,
        account.last_allowance_cents,
        now_ym,
        rate_cents,
    );
    debug!(user_id = account.id, ?state, "allowance state");

    match state {
        AllowanceState::NoGrantDue => Ok(AllowanceResult::nothing(now_ym)),

        AllowanceState::CurrentAtRate => {
            if account.last_allowance_cents.is_none() {
                DbAdapter::set_allowance_marker(tx, account.id, now_ym, rate_cents).await?;
            }
            Ok(AllowanceResult::nothing(now_ym))
        }

        AllowanceState::GrantDue { months } => {
            let allowance_cents = i64::from(months) * rate_cents;
            let note = format!("Monthly allowance x{}", months);
            DbAdapter::post_to_ledger(
                tx,
                LedgerPosting {
                    user_id: account.id,
                    market_id: None,
                    entry_type: LedgerEntryType::Allowance,
                    amount_cents: allowance_cents,
                    ref_trade_id: None,
                    note: &note,
                },
            )
            .await?;
            DbAdapter::set_allowance_marker(tx, account.id, now_ym, rate_cents).await?;

            info!(
                user_id = account.id,
                months,
                amount = %format_credits(allowance_cents),
                "granted monthly allowance"
            );
            Ok(AllowanceResult {
                current_ym: now_ym,
                months_granted: months,
                allowance_cents,
                adjustment_cents: 0,
            })
        }

        AllowanceState::CurrentAtStaleRate { applied_cents } => {
            // A rate cut never takes the balance below zero
            let adjustment_cents = (rate_cents - applied_cents).max(-account.balance_cents);
            if adjustment_cents != 0 {
                let note = format!(
                    "Monthly allowance adjustment ({} -> {})",
                    format_credits(applied_cents),
                    format_credits(rate_cents)
                );
                DbAdapter::post_to_ledger(
                    tx,
                    LedgerPosting {
                        user_id: account.id,
                        market_id: None,
                        entry_type: LedgerEntryType::Allowance,
                        amount_cents: adjustment_cents,
                        ref_trade_id: None,
                        note: &note,
                    },
                )
                .await?;
            }
            DbAdapter::set_allowance_marker(tx, account.id, now_ym, rate_cents).await?;

            info!(
                user_id = account.id,
                applied_cents,
                rate_cents,
                adjustment_cents,
                "reconciled allowance rate change"
            );
            Ok(AllowanceResult {
                current_ym: now_ym,
                months_granted: 0,
                allowance_cents: 0,
                adjustment_cents,
            })
        }
    }
}

/// Lock the user and grant any allowance that is due.
#[instrument(skip(pool, config))]
pub async fn grant_allowance_if_due(
    pool: &PgPool,
    config: &Config,
    user_id: UserId,
) -> Result<AllowanceResult> {
    with_locked_tx!(pool, config, tx, {
        grant_allowance_transaction(&mut tx, config, user_id).await
    })
}

async fn grant_allowance_transaction(
    tx: &mut Transaction<'_, Postgres>,
    config: &Config,
    user_id: UserId,
) -> Result<AllowanceResult> {
    let account = DbAdapter::lock_user(tx, user_id).await?;
    grant_allowance_tx(tx, &account, config, Utc::now()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn ym_is_one_based_month() {
        let jan = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();
        let dec = Utc.with_ymd_and_hms(2023, 12, 31, 23, 59, 59).unwrap();
        assert_eq!(current_ym(jan), 2024 * 12 + 1);
        assert_eq!(current_ym(jan) - current_ym(dec), 1);
    }

    #[test]
    fn never_granted_owes_one_month() {
        assert_eq!(
            classify(None, None, 24_300, 50_000),
            AllowanceState::GrantDue { months: 1 }
        );
    }

    #[test]
    fn missed_months_accumulate() {
        assert_eq!(
            classify(Some(24_297), Some(50_000), 24_300, 50_000),
            AllowanceState::GrantDue { months: 3 }
        );
    }

    #[test]
    fn same_month_same_rate_is_current() {
        assert_eq!(
            classify(Some(24_300), Some(50_000), 24_300, 50_000),
            AllowanceState::CurrentAtRate
        );
        assert_eq!(
            classify(Some(24_300), None, 24_300, 50_000),
            AllowanceState::CurrentAtRate
        );
    }

    #[test]
    fn rate_change_mid_month_is_stale() {
        assert_eq!(
            classify(Some(24_300), Some(50_000), 24_300, 60_000),
            AllowanceState::CurrentAtStaleRate {
                applied_cents: 50_000
            }
        );
    }

    #[test]
    fn future_marker_grants_nothing() {
        assert_eq!(
            classify(Some(24_301), Some(50_000), 24_300, 50_000),
            AllowanceState::NoGrantDue
        );
    }

    #[test]
    fn credited_cents_sums_both_parts() {
        let result = AllowanceResult {
            current_ym: 1,
            months_granted: 2,
            allowance_cents: 1_000,
            adjustment_cents: -200,
        };
        assert_eq!(result.credited_cents(), 800);
    }
}
