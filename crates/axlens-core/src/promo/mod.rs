//! Promotion engine: discount codes, referral codes, and vouchers.
//!
//! The three families share a validate → redeem → record shape. Validation is
//! always side-effect free; usage recording happens after payment
//! confirmation (discounts, referrals) or inside the atomic redemption
//! transaction (vouchers).

pub mod codegen;
mod discount;
mod referral;
mod voucher;

pub use discount::{DiscountCode, DiscountValue, NewDiscountCode};
pub use referral::{NewReferralCode, ReferralCode};
pub use voucher::{NewVoucher, Voucher};

use crate::config::LimitConfig;
use crate::ledger::{CreditLedger, LedgerError};
use crate::ratelimit::RateLimiter;
use crate::storage::Store;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PromoError {
    #[error("Promotion code not found: {code}")]
    NotFound { code: String },

    #[error("Promotion code is inactive")]
    Inactive,

    #[error("Promotion code expired at {expires_at}")]
    Expired { expires_at: DateTime<Utc> },

    #[error("Promotion code has no uses remaining")]
    Exhausted,

    #[error("Purchase amount {amount} is below the minimum {min}")]
    BelowMinimumPurchase { min: i64, amount: i64 },

    #[error("Voucher already redeemed by this user")]
    AlreadyRedeemed,

    #[error("Too many redemption attempts, retry later")]
    RateLimited,

    #[error("Invalid promotion definition: {0}")]
    Validation(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("Database error: {0}")]
    Database(String),
}

impl From<rusqlite::Error> for PromoError {
    fn from(e: rusqlite::Error) -> Self {
        PromoError::Database(e.to_string())
    }
}

pub struct PromoEngine {
    pub(crate) store: Store,
    pub(crate) ledger: CreditLedger,
    pub(crate) limiter: RateLimiter,
}

impl PromoEngine {
    pub fn new(store: Store, ledger: CreditLedger, limits: &LimitConfig) -> Self {
        Self {
            store,
            ledger,
            limiter: RateLimiter::new(
                Duration::from_secs(limits.redeem_window_secs),
                limits.redeem_max_attempts,
            ),
        }
    }
}

/// Outcome of pricing a purchase against supplied promotion codes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quote {
    pub amount_due: i64,
    pub discount: i64,
    pub applied: Option<AppliedPromo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppliedPromo {
    Referral { code: String, commission_percent: u8 },
    Discount { code: String },
}

impl PromoEngine {
    /// Price a purchase. A referral code wins over a discount code when both
    /// are supplied; the two are never combined.
    pub fn quote(
        &self,
        amount: i64,
        referral_code: Option<&str>,
        discount_code: Option<&str>,
    ) -> Result<Quote, PromoError> {
        if let Some(code) = referral_code {
            let referral = self.validate_referral(code)?;
            let amount_due = apply_percent(amount, referral.discount_percent);
            return Ok(Quote {
                amount_due,
                discount: amount - amount_due,
                applied: Some(AppliedPromo::Referral {
                    code: referral.code,
                    commission_percent: referral.commission_percent,
                }),
            });
        }
        if let Some(code) = discount_code {
            let discount = self.validate_discount(code, Some(amount))?;
            let amount_due = discount.calculate(amount);
            return Ok(Quote {
                amount_due,
                discount: amount - amount_due,
                applied: Some(AppliedPromo::Discount {
                    code: discount.code,
                }),
            });
        }
        Ok(Quote {
            amount_due: amount,
            discount: 0,
            applied: None,
        })
    }
}

/// Partial update for a promotion code. A `None` field is left untouched.
#[derive(Debug, Clone, Default)]
pub struct PromoCodeUpdate {
    pub active: Option<bool>,
    pub max_uses: Option<i64>,
    pub expires_at: Option<DateTime<Utc>>,
}

pub(crate) fn apply_code_update(
    conn: &Connection,
    table: &str,
    code: &str,
    update: &PromoCodeUpdate,
) -> Result<(), PromoError> {
    let exists: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {table} WHERE code = ?1"),
        [code],
        |row| row.get(0),
    )?;
    if exists == 0 {
        return Err(PromoError::NotFound {
            code: code.to_string(),
        });
    }
    if let Some(active) = update.active {
        conn.execute(
            &format!("UPDATE {table} SET active = ?1 WHERE code = ?2"),
            rusqlite::params![active as i32, code],
        )?;
    }
    if let Some(max_uses) = update.max_uses {
        conn.execute(
            &format!("UPDATE {table} SET max_uses = ?1 WHERE code = ?2"),
            rusqlite::params![max_uses, code],
        )?;
    }
    if let Some(expires_at) = update.expires_at {
        conn.execute(
            &format!("UPDATE {table} SET expires_at = ?1 WHERE code = ?2"),
            rusqlite::params![expires_at.to_rfc3339(), code],
        )?;
    }
    Ok(())
}

pub(crate) fn check_not_expired(expires_at: Option<DateTime<Utc>>) -> Result<(), PromoError> {
    if let Some(expires_at) = expires_at {
        if expires_at < Utc::now() {
            return Err(PromoError::Expired { expires_at });
        }
    }
    Ok(())
}

pub(crate) fn check_uses_remaining(max_uses: Option<i64>, use_count: i64) -> Result<(), PromoError> {
    if let Some(max) = max_uses {
        if use_count >= max {
            return Err(PromoError::Exhausted);
        }
    }
    Ok(())
}

pub(crate) fn parse_expiry(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    })
}

pub(crate) fn apply_percent(amount: i64, percent: u8) -> i64 {
    (amount - amount * i64::from(percent) / 100).max(0)
}

/// Insert a row whose code column must be unique. A caller-supplied code that
/// collides is an error; an auto-generated one is re-rolled.
pub(crate) fn insert_with_unique_code<F>(
    supplied: Option<&str>,
    prefix: &str,
    mut insert: F,
) -> Result<String, PromoError>
where
    F: FnMut(&str) -> Result<bool, PromoError>,
{
    if let Some(code) = supplied {
        let code = code.trim();
        if code.is_empty() {
            return Err(PromoError::Validation("code must not be empty".to_string()));
        }
        if !insert(code)? {
            return Err(PromoError::Validation(format!("code already in use: {code}")));
        }
        return Ok(code.to_string());
    }

    for _ in 0..8 {
        let code = codegen::generate(prefix, codegen::DEFAULT_CODE_LEN);
        if insert(&code)? {
            return Ok(code);
        }
    }
    Err(PromoError::Database(
        "could not allocate a unique promotion code".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CreditConfig;

    pub(crate) fn engine() -> PromoEngine {
        let store = Store::memory().unwrap();
        let ledger = CreditLedger::new(
            store.clone(),
            CreditConfig {
                signup_bonus: 0,
                admin_principal: None,
                admin_bonus: 0,
            },
        );
        PromoEngine::new(store, ledger, &LimitConfig::default())
    }

    #[test]
    fn test_quote_without_codes_is_full_price() {
        let engine = engine();
        let quote = engine.quote(1000, None, None).unwrap();
        assert_eq!(quote.amount_due, 1000);
        assert_eq!(quote.discount, 0);
        assert!(quote.applied.is_none());
    }

    #[test]
    fn test_referral_wins_over_discount() {
        let engine = engine();
        engine
            .create_discount(&NewDiscountCode {
                code: Some("HALF".to_string()),
                value: DiscountValue::Percentage(50),
                min_purchase: None,
                max_uses: None,
                expires_at: None,
            })
            .unwrap();
        engine
            .create_referral(&NewReferralCode {
                code: Some("FRIEND".to_string()),
                owner_user_id: "owner".to_string(),
                discount_percent: 10,
                commission_percent: 5,
                max_uses: None,
                expires_at: None,
            })
            .unwrap();

        let quote = engine.quote(1000, Some("FRIEND"), Some("HALF")).unwrap();
        assert_eq!(quote.amount_due, 900, "referral discount applied, not 50%");
        assert!(matches!(
            quote.applied,
            Some(AppliedPromo::Referral { ref code, commission_percent: 5 }) if code == "FRIEND"
        ));
    }

    #[test]
    fn test_apply_percent_never_negative() {
        assert_eq!(apply_percent(1000, 0), 1000);
        assert_eq!(apply_percent(1000, 100), 0);
        assert_eq!(apply_percent(3, 50), 2); // integer division keeps cents
    }

    #[test]
    fn test_code_update_is_partial() {
        let engine = engine();
        engine
            .create_voucher(&NewVoucher {
                code: Some("GIFT".to_string()),
                credits: 5,
                max_uses: Some(10),
                expires_at: None,
            })
            .unwrap();

        engine
            .update_voucher(
                "GIFT",
                &PromoCodeUpdate {
                    active: Some(false),
                    ..Default::default()
                },
            )
            .unwrap();

        let voucher = engine.get_voucher("GIFT").unwrap();
        assert!(!voucher.active);
        assert_eq!(voucher.max_uses, Some(10), "untouched field survives");
    }

    #[test]
    fn test_code_update_unknown_code() {
        let engine = engine();
        let err = engine
            .update_voucher("NOPE", &PromoCodeUpdate::default())
            .unwrap_err();
        assert!(matches!(err, PromoError::NotFound { .. }));
    }
}
