//! Referral codes: buyer discount plus commission bookkeeping for the owner.

use super::{
    apply_code_update, apply_percent, check_not_expired, check_uses_remaining,
    insert_with_unique_code, parse_expiry, PromoCodeUpdate, PromoEngine, PromoError,
};
use crate::storage::{now_rfc3339, with_txn};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferralCode {
    pub id: i64,
    pub code: String,
    pub owner_user_id: String,
    /// Percent off for the buyer.
    pub discount_percent: u8,
    /// Percent of the paid amount owed to the owner. Payout bookkeeping
    /// only, never part of the buyer's price.
    pub commission_percent: u8,
    pub max_uses: Option<i64>,
    pub use_count: i64,
    pub expires_at: Option<DateTime<Utc>>,
    pub active: bool,
}

#[derive(Debug, Clone)]
pub struct NewReferralCode {
    pub code: Option<String>,
    pub owner_user_id: String,
    pub discount_percent: u8,
    pub commission_percent: u8,
    pub max_uses: Option<i64>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl PromoEngine {
    pub fn create_referral(&self, new: &NewReferralCode) -> Result<ReferralCode, PromoError> {
        if new.discount_percent > 100 || new.commission_percent > 100 {
            return Err(PromoError::Validation(
                "referral percentages must be within 0..=100".to_string(),
            ));
        }
        if new.owner_user_id.trim().is_empty() {
            return Err(PromoError::Validation(
                "referral codes require an owner".to_string(),
            ));
        }

        let conn = self.store.lock();
        with_txn(&conn, |c| {
            let code = insert_with_unique_code(new.code.as_deref(), "REF", |code| {
                let changed = c.execute(
                    "INSERT OR IGNORE INTO referral_codes
                     (code, owner_user_id, discount_percent, commission_percent,
                      max_uses, expires_at, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        code,
                        new.owner_user_id,
                        i64::from(new.discount_percent),
                        i64::from(new.commission_percent),
                        new.max_uses,
                        new.expires_at.map(|t| t.to_rfc3339()),
                        now_rfc3339(),
                    ],
                )?;
                Ok(changed > 0)
            })?;
            fetch_referral(c, &code)
        })
    }

    /// Pure read, same contract as discount validation.
    pub fn validate_referral(&self, code: &str) -> Result<ReferralCode, PromoError> {
        let conn = self.store.lock();
        let referral = fetch_referral(&conn, code)?;
        if !referral.active {
            return Err(PromoError::Inactive);
        }
        check_not_expired(referral.expires_at)?;
        check_uses_remaining(referral.max_uses, referral.use_count)?;
        Ok(referral)
    }

    /// Record a confirmed referral purchase and the commission owed.
    /// Duplicate deliveries for the same `payment_ref` record nothing.
    /// Returns the commission amount.
    pub fn record_referral_usage(
        &self,
        code: &str,
        user_id: &str,
        amount_before: i64,
        amount_after: i64,
        payment_ref: Option<&str>,
    ) -> Result<i64, PromoError> {
        let conn = self.store.lock();
        with_txn(&conn, |c| {
            if let Some(payment_ref) = payment_ref {
                let prior: Option<i64> = c
                    .query_row(
                        "SELECT commission FROM referral_usages WHERE payment_ref = ?1",
                        [payment_ref],
                        |row| row.get(0),
                    )
                    .optional()?;
                if let Some(commission) = prior {
                    return Ok(commission);
                }
            }
            let referral = fetch_referral(c, code)?;
            let commission = amount_after - apply_percent(amount_after, referral.commission_percent);
            c.execute(
                "INSERT INTO referral_usages
                 (code_id, user_id, amount_before, amount_after, commission, payment_ref, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    referral.id,
                    user_id,
                    amount_before,
                    amount_after,
                    commission,
                    payment_ref,
                    now_rfc3339(),
                ],
            )?;
            c.execute(
                "UPDATE referral_codes SET use_count = use_count + 1 WHERE id = ?1",
                [referral.id],
            )?;
            Ok(commission)
        })
    }

    pub fn update_referral(&self, code: &str, update: &PromoCodeUpdate) -> Result<(), PromoError> {
        let conn = self.store.lock();
        with_txn(&conn, |c| apply_code_update(c, "referral_codes", code, update))
    }

    /// Total commission owed to one referral owner (payout bookkeeping).
    pub fn commission_owed(&self, owner_user_id: &str) -> Result<i64, PromoError> {
        let conn = self.store.lock();
        let sum: i64 = conn.query_row(
            "SELECT COALESCE(SUM(u.commission), 0)
             FROM referral_usages u JOIN referral_codes c ON c.id = u.code_id
             WHERE c.owner_user_id = ?1",
            [owner_user_id],
            |row| row.get(0),
        )?;
        Ok(sum)
    }
}

fn fetch_referral(conn: &Connection, code: &str) -> Result<ReferralCode, PromoError> {
    let row = conn
        .query_row(
            "SELECT id, code, owner_user_id, discount_percent, commission_percent,
                    max_uses, use_count, expires_at, active
             FROM referral_codes WHERE code = ?1",
            [code],
            |row| {
                Ok(ReferralCode {
                    id: row.get(0)?,
                    code: row.get(1)?,
                    owner_user_id: row.get(2)?,
                    discount_percent: row.get::<_, i64>(3)?.clamp(0, 100) as u8,
                    commission_percent: row.get::<_, i64>(4)?.clamp(0, 100) as u8,
                    max_uses: row.get(5)?,
                    use_count: row.get(6)?,
                    expires_at: parse_expiry(row.get(7)?),
                    active: row.get::<_, i64>(8)? != 0,
                })
            },
        )
        .optional()?;
    row.ok_or_else(|| PromoError::NotFound {
        code: code.to_string(),
    })
}
