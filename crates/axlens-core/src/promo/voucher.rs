//! Vouchers: one-shot-per-user codes redeemed directly for ledger credits.
//!
//! Redemption is a single transaction: uniqueness insert, conditional
//! use-counter increment, ledger credit. Any failure rolls the whole thing
//! back, so a rejected redemption leaves no trace.

use super::{
    apply_code_update, check_not_expired, insert_with_unique_code, parse_expiry, PromoCodeUpdate,
    PromoEngine, PromoError,
};
use crate::model::TransactionKind;
use crate::storage::{now_rfc3339, with_txn};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Voucher {
    pub id: i64,
    pub code: String,
    pub credits: i64,
    pub max_uses: Option<i64>,
    pub use_count: i64,
    pub expires_at: Option<DateTime<Utc>>,
    pub active: bool,
}

#[derive(Debug, Clone)]
pub struct NewVoucher {
    pub code: Option<String>,
    pub credits: i64,
    pub max_uses: Option<i64>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl PromoEngine {
    pub fn create_voucher(&self, new: &NewVoucher) -> Result<Voucher, PromoError> {
        if new.credits <= 0 {
            return Err(PromoError::Validation(format!(
                "voucher credits must be positive, got {}",
                new.credits
            )));
        }
        if new.max_uses.is_some_and(|m| m <= 0) {
            return Err(PromoError::Validation(
                "max uses must be positive".to_string(),
            ));
        }

        let conn = self.store.lock();
        with_txn(&conn, |c| {
            let code = insert_with_unique_code(new.code.as_deref(), "AX", |code| {
                let changed = c.execute(
                    "INSERT OR IGNORE INTO vouchers
                     (code, credits, max_uses, expires_at, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        code,
                        new.credits,
                        new.max_uses,
                        new.expires_at.map(|t| t.to_rfc3339()),
                        now_rfc3339(),
                    ],
                )?;
                Ok(changed > 0)
            })?;
            fetch_voucher(c, &code)
        })
    }

    pub fn get_voucher(&self, code: &str) -> Result<Voucher, PromoError> {
        let conn = self.store.lock();
        fetch_voucher(&conn, code)
    }

    /// Redeem a voucher for `user_id`, crediting the ledger in the same
    /// transaction. `client_key` identifies the caller for rate limiting
    /// (typically the client IP). Returns the new credit balance.
    pub fn redeem_voucher(
        &self,
        code: &str,
        user_id: &str,
        client_key: &str,
    ) -> Result<i64, PromoError> {
        if !self.limiter.check(client_key) {
            return Err(PromoError::RateLimited);
        }

        let conn = self.store.lock();
        with_txn(&conn, |c| {
            let voucher = fetch_voucher(c, code)?;
            if !voucher.active {
                return Err(PromoError::Inactive);
            }
            check_not_expired(voucher.expires_at)?;

            // Per-user uniqueness first, so a repeat redemption reads as
            // AlreadyRedeemed even when the voucher is also exhausted.
            let inserted = c.execute(
                "INSERT INTO voucher_redemptions (voucher_id, user_id, credits, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![voucher.id, user_id, voucher.credits, now_rfc3339()],
            );
            if let Err(e) = inserted {
                if e.to_string().contains("UNIQUE constraint failed") {
                    return Err(PromoError::AlreadyRedeemed);
                }
                return Err(e.into());
            }

            // Conditional increment: the remaining-uses check and the bump
            // are one statement, so racing redeemers cannot exceed max_uses.
            let changed = c.execute(
                "UPDATE vouchers SET use_count = use_count + 1
                 WHERE id = ?1 AND (max_uses IS NULL OR use_count < max_uses)",
                [voucher.id],
            )?;
            if changed == 0 {
                return Err(PromoError::Exhausted);
            }

            let balance = self.ledger.credit_with_conn(
                c,
                user_id,
                voucher.credits,
                TransactionKind::Bonus,
                &format!("voucher {}", voucher.code),
            )?;
            Ok(balance)
        })
    }

    pub fn update_voucher(&self, code: &str, update: &PromoCodeUpdate) -> Result<(), PromoError> {
        let conn = self.store.lock();
        with_txn(&conn, |c| apply_code_update(c, "vouchers", code, update))
    }

    /// Redemption count for a voucher (audit support).
    pub fn count_redemptions(&self, code: &str) -> Result<i64, PromoError> {
        let conn = self.store.lock();
        let voucher = fetch_voucher(&conn, code)?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM voucher_redemptions WHERE voucher_id = ?1",
            [voucher.id],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

fn fetch_voucher(conn: &Connection, code: &str) -> Result<Voucher, PromoError> {
    let row = conn
        .query_row(
            "SELECT id, code, credits, max_uses, use_count, expires_at, active
             FROM vouchers WHERE code = ?1",
            [code],
            |row| {
                Ok(Voucher {
                    id: row.get(0)?,
                    code: row.get(1)?,
                    credits: row.get(2)?,
                    max_uses: row.get(3)?,
                    use_count: row.get(4)?,
                    expires_at: parse_expiry(row.get(5)?),
                    active: row.get::<_, i64>(6)? != 0,
                })
            },
        )
        .optional()?;
    row.ok_or_else(|| PromoError::NotFound {
        code: code.to_string(),
    })
}
