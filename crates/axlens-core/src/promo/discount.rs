//! Discount codes: percentage or fixed-amount off a purchase.
//!
//! Validation never mutates anything; usage is recorded only after the
//! payment collaborator confirms the purchase.

use super::{
    apply_code_update, apply_percent, check_not_expired, check_uses_remaining,
    insert_with_unique_code, parse_expiry, PromoCodeUpdate, PromoEngine, PromoError,
};
use crate::storage::{now_rfc3339, with_txn};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscountValue {
    /// Percent off, 0..=100.
    Percentage(u8),
    /// Flat amount off, in the purchase currency's minor unit.
    Fixed(i64),
}

impl DiscountValue {
    fn kind(&self) -> &'static str {
        match self {
            DiscountValue::Percentage(_) => "percentage",
            DiscountValue::Fixed(_) => "fixed",
        }
    }

    fn raw(&self) -> i64 {
        match self {
            DiscountValue::Percentage(p) => i64::from(*p),
            DiscountValue::Fixed(v) => *v,
        }
    }

    fn from_row(kind: &str, raw: i64) -> Option<Self> {
        match kind {
            "percentage" => Some(DiscountValue::Percentage(raw.clamp(0, 100) as u8)),
            "fixed" => Some(DiscountValue::Fixed(raw)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscountCode {
    pub id: i64,
    pub code: String,
    pub value: DiscountValue,
    pub min_purchase: Option<i64>,
    pub max_uses: Option<i64>,
    pub use_count: i64,
    pub expires_at: Option<DateTime<Utc>>,
    pub active: bool,
}

impl DiscountCode {
    /// Discounted amount for a purchase, never below zero.
    pub fn calculate(&self, amount: i64) -> i64 {
        match self.value {
            DiscountValue::Percentage(p) => apply_percent(amount, p),
            DiscountValue::Fixed(v) => (amount - v).max(0),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewDiscountCode {
    /// Caller-supplied code, or None to auto-generate.
    pub code: Option<String>,
    pub value: DiscountValue,
    pub min_purchase: Option<i64>,
    pub max_uses: Option<i64>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl PromoEngine {
    pub fn create_discount(&self, new: &NewDiscountCode) -> Result<DiscountCode, PromoError> {
        match new.value {
            DiscountValue::Percentage(p) if p > 100 => {
                return Err(PromoError::Validation(format!(
                    "percentage must be within 0..=100, got {p}"
                )));
            }
            DiscountValue::Fixed(v) if v <= 0 => {
                return Err(PromoError::Validation(format!(
                    "fixed discount must be positive, got {v}"
                )));
            }
            _ => {}
        }
        if new.min_purchase.is_some_and(|m| m <= 0) {
            return Err(PromoError::Validation(
                "minimum purchase must be positive".to_string(),
            ));
        }

        let conn = self.store.lock();
        with_txn(&conn, |c| {
            let code = insert_with_unique_code(new.code.as_deref(), "", |code| {
                let changed = c.execute(
                    "INSERT OR IGNORE INTO discount_codes
                     (code, value_kind, value, min_purchase, max_uses, expires_at, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        code,
                        new.value.kind(),
                        new.value.raw(),
                        new.min_purchase,
                        new.max_uses,
                        new.expires_at.map(|t| t.to_rfc3339()),
                        now_rfc3339(),
                    ],
                )?;
                Ok(changed > 0)
            })?;
            fetch_discount(c, &code)
        })
    }

    /// Check a code against a prospective purchase. Pure read; probing a code
    /// consumes nothing.
    pub fn validate_discount(
        &self,
        code: &str,
        purchase_amount: Option<i64>,
    ) -> Result<DiscountCode, PromoError> {
        let conn = self.store.lock();
        let discount = fetch_discount(&conn, code)?;
        if !discount.active {
            return Err(PromoError::Inactive);
        }
        check_not_expired(discount.expires_at)?;
        check_uses_remaining(discount.max_uses, discount.use_count)?;
        if let (Some(amount), Some(min)) = (purchase_amount, discount.min_purchase) {
            if amount < min {
                return Err(PromoError::BelowMinimumPurchase { min, amount });
            }
        }
        Ok(discount)
    }

    /// Record a confirmed use. Invoked by the payment webhook collaborator;
    /// duplicate deliveries for the same `payment_ref` record nothing.
    pub fn record_discount_usage(
        &self,
        code: &str,
        user_id: &str,
        amount_before: i64,
        amount_after: i64,
        payment_ref: Option<&str>,
    ) -> Result<(), PromoError> {
        let conn = self.store.lock();
        with_txn(&conn, |c| {
            if let Some(payment_ref) = payment_ref {
                let seen: Option<i64> = c
                    .query_row(
                        "SELECT id FROM discount_usages WHERE payment_ref = ?1",
                        [payment_ref],
                        |row| row.get(0),
                    )
                    .optional()?;
                if seen.is_some() {
                    return Ok(());
                }
            }
            let discount = fetch_discount(c, code)?;
            c.execute(
                "INSERT INTO discount_usages
                 (code_id, user_id, amount_before, amount_after, payment_ref, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    discount.id,
                    user_id,
                    amount_before,
                    amount_after,
                    payment_ref,
                    now_rfc3339(),
                ],
            )?;
            c.execute(
                "UPDATE discount_codes SET use_count = use_count + 1 WHERE id = ?1",
                [discount.id],
            )?;
            Ok(())
        })
    }

    pub fn update_discount(&self, code: &str, update: &PromoCodeUpdate) -> Result<(), PromoError> {
        let conn = self.store.lock();
        with_txn(&conn, |c| apply_code_update(c, "discount_codes", code, update))
    }
}

fn fetch_discount(conn: &Connection, code: &str) -> Result<DiscountCode, PromoError> {
    let row = conn
        .query_row(
            "SELECT id, code, value_kind, value, min_purchase, max_uses, use_count,
                    expires_at, active
             FROM discount_codes WHERE code = ?1",
            [code],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, Option<i64>>(4)?,
                    row.get::<_, Option<i64>>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, Option<String>>(7)?,
                    row.get::<_, i64>(8)?,
                ))
            },
        )
        .optional()?;

    let (id, code, kind, raw, min_purchase, max_uses, use_count, expires_at, active) =
        row.ok_or_else(|| PromoError::NotFound {
            code: code.to_string(),
        })?;
    let value = DiscountValue::from_row(&kind, raw)
        .ok_or_else(|| PromoError::Database(format!("unknown discount kind: {kind}")))?;
    Ok(DiscountCode {
        id,
        code,
        value,
        min_purchase,
        max_uses,
        use_count,
        expires_at: parse_expiry(expires_at),
        active: active != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::super::tests::engine;
    use super::*;
    use chrono::Duration;

    fn plain(code: &str, value: DiscountValue) -> NewDiscountCode {
        NewDiscountCode {
            code: Some(code.to_string()),
            value,
            min_purchase: None,
            max_uses: None,
            expires_at: None,
        }
    }

    #[test]
    fn test_percentage_out_of_range_rejected_at_creation() {
        let engine = engine();
        let err = engine
            .create_discount(&plain("BAD", DiscountValue::Percentage(101)))
            .unwrap_err();
        assert!(matches!(err, PromoError::Validation(_)));
    }

    #[test]
    fn test_calculate_percentage_and_fixed() {
        let engine = engine();
        let pct = engine
            .create_discount(&plain("P25", DiscountValue::Percentage(25)))
            .unwrap();
        assert_eq!(pct.calculate(1000), 750);

        let fixed = engine
            .create_discount(&plain("F300", DiscountValue::Fixed(300)))
            .unwrap();
        assert_eq!(fixed.calculate(1000), 700);
        assert_eq!(fixed.calculate(200), 0, "never below zero");
    }

    #[test]
    fn test_validate_checks_minimum_purchase_without_mutation() {
        let engine = engine();
        engine
            .create_discount(&NewDiscountCode {
                code: Some("MIN500".to_string()),
                value: DiscountValue::Percentage(10),
                min_purchase: Some(500),
                max_uses: Some(3),
                expires_at: None,
            })
            .unwrap();

        let err = engine.validate_discount("MIN500", Some(499)).unwrap_err();
        assert_eq!(
            err,
            PromoError::BelowMinimumPurchase {
                min: 500,
                amount: 499
            }
        );
        // Failed validation consumed nothing
        let code = engine.validate_discount("MIN500", Some(500)).unwrap();
        assert_eq!(code.use_count, 0);
    }

    #[test]
    fn test_validate_unknown_inactive_expired_exhausted() {
        let engine = engine();
        assert!(matches!(
            engine.validate_discount("NOPE", None).unwrap_err(),
            PromoError::NotFound { .. }
        ));

        engine
            .create_discount(&plain("OFF", DiscountValue::Percentage(10)))
            .unwrap();
        engine
            .update_discount(
                "OFF",
                &PromoCodeUpdate {
                    active: Some(false),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(engine.validate_discount("OFF", None).unwrap_err(), PromoError::Inactive);

        engine
            .create_discount(&NewDiscountCode {
                code: Some("OLD".to_string()),
                value: DiscountValue::Percentage(10),
                min_purchase: None,
                max_uses: None,
                expires_at: Some(Utc::now() - Duration::hours(1)),
            })
            .unwrap();
        assert!(matches!(
            engine.validate_discount("OLD", None).unwrap_err(),
            PromoError::Expired { .. }
        ));

        engine
            .create_discount(&NewDiscountCode {
                code: Some("ONCE".to_string()),
                value: DiscountValue::Percentage(10),
                min_purchase: None,
                max_uses: Some(1),
                expires_at: None,
            })
            .unwrap();
        engine
            .record_discount_usage("ONCE", "u1", 1000, 900, Some("pay_1"))
            .unwrap();
        assert_eq!(engine.validate_discount("ONCE", None).unwrap_err(), PromoError::Exhausted);
    }

    #[test]
    fn test_record_usage_is_idempotent_on_payment_ref() {
        let engine = engine();
        engine
            .create_discount(&plain("OFF", DiscountValue::Percentage(10)))
            .unwrap();
        engine
            .record_discount_usage("OFF", "u1", 1000, 900, Some("pay_9"))
            .unwrap();
        engine
            .record_discount_usage("OFF", "u1", 1000, 900, Some("pay_9"))
            .unwrap();

        let code = engine.validate_discount("OFF", None).unwrap();
        assert_eq!(code.use_count, 1, "duplicate webhook recorded once");
    }

    #[test]
    fn test_supplied_duplicate_code_rejected_autogenerated_rerolls() {
        let engine = engine();
        engine
            .create_discount(&plain("SAME", DiscountValue::Percentage(10)))
            .unwrap();
        let err = engine
            .create_discount(&plain("SAME", DiscountValue::Percentage(20)))
            .unwrap_err();
        assert!(matches!(err, PromoError::Validation(_)));

        // Auto-generated codes allocate without error
        let auto = engine
            .create_discount(&NewDiscountCode {
                code: None,
                value: DiscountValue::Percentage(10),
                min_purchase: None,
                max_uses: None,
                expires_at: None,
            })
            .unwrap();
        assert_eq!(auto.code.len(), super::super::codegen::DEFAULT_CODE_LEN);
    }
}
