//! Credit ledger: atomic balance mutation over an append-only transaction log.
//!
//! Invariant: for every user, the sum of `credit_transactions.amount` equals
//! `credit_accounts.balance`. Every mutation appends exactly one log entry
//! inside the same transaction that moves the balance.

use crate::config::CreditConfig;
use crate::model::{CreditTransaction, TransactionKind};
use crate::storage::{now_rfc3339, with_txn, Store};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Invalid credit amount: {amount}")]
    InvalidAmount { amount: i64 },

    #[error("Insufficient balance: have {balance}, need {needed}")]
    InsufficientBalance { balance: i64, needed: i64 },

    #[error("Database error: {0}")]
    Database(String),
}

impl From<rusqlite::Error> for LedgerError {
    fn from(e: rusqlite::Error) -> Self {
        LedgerError::Database(e.to_string())
    }
}

/// Payment confirmation delivered by the checkout collaborator. May arrive
/// more than once for the same purchase; `external_ref` keys idempotency.
#[derive(Debug, Clone)]
pub struct PaymentEvent {
    pub external_ref: String,
    pub user_id: String,
    pub credits: i64,
    pub description: String,
}

#[derive(Clone)]
pub struct CreditLedger {
    store: Store,
    config: CreditConfig,
}

impl CreditLedger {
    pub fn new(store: Store, config: CreditConfig) -> Self {
        Self { store, config }
    }

    /// Current balance; creates the account on first access.
    pub fn get_balance(&self, user_id: &str) -> Result<i64, LedgerError> {
        let conn = self.store.lock();
        with_txn(&conn, |c| ensure_account(c, &self.config, user_id))
    }

    /// Append a positive-amount transaction and raise the balance.
    ///
    /// When `external_ref` matches an already-applied transaction the call is
    /// an idempotent retry: nothing is written and the original resulting
    /// balance is returned.
    pub fn credit(
        &self,
        user_id: &str,
        amount: i64,
        kind: TransactionKind,
        description: &str,
        external_ref: Option<&str>,
    ) -> Result<i64, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount { amount });
        }
        let conn = self.store.lock();
        with_txn(&conn, |c| {
            credit_inner(c, &self.config, user_id, amount, kind, description, external_ref)
        })
    }

    /// Lower the balance by `amount`, rejecting the debit outright if the
    /// account does not hold enough. The check and the decrement are one
    /// conditional UPDATE, so racing debits cannot drive the balance negative.
    pub fn debit(&self, user_id: &str, amount: i64, description: &str) -> Result<i64, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount { amount });
        }
        let conn = self.store.lock();
        with_txn(&conn, |c| debit_inner(c, &self.config, user_id, amount, description))
    }

    /// Administrative override. Logged as a bonus transaction carrying the
    /// delta to the target, so the running-sum invariant survives.
    pub fn set_balance(&self, user_id: &str, target: i64) -> Result<i64, LedgerError> {
        if target < 0 {
            return Err(LedgerError::InvalidAmount { amount: target });
        }
        let conn = self.store.lock();
        with_txn(&conn, |c| {
            let balance = ensure_account(c, &self.config, user_id)?;
            let delta = target - balance;
            if delta == 0 {
                return Ok(balance);
            }
            c.execute(
                "UPDATE credit_accounts SET balance = ?1, updated_at = ?2 WHERE user_id = ?3",
                params![target, now_rfc3339(), user_id],
            )?;
            append_transaction(
                c,
                user_id,
                delta,
                TransactionKind::Bonus,
                "balance override",
                target,
                None,
            )?;
            Ok(target)
        })
    }

    /// Apply one payment confirmation. Safe to call twice for the same event.
    pub fn apply_payment(&self, event: &PaymentEvent) -> Result<i64, LedgerError> {
        self.credit(
            &event.user_id,
            event.credits,
            TransactionKind::Purchase,
            &event.description,
            Some(&event.external_ref),
        )
    }

    /// Most recent transactions, newest first.
    pub fn recent_transactions(
        &self,
        user_id: &str,
        limit: u32,
    ) -> Result<Vec<CreditTransaction>, LedgerError> {
        let conn = self.store.lock();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, amount, kind, description, balance_after, external_ref, created_at
             FROM credit_transactions WHERE user_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![user_id, limit], row_to_transaction)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Running sum of the transaction log (audit support).
    pub fn transaction_sum(&self, user_id: &str) -> Result<i64, LedgerError> {
        let conn = self.store.lock();
        let sum: i64 = conn.query_row(
            "SELECT COALESCE(SUM(amount), 0) FROM credit_transactions WHERE user_id = ?1",
            [user_id],
            |row| row.get(0),
        )?;
        Ok(sum)
    }

    /// Credit within a transaction someone else already opened (voucher
    /// redemption joins its ledger write to the voucher counter update).
    pub(crate) fn credit_with_conn(
        &self,
        conn: &Connection,
        user_id: &str,
        amount: i64,
        kind: TransactionKind,
        description: &str,
    ) -> Result<i64, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount { amount });
        }
        credit_inner(conn, &self.config, user_id, amount, kind, description, None)
    }
}

fn ensure_account(
    conn: &Connection,
    config: &CreditConfig,
    user_id: &str,
) -> Result<i64, LedgerError> {
    let existing: Option<i64> = conn
        .query_row(
            "SELECT balance FROM credit_accounts WHERE user_id = ?1",
            [user_id],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(balance) = existing {
        return Ok(balance);
    }

    let is_admin = config.admin_principal.as_deref() == Some(user_id);
    let seed = if is_admin {
        config.admin_bonus
    } else {
        config.signup_bonus
    }
    .max(0);

    conn.execute(
        "INSERT INTO credit_accounts (user_id, balance, updated_at) VALUES (?1, ?2, ?3)",
        params![user_id, seed, now_rfc3339()],
    )?;
    if seed > 0 {
        let description = if is_admin { "admin grant" } else { "signup bonus" };
        append_transaction(
            conn,
            user_id,
            seed,
            TransactionKind::Bonus,
            description,
            seed,
            None,
        )?;
    }
    Ok(seed)
}

fn credit_inner(
    conn: &Connection,
    config: &CreditConfig,
    user_id: &str,
    amount: i64,
    kind: TransactionKind,
    description: &str,
    external_ref: Option<&str>,
) -> Result<i64, LedgerError> {
    if let Some(external_ref) = external_ref {
        let prior: Option<i64> = conn
            .query_row(
                "SELECT balance_after FROM credit_transactions WHERE external_ref = ?1",
                [external_ref],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(balance_after) = prior {
            // Duplicate delivery; the original outcome stands.
            return Ok(balance_after);
        }
    }

    let balance = ensure_account(conn, config, user_id)?;
    let new_balance = balance + amount;
    conn.execute(
        "UPDATE credit_accounts SET balance = ?1, updated_at = ?2 WHERE user_id = ?3",
        params![new_balance, now_rfc3339(), user_id],
    )?;
    append_transaction(conn, user_id, amount, kind, description, new_balance, external_ref)?;
    Ok(new_balance)
}

fn debit_inner(
    conn: &Connection,
    config: &CreditConfig,
    user_id: &str,
    amount: i64,
    description: &str,
) -> Result<i64, LedgerError> {
    let balance = ensure_account(conn, config, user_id)?;

    // Balance check and decrement in one statement; 0 changed rows means the
    // account cannot cover the debit.
    let changed = conn.execute(
        "UPDATE credit_accounts SET balance = balance - ?1, updated_at = ?2
         WHERE user_id = ?3 AND balance >= ?1",
        params![amount, now_rfc3339(), user_id],
    )?;
    if changed == 0 {
        return Err(LedgerError::InsufficientBalance {
            balance,
            needed: amount,
        });
    }

    let new_balance = balance - amount;
    append_transaction(
        conn,
        user_id,
        -amount,
        TransactionKind::Deduction,
        description,
        new_balance,
        None,
    )?;
    Ok(new_balance)
}

fn append_transaction(
    conn: &Connection,
    user_id: &str,
    amount: i64,
    kind: TransactionKind,
    description: &str,
    balance_after: i64,
    external_ref: Option<&str>,
) -> Result<(), LedgerError> {
    conn.execute(
        "INSERT INTO credit_transactions
         (user_id, amount, kind, description, balance_after, external_ref, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            user_id,
            amount,
            kind.as_str(),
            description,
            balance_after,
            external_ref,
            now_rfc3339(),
        ],
    )?;
    Ok(())
}

fn row_to_transaction(row: &rusqlite::Row<'_>) -> rusqlite::Result<CreditTransaction> {
    let kind: String = row.get(3)?;
    let created_at: String = row.get(7)?;
    Ok(CreditTransaction {
        id: row.get(0)?,
        user_id: row.get(1)?,
        amount: row.get(2)?,
        kind: TransactionKind::parse(&kind).unwrap_or(TransactionKind::Bonus),
        description: row.get(4)?,
        balance_after: row.get(5)?,
        external_ref: row.get(6)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> CreditLedger {
        let store = Store::memory().unwrap();
        CreditLedger::new(
            store,
            CreditConfig {
                signup_bonus: 0,
                admin_principal: Some("admin@axlens.dev".to_string()),
                admin_bonus: 100,
            },
        )
    }

    #[test]
    fn test_lazy_account_starts_at_configured_bonus() {
        let store = Store::memory().unwrap();
        let ledger = CreditLedger::new(
            store,
            CreditConfig {
                signup_bonus: 3,
                admin_principal: None,
                admin_bonus: 100,
            },
        );
        assert_eq!(ledger.get_balance("u1").unwrap(), 3);
        // Seeding is logged, so the running-sum invariant holds from birth
        assert_eq!(ledger.transaction_sum("u1").unwrap(), 3);
        // Second read does not re-seed
        assert_eq!(ledger.get_balance("u1").unwrap(), 3);
        assert_eq!(ledger.transaction_sum("u1").unwrap(), 3);
    }

    #[test]
    fn test_admin_principal_gets_distinguished_bonus() {
        let ledger = ledger();
        assert_eq!(ledger.get_balance("admin@axlens.dev").unwrap(), 100);
        assert_eq!(ledger.get_balance("someone-else").unwrap(), 0);
    }

    #[test]
    fn test_credit_and_debit_keep_sum_invariant() {
        let ledger = ledger();
        ledger
            .credit("u1", 10, TransactionKind::Purchase, "pack", Some("pay_1"))
            .unwrap();
        ledger.debit("u1", 4, "panel run").unwrap();
        ledger
            .credit("u1", 2, TransactionKind::Refund, "refund", None)
            .unwrap();

        let balance = ledger.get_balance("u1").unwrap();
        assert_eq!(balance, 8);
        assert_eq!(ledger.transaction_sum("u1").unwrap(), balance);
    }

    #[test]
    fn test_credit_rejects_non_positive_amount() {
        let ledger = ledger();
        for amount in [0, -5] {
            let err = ledger
                .credit("u1", amount, TransactionKind::Purchase, "x", None)
                .unwrap_err();
            assert_eq!(err, LedgerError::InvalidAmount { amount });
        }
    }

    #[test]
    fn test_debit_fails_on_insufficient_balance() {
        let ledger = ledger();
        ledger
            .credit("u1", 2, TransactionKind::Purchase, "pack", None)
            .unwrap();
        let err = ledger.debit("u1", 3, "panel run").unwrap_err();
        assert_eq!(
            err,
            LedgerError::InsufficientBalance {
                balance: 2,
                needed: 3
            }
        );
        // Failed debit writes nothing
        assert_eq!(ledger.get_balance("u1").unwrap(), 2);
        assert_eq!(ledger.transaction_sum("u1").unwrap(), 2);
    }

    #[test]
    fn test_duplicate_payment_event_credits_once() {
        let ledger = ledger();
        let event = PaymentEvent {
            external_ref: "pi_123".to_string(),
            user_id: "u1".to_string(),
            credits: 50,
            description: "starter pack".to_string(),
        };
        let first = ledger.apply_payment(&event).unwrap();
        let second = ledger.apply_payment(&event).unwrap();
        assert_eq!(first, 50);
        assert_eq!(second, 50, "retry returns the original resulting balance");
        assert_eq!(ledger.get_balance("u1").unwrap(), 50);
        assert_eq!(ledger.transaction_sum("u1").unwrap(), 50);
        assert_eq!(ledger.recent_transactions("u1", 10).unwrap().len(), 1);
    }

    #[test]
    fn test_set_balance_records_delta_not_target() {
        let ledger = ledger();
        ledger
            .credit("u1", 10, TransactionKind::Purchase, "pack", None)
            .unwrap();
        ledger.set_balance("u1", 25).unwrap();

        assert_eq!(ledger.get_balance("u1").unwrap(), 25);
        assert_eq!(ledger.transaction_sum("u1").unwrap(), 25);

        let txns = ledger.recent_transactions("u1", 10).unwrap();
        assert_eq!(txns[0].amount, 15, "override logs the delta");
        assert_eq!(txns[0].kind, TransactionKind::Bonus);

        // Overriding down also works and stays consistent
        ledger.set_balance("u1", 5).unwrap();
        assert_eq!(ledger.get_balance("u1").unwrap(), 5);
        assert_eq!(ledger.transaction_sum("u1").unwrap(), 5);
    }

    #[test]
    fn test_set_balance_rejects_negative_target() {
        let ledger = ledger();
        let err = ledger.set_balance("u1", -1).unwrap_err();
        assert_eq!(err, LedgerError::InvalidAmount { amount: -1 });
    }

    #[test]
    fn test_recent_transactions_newest_first() {
        let ledger = ledger();
        ledger
            .credit("u1", 5, TransactionKind::Purchase, "first", None)
            .unwrap();
        ledger.debit("u1", 1, "second").unwrap();

        let txns = ledger.recent_transactions("u1", 10).unwrap();
        assert_eq!(txns.len(), 2);
        assert_eq!(txns[0].description, "second");
        assert_eq!(txns[0].amount, -1);
        assert_eq!(txns[1].description, "first");
    }
}
