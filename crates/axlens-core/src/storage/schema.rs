//! SQLite schema for the evaluation and ledger stores.
//!
//! Tables:
//! - `evaluation_jobs`: one row per scrape+analysis job
//! - `model_evaluations`: one row per (evaluation, model) panelist
//! - `council_results`: one consensus row per evaluation
//! - `credit_accounts` / `credit_transactions`: balances + append-only log
//! - `discount_codes` / `referral_codes` / `vouchers` and their usage tables

/// DDL for all core tables.
///
/// Schema version: 1
pub const CORE_SCHEMA: &str = r#"
-- Evaluation jobs (status written only by orchestrator/worker callbacks)
CREATE TABLE IF NOT EXISTS evaluation_jobs (
    job_id        TEXT PRIMARY KEY,
    subject_url   TEXT NOT NULL,
    audience_json TEXT NOT NULL,
    user_id       TEXT,
    status        TEXT NOT NULL DEFAULT 'pending',
    result_json   TEXT,
    error         TEXT,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL,
    completed_at  TEXT
);

-- Panelist rows, replaced on retry for the same (evaluation, model) pair
CREATE TABLE IF NOT EXISTS model_evaluations (
    evaluation_id TEXT NOT NULL REFERENCES evaluation_jobs(job_id),
    model_id      TEXT NOT NULL,
    status        TEXT NOT NULL,
    opinion_json  TEXT,
    raw_response  TEXT,
    error         TEXT,
    started_at    TEXT NOT NULL,
    completed_at  TEXT,
    PRIMARY KEY (evaluation_id, model_id)
);

-- Consensus, overwritten when recomputed over a different panelist snapshot
CREATE TABLE IF NOT EXISTS council_results (
    evaluation_id        TEXT PRIMARY KEY REFERENCES evaluation_jobs(job_id),
    score                REAL NOT NULL,
    anps                 REAL NOT NULL,
    recommendations_json TEXT NOT NULL,
    model_scores_json    TEXT NOT NULL,
    agreement            TEXT NOT NULL,
    computed_at          TEXT NOT NULL
);

-- Credit balances (non-negative by construction and by constraint)
CREATE TABLE IF NOT EXISTS credit_accounts (
    user_id    TEXT PRIMARY KEY,
    balance    INTEGER NOT NULL DEFAULT 0 CHECK (balance >= 0),
    updated_at TEXT NOT NULL
);

-- Append-only transaction log; sum(amount) per user equals the balance
CREATE TABLE IF NOT EXISTS credit_transactions (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id       TEXT NOT NULL,
    amount        INTEGER NOT NULL,
    kind          TEXT NOT NULL,
    description   TEXT NOT NULL,
    balance_after INTEGER NOT NULL,
    external_ref  TEXT UNIQUE,
    created_at    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS discount_codes (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    code         TEXT NOT NULL UNIQUE,
    value_kind   TEXT NOT NULL,
    value        INTEGER NOT NULL,
    min_purchase INTEGER,
    max_uses     INTEGER,
    use_count    INTEGER NOT NULL DEFAULT 0,
    expires_at   TEXT,
    active       INTEGER NOT NULL DEFAULT 1,
    created_at   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS discount_usages (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    code_id       INTEGER NOT NULL REFERENCES discount_codes(id),
    user_id       TEXT NOT NULL,
    amount_before INTEGER NOT NULL,
    amount_after  INTEGER NOT NULL,
    payment_ref   TEXT UNIQUE,
    created_at    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS referral_codes (
    id                 INTEGER PRIMARY KEY AUTOINCREMENT,
    code               TEXT NOT NULL UNIQUE,
    owner_user_id      TEXT NOT NULL,
    discount_percent   INTEGER NOT NULL,
    commission_percent INTEGER NOT NULL,
    max_uses           INTEGER,
    use_count          INTEGER NOT NULL DEFAULT 0,
    expires_at         TEXT,
    active             INTEGER NOT NULL DEFAULT 1,
    created_at         TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS referral_usages (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    code_id       INTEGER NOT NULL REFERENCES referral_codes(id),
    user_id       TEXT NOT NULL,
    amount_before INTEGER NOT NULL,
    amount_after  INTEGER NOT NULL,
    commission    INTEGER NOT NULL,
    payment_ref   TEXT UNIQUE,
    created_at    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS vouchers (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    code       TEXT NOT NULL UNIQUE,
    credits    INTEGER NOT NULL,
    max_uses   INTEGER,
    use_count  INTEGER NOT NULL DEFAULT 0,
    expires_at TEXT,
    active     INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL
);

-- One redemption per (voucher, user); the constraint is the re-redemption guard
CREATE TABLE IF NOT EXISTS voucher_redemptions (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    voucher_id INTEGER NOT NULL REFERENCES vouchers(id),
    user_id    TEXT NOT NULL,
    credits    INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE(voucher_id, user_id)
);

-- Indexes for performance
CREATE INDEX IF NOT EXISTS idx_model_evaluations_status
    ON model_evaluations(evaluation_id, status);
CREATE INDEX IF NOT EXISTS idx_credit_transactions_user
    ON credit_transactions(user_id);
CREATE INDEX IF NOT EXISTS idx_voucher_redemptions_user
    ON voucher_redemptions(user_id);
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_schema_is_valid_sql() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(CORE_SCHEMA).unwrap();
    }

    #[test]
    fn test_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(CORE_SCHEMA).unwrap();
        conn.execute_batch(CORE_SCHEMA).unwrap();
    }

    #[test]
    fn test_balance_check_constraint_rejects_negative() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(CORE_SCHEMA).unwrap();
        let err = conn.execute(
            "INSERT INTO credit_accounts (user_id, balance, updated_at) VALUES ('u', -1, 't')",
            [],
        );
        assert!(err.is_err());
    }
}
