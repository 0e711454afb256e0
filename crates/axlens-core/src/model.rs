//! Shared domain types persisted by the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status shared by evaluation jobs and per-model panel rows.
///
/// `pending → processing → {completed, failed}`; `pending → failed` is also
/// allowed. Terminal states are never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Processing => "processing",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RunStatus::Pending),
            "processing" => Some(RunStatus::Processing),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

/// Target-audience descriptor attached to an evaluation job.
///
/// All fields are optional individually; the job API rejects a submission
/// with no audience at all.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetAudience {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age_range: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub occupation: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interests: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// One evaluation job row. Mutated only through status transitions and the
/// one-shot ownership claim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationJob {
    pub job_id: String,
    pub subject_url: String,
    pub audience: TargetAudience,
    pub user_id: Option<String>,
    pub status: RunStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Structured opinion returned by one panelist model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxOpinion {
    /// Agent-experience score, 0..=100.
    pub score: u8,
    /// NPS-style sentiment, conventionally -100..=100.
    pub anps: i32,
    #[serde(default)]
    pub factors: Vec<FactorScore>,
    #[serde(default)]
    pub accessibility: String,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactorScore {
    pub name: String,
    pub score: u8,
}

/// One (evaluation, model) panel row. Upserted on retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEvaluation {
    pub evaluation_id: String,
    pub model_id: String,
    pub status: RunStatus,
    pub opinion: Option<AxOpinion>,
    /// Raw provider text, kept for audit.
    pub raw_response: Option<String>,
    pub error: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ModelEvaluation {
    /// Synthetic row returned before any start() has touched the pair.
    pub fn pending(evaluation_id: &str, model_id: &str) -> Self {
        Self {
            evaluation_id: evaluation_id.to_string(),
            model_id: model_id.to_string(),
            status: RunStatus::Pending,
            opinion: None,
            raw_response: None,
            error: None,
            completed_at: None,
        }
    }
}

/// Spread-based agreement classification over completed panelist scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Agreement {
    High,
    Medium,
    Low,
}

impl Agreement {
    pub fn as_str(&self) -> &'static str {
        match self {
            Agreement::High => "high",
            Agreement::Medium => "medium",
            Agreement::Low => "low",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "high" => Some(Agreement::High),
            "medium" => Some(Agreement::Medium),
            "low" => Some(Agreement::Low),
            _ => None,
        }
    }
}

/// Per-model score snapshot captured inside a council result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelScore {
    pub model_id: String,
    pub score: u8,
    pub anps: i32,
}

/// Consensus over all completed panelists for one evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CouncilResult {
    pub evaluation_id: String,
    pub score: f64,
    pub anps: f64,
    pub recommendations: Vec<String>,
    pub model_scores: Vec<ModelScore>,
    pub agreement: Agreement,
    pub computed_at: DateTime<Utc>,
}

/// Transaction log entry kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Purchase,
    Bonus,
    Deduction,
    Refund,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Purchase => "purchase",
            TransactionKind::Bonus => "bonus",
            TransactionKind::Deduction => "deduction",
            TransactionKind::Refund => "refund",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "purchase" => Some(TransactionKind::Purchase),
            "bonus" => Some(TransactionKind::Bonus),
            "deduction" => Some(TransactionKind::Deduction),
            "refund" => Some(TransactionKind::Refund),
            _ => None,
        }
    }
}

/// Append-only ledger entry. `balance_after` snapshots the balance the
/// account held immediately after this entry was applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditTransaction {
    pub id: i64,
    pub user_id: String,
    pub amount: i64,
    pub kind: TransactionKind,
    pub description: String,
    pub balance_after: i64,
    pub external_ref: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_status_round_trips() {
        for s in [
            RunStatus::Pending,
            RunStatus::Processing,
            RunStatus::Completed,
            RunStatus::Failed,
        ] {
            assert_eq!(RunStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(RunStatus::parse("bogus"), None);
    }

    #[test]
    fn terminal_states() {
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Processing.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
    }
}
