//! Council aggregation: merges completed panelist opinions into one
//! consensus record per evaluation.
//!
//! The formula (median + spread classification) is a policy choice kept
//! behind [`consensus`]; persistence and preconditions live in
//! [`CouncilAggregator`].

use crate::config::PanelConfig;
use crate::model::{Agreement, AxOpinion, CouncilResult, ModelScore};
use crate::panel::{all_terminal_inner, completed_opinions_inner, PanelError};
use crate::storage::{now_rfc3339, parse_rfc3339, with_txn, Store};
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CouncilError {
    #[error("Panelists still running for evaluation {evaluation_id}")]
    Incomplete { evaluation_id: String },

    #[error("No completed panelists for evaluation {evaluation_id}")]
    NoQuorum { evaluation_id: String },

    #[error("Database error: {0}")]
    Database(String),
}

impl From<rusqlite::Error> for CouncilError {
    fn from(e: rusqlite::Error) -> Self {
        CouncilError::Database(e.to_string())
    }
}

impl From<PanelError> for CouncilError {
    fn from(e: PanelError) -> Self {
        CouncilError::Database(e.to_string())
    }
}

/// Pure consensus over a non-empty completed snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Consensus {
    pub score: f64,
    pub anps: f64,
    pub recommendations: Vec<String>,
    pub agreement: Agreement,
}

/// Median with the even-count tie resolved by averaging the middle pair;
/// recommendations deduplicated case-insensitively in first-seen order;
/// agreement classified from the score spread.
pub fn consensus(opinions: &[(String, AxOpinion)]) -> Consensus {
    let scores: Vec<i64> = opinions.iter().map(|(_, o)| i64::from(o.score)).collect();
    let anps: Vec<i64> = opinions.iter().map(|(_, o)| i64::from(o.anps)).collect();

    let mut recommendations: Vec<String> = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for (_, opinion) in opinions {
        for rec in &opinion.recommendations {
            let trimmed = rec.trim();
            if trimmed.is_empty() {
                continue;
            }
            if seen.insert(trimmed.to_lowercase()) {
                recommendations.push(trimmed.to_string());
            }
        }
    }

    let spread = scores.iter().max().unwrap_or(&0) - scores.iter().min().unwrap_or(&0);
    let agreement = if spread <= 10 {
        Agreement::High
    } else if spread <= 25 {
        Agreement::Medium
    } else {
        Agreement::Low
    };

    Consensus {
        score: median(&scores),
        anps: median(&anps),
        recommendations,
        agreement,
    }
}

fn median(values: &[i64]) -> f64 {
    debug_assert!(!values.is_empty());
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2] as f64
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) as f64 / 2.0
    }
}

pub struct CouncilAggregator {
    store: Store,
    config: PanelConfig,
}

impl CouncilAggregator {
    pub fn new(store: Store, config: PanelConfig) -> Self {
        Self { store, config }
    }

    /// Compute and persist the consensus for one evaluation.
    ///
    /// Re-invocation over an unchanged completed snapshot returns the stored
    /// row untouched; a changed snapshot (more panelists finished) recomputes
    /// and overwrites. The overwrite is the whole concurrency contract.
    pub fn aggregate(&self, evaluation_id: &str) -> Result<CouncilResult, CouncilError> {
        let conn = self.store.lock();
        with_txn(&conn, |c| {
            if !all_terminal_inner(c, &self.config, evaluation_id)? {
                return Err(CouncilError::Incomplete {
                    evaluation_id: evaluation_id.to_string(),
                });
            }
            let opinions = completed_opinions_inner(c, evaluation_id)?;
            if opinions.is_empty() {
                return Err(CouncilError::NoQuorum {
                    evaluation_id: evaluation_id.to_string(),
                });
            }

            let snapshot: Vec<ModelScore> = opinions
                .iter()
                .map(|(model_id, o)| ModelScore {
                    model_id: model_id.clone(),
                    score: o.score,
                    anps: o.anps,
                })
                .collect();
            let snapshot_json = serde_json::to_string(&snapshot)
                .map_err(|e| CouncilError::Database(e.to_string()))?;

            if let Some(existing) = fetch_result(c, evaluation_id)? {
                let existing_snapshot = serde_json::to_string(&existing.model_scores)
                    .map_err(|e| CouncilError::Database(e.to_string()))?;
                if existing_snapshot == snapshot_json {
                    // Same inputs, same output, same timestamp.
                    return Ok(existing);
                }
            }

            let consensus = consensus(&opinions);
            let recommendations_json = serde_json::to_string(&consensus.recommendations)
                .map_err(|e| CouncilError::Database(e.to_string()))?;

            c.execute(
                "INSERT INTO council_results
                 (evaluation_id, score, anps, recommendations_json, model_scores_json,
                  agreement, computed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(evaluation_id) DO UPDATE SET
                     score = excluded.score,
                     anps = excluded.anps,
                     recommendations_json = excluded.recommendations_json,
                     model_scores_json = excluded.model_scores_json,
                     agreement = excluded.agreement,
                     computed_at = excluded.computed_at",
                params![
                    evaluation_id,
                    consensus.score,
                    consensus.anps,
                    recommendations_json,
                    snapshot_json,
                    consensus.agreement.as_str(),
                    now_rfc3339(),
                ],
            )?;

            fetch_result(c, evaluation_id)?.ok_or_else(|| {
                CouncilError::Database("council row vanished mid-update".to_string())
            })
        })
    }

    pub fn get(&self, evaluation_id: &str) -> Result<Option<CouncilResult>, CouncilError> {
        let conn = self.store.lock();
        fetch_result(&conn, evaluation_id)
    }
}

fn fetch_result(
    conn: &Connection,
    evaluation_id: &str,
) -> Result<Option<CouncilResult>, CouncilError> {
    let row = conn
        .query_row(
            "SELECT score, anps, recommendations_json, model_scores_json, agreement, computed_at
             FROM council_results WHERE evaluation_id = ?1",
            [evaluation_id],
            |row| {
                Ok((
                    row.get::<_, f64>(0)?,
                    row.get::<_, f64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            },
        )
        .optional()?;

    let Some((score, anps, recommendations_json, model_scores_json, agreement, computed_at)) = row
    else {
        return Ok(None);
    };
    Ok(Some(CouncilResult {
        evaluation_id: evaluation_id.to_string(),
        score,
        anps,
        recommendations: serde_json::from_str(&recommendations_json)
            .map_err(|e| CouncilError::Database(format!("corrupt recommendations: {e}")))?,
        model_scores: serde_json::from_str(&model_scores_json)
            .map_err(|e| CouncilError::Database(format!("corrupt model scores: {e}")))?,
        agreement: Agreement::parse(&agreement)
            .ok_or_else(|| CouncilError::Database(format!("corrupt agreement: {agreement}")))?,
        computed_at: parse_rfc3339(&computed_at)
            .ok_or_else(|| CouncilError::Database("corrupt computed_at".to_string()))?,
    }))
}
