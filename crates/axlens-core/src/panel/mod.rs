//! AX panel coordinator: one state machine per (evaluation, model) pair.
//!
//! Each pair moves `pending → processing → {completed, failed}` and is
//! upserted on retry. The store mutex is never held across the provider
//! call; the terminal write is conditional on the row still being
//! `processing`, so a late result that lost its slot is discarded.

pub mod opinion;

use crate::config::PanelConfig;
use crate::ledger::CreditLedger;
use crate::model::{AxOpinion, ModelEvaluation, RunStatus, TargetAudience};
use crate::providers::OpinionClient;
use crate::storage::{now_rfc3339, parse_rfc3339, with_txn, Store};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PanelError {
    #[error("Evaluation not found: {evaluation_id}")]
    EvaluationNotFound { evaluation_id: String },

    #[error("Panel model not found or disabled: {model_id}")]
    ModelNotFound { model_id: String },

    #[error("Evaluation {evaluation_id} already in progress for model {model_id}")]
    AlreadyInProgress {
        evaluation_id: String,
        model_id: String,
    },

    #[error("Database error: {0}")]
    Database(String),
}

impl From<rusqlite::Error> for PanelError {
    fn from(e: rusqlite::Error) -> Self {
        PanelError::Database(e.to_string())
    }
}

pub struct PanelCoordinator {
    store: Store,
    config: PanelConfig,
    credits: CreditLedger,
    client: Arc<dyn OpinionClient>,
}

impl PanelCoordinator {
    pub fn new(
        store: Store,
        config: PanelConfig,
        credits: CreditLedger,
        client: Arc<dyn OpinionClient>,
    ) -> Self {
        Self {
            store,
            config,
            credits,
            client,
        }
    }

    /// Run one panelist against an evaluation. Claims the pair, calls the
    /// provider, and lands a terminal row either way. A completed opinion for
    /// a signed-in owner meters one credit; a metering failure is logged and
    /// the opinion stands.
    pub async fn start(
        &self,
        evaluation_id: &str,
        model_id: &str,
    ) -> Result<ModelEvaluation, PanelError> {
        let model_cfg = self
            .config
            .model(model_id)
            .cloned()
            .ok_or_else(|| PanelError::ModelNotFound {
                model_id: model_id.to_string(),
            })?;

        // Claim the pair. The lock goes away before the provider call.
        let (subject_url, audience_json, owner) = {
            let conn = self.store.lock();
            with_txn(&conn, |c| {
                let job: Option<(String, String, Option<String>)> = c
                    .query_row(
                        "SELECT subject_url, audience_json, user_id
                         FROM evaluation_jobs WHERE job_id = ?1",
                        [evaluation_id],
                        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                    )
                    .optional()?;
                let job = job.ok_or_else(|| PanelError::EvaluationNotFound {
                    evaluation_id: evaluation_id.to_string(),
                })?;

                let current: Option<String> = c
                    .query_row(
                        "SELECT status FROM model_evaluations
                         WHERE evaluation_id = ?1 AND model_id = ?2",
                        params![evaluation_id, model_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                if current.as_deref() == Some("processing") {
                    return Err(PanelError::AlreadyInProgress {
                        evaluation_id: evaluation_id.to_string(),
                        model_id: model_id.to_string(),
                    });
                }

                // Replace-on-conflict keyed by the pair: a retry wipes the
                // prior attempt's payload.
                c.execute(
                    "INSERT INTO model_evaluations (evaluation_id, model_id, status, started_at)
                     VALUES (?1, ?2, 'processing', ?3)
                     ON CONFLICT(evaluation_id, model_id) DO UPDATE SET
                         status = 'processing',
                         opinion_json = NULL,
                         raw_response = NULL,
                         error = NULL,
                         started_at = excluded.started_at,
                         completed_at = NULL",
                    params![evaluation_id, model_id, now_rfc3339()],
                )?;
                Ok(job)
            })?
        };

        let audience: TargetAudience = serde_json::from_str(&audience_json)
            .map_err(|e| PanelError::Database(format!("corrupt audience payload: {e}")))?;
        let prompt = opinion::build_subject_prompt(&subject_url, &audience);
        let timeout = Duration::from_secs(self.config.provider_timeout_secs);

        let outcome = tokio::time::timeout(
            timeout,
            self.client
                .opinion(&model_cfg.model, &prompt, self.config.max_output_tokens),
        )
        .await;

        match outcome {
            Ok(Ok(resp)) => match opinion::parse_opinion(&resp.text) {
                Ok(parsed) => {
                    let row =
                        self.mark_completed(evaluation_id, model_id, &parsed, &resp.text)?;
                    if row.status == RunStatus::Completed {
                        if let Some(user) = owner {
                            if let Err(e) = self.credits.debit(
                                &user,
                                1,
                                &format!("AX panel opinion ({model_id})"),
                            ) {
                                tracing::warn!(
                                    user_id = %user,
                                    model_id = %model_id,
                                    error = %e,
                                    "completed panel opinion could not be metered"
                                );
                            }
                        }
                    }
                    Ok(row)
                }
                Err(e) => {
                    self.mark_failed(evaluation_id, model_id, &format!("malformed opinion: {e}"))
                }
            },
            Ok(Err(e)) => self.mark_failed(
                evaluation_id,
                model_id,
                &format!("opinion provider error: {e}"),
            ),
            Err(_) => self.mark_failed(
                evaluation_id,
                model_id,
                &format!(
                    "opinion provider timed out after {}s",
                    self.config.provider_timeout_secs
                ),
            ),
        }
    }

    /// Pure read. A pair nobody has started yet reads as a synthetic
    /// `pending` row, not an error.
    pub fn get_status(
        &self,
        evaluation_id: &str,
        model_id: &str,
    ) -> Result<ModelEvaluation, PanelError> {
        let conn = self.store.lock();
        match fetch_pair(&conn, evaluation_id, model_id)? {
            Some(row) => Ok(row),
            None => Ok(ModelEvaluation::pending(evaluation_id, model_id)),
        }
    }

    /// True iff every enabled model has reached a terminal state for this
    /// evaluation. The council's trigger precondition.
    pub fn all_terminal(&self, evaluation_id: &str) -> Result<bool, PanelError> {
        let conn = self.store.lock();
        all_terminal_inner(&conn, &self.config, evaluation_id)
    }

    /// Fail any pair stuck in `processing` beyond the configured horizon.
    /// Returns the number of rows released.
    pub fn release_stale(&self) -> Result<usize, PanelError> {
        let cutoff =
            chrono::Utc::now() - chrono::Duration::seconds(self.config.stale_after_secs as i64);
        let conn = self.store.lock();
        let changed = conn.execute(
            "UPDATE model_evaluations
             SET status = 'failed', error = 'processing timed out', completed_at = ?1
             WHERE status = 'processing' AND started_at < ?2",
            params![now_rfc3339(), cutoff.to_rfc3339()],
        )?;
        Ok(changed)
    }

    fn mark_completed(
        &self,
        evaluation_id: &str,
        model_id: &str,
        parsed: &AxOpinion,
        raw: &str,
    ) -> Result<ModelEvaluation, PanelError> {
        let opinion_json = serde_json::to_string(parsed)
            .map_err(|e| PanelError::Database(format!("unserializable opinion: {e}")))?;
        let conn = self.store.lock();
        with_txn(&conn, |c| {
            // Conditional on still holding the slot; a pair already released
            // as failed keeps its terminal state and the late result is dropped.
            let changed = c.execute(
                "UPDATE model_evaluations
                 SET status = 'completed', opinion_json = ?1, raw_response = ?2,
                     error = NULL, completed_at = ?3
                 WHERE evaluation_id = ?4 AND model_id = ?5 AND status = 'processing'",
                params![opinion_json, raw, now_rfc3339(), evaluation_id, model_id],
            )?;
            if changed == 0 {
                tracing::debug!(
                    evaluation_id,
                    model_id,
                    "late opinion discarded; pair already terminal"
                );
            }
            fetch_pair(c, evaluation_id, model_id)?.ok_or_else(|| PanelError::Database(
                "panel row vanished mid-update".to_string(),
            ))
        })
    }

    fn mark_failed(
        &self,
        evaluation_id: &str,
        model_id: &str,
        error: &str,
    ) -> Result<ModelEvaluation, PanelError> {
        let conn = self.store.lock();
        with_txn(&conn, |c| {
            c.execute(
                "UPDATE model_evaluations
                 SET status = 'failed', error = ?1, completed_at = ?2
                 WHERE evaluation_id = ?3 AND model_id = ?4 AND status = 'processing'",
                params![error, now_rfc3339(), evaluation_id, model_id],
            )?;
            fetch_pair(c, evaluation_id, model_id)?.ok_or_else(|| PanelError::Database(
                "panel row vanished mid-update".to_string(),
            ))
        })
    }
}

pub(crate) fn all_terminal_inner(
    conn: &Connection,
    config: &PanelConfig,
    evaluation_id: &str,
) -> Result<bool, PanelError> {
    for model in config.enabled_models() {
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM model_evaluations
                 WHERE evaluation_id = ?1 AND model_id = ?2",
                params![evaluation_id, model.id],
                |row| row.get(0),
            )
            .optional()?;
        let terminal = status
            .as_deref()
            .and_then(RunStatus::parse)
            .is_some_and(|s| s.is_terminal());
        if !terminal {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Completed opinions for one evaluation, ordered by model id so downstream
/// consumers see a deterministic snapshot.
pub(crate) fn completed_opinions_inner(
    conn: &Connection,
    evaluation_id: &str,
) -> Result<Vec<(String, AxOpinion)>, PanelError> {
    let mut stmt = conn.prepare(
        "SELECT model_id, opinion_json FROM model_evaluations
         WHERE evaluation_id = ?1 AND status = 'completed' AND opinion_json IS NOT NULL
         ORDER BY model_id",
    )?;
    let rows = stmt.query_map([evaluation_id], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    let mut out = Vec::new();
    for r in rows {
        let (model_id, raw) = r?;
        let parsed: AxOpinion = serde_json::from_str(&raw)
            .map_err(|e| PanelError::Database(format!("corrupt opinion payload: {e}")))?;
        out.push((model_id, parsed));
    }
    Ok(out)
}

fn fetch_pair(
    conn: &Connection,
    evaluation_id: &str,
    model_id: &str,
) -> Result<Option<ModelEvaluation>, PanelError> {
    let row = conn
        .query_row(
            "SELECT status, opinion_json, raw_response, error, completed_at
             FROM model_evaluations WHERE evaluation_id = ?1 AND model_id = ?2",
            params![evaluation_id, model_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            },
        )
        .optional()?;

    let Some((status, opinion_json, raw_response, error, completed_at)) = row else {
        return Ok(None);
    };
    let opinion = match opinion_json {
        Some(raw) => Some(
            serde_json::from_str(&raw)
                .map_err(|e| PanelError::Database(format!("corrupt opinion payload: {e}")))?,
        ),
        None => None,
    };
    Ok(Some(ModelEvaluation {
        evaluation_id: evaluation_id.to_string(),
        model_id: model_id.to_string(),
        status: RunStatus::parse(&status)
            .ok_or_else(|| PanelError::Database(format!("corrupt panel status: {status}")))?,
        opinion,
        raw_response,
        error,
        completed_at: completed_at.as_deref().and_then(parse_rfc3339),
    }))
}
