//! Evaluation job orchestrator.
//!
//! Creates job rows, hands them to the external scrape+analysis worker, and
//! applies the status transitions the worker reports back. State machine:
//! `pending → processing → {completed, failed}` plus `pending → failed`;
//! terminal states are never overwritten.

use crate::model::{EvaluationJob, RunStatus, TargetAudience};
use crate::providers::DispatchTrigger;
use crate::storage::{now_rfc3339, parse_rfc3339, with_txn, Store};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("Invalid evaluation request: {0}")]
    Validation(String),

    #[error("Evaluation job not found: {job_id}")]
    NotFound { job_id: String },

    #[error("Invalid status transition: {from:?} -> {to:?}")]
    InvalidTransition { from: RunStatus, to: RunStatus },

    #[error("Evaluation job already claimed: {job_id}")]
    AlreadyClaimed { job_id: String },

    #[error("Dispatch failed: {0}")]
    Dispatch(String),

    #[error("Database error: {0}")]
    Database(String),
}

impl From<rusqlite::Error> for JobError {
    fn from(e: rusqlite::Error) -> Self {
        JobError::Database(e.to_string())
    }
}

/// Status report from the worker callback surface.
#[derive(Debug, Clone)]
pub enum JobUpdate {
    Processing,
    Completed(serde_json::Value),
    Failed(String),
}

impl JobUpdate {
    fn status(&self) -> RunStatus {
        match self {
            JobUpdate::Processing => RunStatus::Processing,
            JobUpdate::Completed(_) => RunStatus::Completed,
            JobUpdate::Failed(_) => RunStatus::Failed,
        }
    }
}

pub struct JobOrchestrator {
    store: Store,
    dispatcher: Option<Arc<dyn DispatchTrigger>>,
    dispatch_timeout: Duration,
}

impl JobOrchestrator {
    pub fn new(
        store: Store,
        dispatcher: Option<Arc<dyn DispatchTrigger>>,
        dispatch_timeout: Duration,
    ) -> Self {
        Self {
            store,
            dispatcher,
            dispatch_timeout,
        }
    }

    /// Persist a new job in `pending` and return its id. The scrape+analysis
    /// work is not awaited here; callers follow up with [`Self::dispatch`].
    pub fn create_job(
        &self,
        subject_url: &str,
        audience: Option<&TargetAudience>,
        owner_user_id: Option<&str>,
    ) -> Result<String, JobError> {
        let audience = audience
            .ok_or_else(|| JobError::Validation("target audience is required".to_string()))?;
        let subject_url = normalize_subject_url(subject_url)?;

        let job_id = uuid::Uuid::new_v4().to_string();
        let audience_json = serde_json::to_string(audience)
            .map_err(|e| JobError::Validation(format!("unserializable audience: {e}")))?;
        let now = now_rfc3339();

        let conn = self.store.lock();
        conn.execute(
            "INSERT INTO evaluation_jobs
             (job_id, subject_url, audience_json, user_id, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?5)",
            params![job_id, subject_url, audience_json, owner_user_id, now],
        )?;
        Ok(job_id)
    }

    /// Hand the job to the external worker. Failure leaves the job `pending`;
    /// the caller may retry. Creation is never rolled back here.
    pub async fn dispatch(&self, job_id: &str) -> Result<(), JobError> {
        let job = self.get_status(job_id)?;
        let dispatcher = self
            .dispatcher
            .as_ref()
            .ok_or_else(|| JobError::Dispatch("no dispatch trigger configured".to_string()))?;

        let call = dispatcher.dispatch(&job.job_id, &job.subject_url, &job.audience);
        match tokio::time::timeout(self.dispatch_timeout, call).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(JobError::Dispatch(e.to_string())),
            Err(_) => Err(JobError::Dispatch(format!(
                "dispatch timed out after {}s",
                self.dispatch_timeout.as_secs()
            ))),
        }
    }

    /// Apply one status transition. The transition table is enforced inside
    /// the transaction, so the last terminal write wins and is never
    /// overwritten by stragglers.
    pub fn report_status(
        &self,
        job_id: &str,
        update: JobUpdate,
    ) -> Result<EvaluationJob, JobError> {
        let conn = self.store.lock();
        with_txn(&conn, |c| {
            let current: Option<String> = c
                .query_row(
                    "SELECT status FROM evaluation_jobs WHERE job_id = ?1",
                    [job_id],
                    |row| row.get(0),
                )
                .optional()?;
            let current = current.ok_or_else(|| JobError::NotFound {
                job_id: job_id.to_string(),
            })?;
            let from = RunStatus::parse(&current)
                .ok_or_else(|| JobError::Database(format!("corrupt job status: {current}")))?;
            let to = update.status();

            let allowed = matches!(
                (from, to),
                (RunStatus::Pending, RunStatus::Processing)
                    | (RunStatus::Processing, RunStatus::Completed)
                    | (RunStatus::Processing, RunStatus::Failed)
                    | (RunStatus::Pending, RunStatus::Failed)
            );
            if !allowed {
                return Err(JobError::InvalidTransition { from, to });
            }

            let now = now_rfc3339();
            match &update {
                JobUpdate::Processing => {
                    c.execute(
                        "UPDATE evaluation_jobs SET status = 'processing', updated_at = ?1
                         WHERE job_id = ?2",
                        params![now, job_id],
                    )?;
                }
                JobUpdate::Completed(result) => {
                    c.execute(
                        "UPDATE evaluation_jobs
                         SET status = 'completed', result_json = ?1, updated_at = ?2,
                             completed_at = ?2
                         WHERE job_id = ?3",
                        params![result.to_string(), now, job_id],
                    )?;
                }
                JobUpdate::Failed(error) => {
                    c.execute(
                        "UPDATE evaluation_jobs
                         SET status = 'failed', error = ?1, updated_at = ?2, completed_at = ?2
                         WHERE job_id = ?3",
                        params![error, now, job_id],
                    )?;
                }
            }
            fetch_job(c, job_id)
        })
    }

    pub fn get_status(&self, job_id: &str) -> Result<EvaluationJob, JobError> {
        let conn = self.store.lock();
        fetch_job(&conn, job_id)
    }

    /// Attach an owner to an anonymous job, exactly once. No credit changes
    /// hands; anonymous evaluations stay free after claiming.
    pub fn claim(&self, job_id: &str, user_id: &str) -> Result<(), JobError> {
        let conn = self.store.lock();
        with_txn(&conn, |c| {
            let exists: i64 = c.query_row(
                "SELECT COUNT(*) FROM evaluation_jobs WHERE job_id = ?1",
                [job_id],
                |row| row.get(0),
            )?;
            if exists == 0 {
                return Err(JobError::NotFound {
                    job_id: job_id.to_string(),
                });
            }
            let changed = c.execute(
                "UPDATE evaluation_jobs SET user_id = ?1, updated_at = ?2
                 WHERE job_id = ?3 AND user_id IS NULL",
                params![user_id, now_rfc3339(), job_id],
            )?;
            if changed == 0 {
                return Err(JobError::AlreadyClaimed {
                    job_id: job_id.to_string(),
                });
            }
            Ok(())
        })
    }
}

/// Normalize and validate the subject URL. A missing scheme defaults to
/// https; anything unparseable or non-web is rejected.
pub fn normalize_subject_url(raw: &str) -> Result<String, JobError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(JobError::Validation("subject url is required".to_string()));
    }
    let candidate = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("https://{raw}")
    };
    let url = url::Url::parse(&candidate)
        .map_err(|e| JobError::Validation(format!("invalid subject url: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(JobError::Validation(format!(
            "unsupported url scheme: {}",
            url.scheme()
        )));
    }
    if url.host_str().is_none() {
        return Err(JobError::Validation(
            "subject url must include a host".to_string(),
        ));
    }
    Ok(url.into())
}

fn fetch_job(conn: &Connection, job_id: &str) -> Result<EvaluationJob, JobError> {
    let row = conn
        .query_row(
            "SELECT job_id, subject_url, audience_json, user_id, status, result_json, error,
                    created_at, updated_at, completed_at
             FROM evaluation_jobs WHERE job_id = ?1",
            [job_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, String>(8)?,
                    row.get::<_, Option<String>>(9)?,
                ))
            },
        )
        .optional()?;

    let (job_id, subject_url, audience_json, user_id, status, result_json, error, created, updated, completed) =
        row.ok_or_else(|| JobError::NotFound {
            job_id: job_id.to_string(),
        })?;

    let audience: TargetAudience = serde_json::from_str(&audience_json)
        .map_err(|e| JobError::Database(format!("corrupt audience payload: {e}")))?;
    let result = match result_json {
        Some(raw) => Some(
            serde_json::from_str(&raw)
                .map_err(|e| JobError::Database(format!("corrupt result payload: {e}")))?,
        ),
        None => None,
    };

    Ok(EvaluationJob {
        job_id,
        subject_url,
        audience,
        user_id,
        status: RunStatus::parse(&status)
            .ok_or_else(|| JobError::Database(format!("corrupt job status: {status}")))?,
        result,
        error,
        created_at: parse_rfc3339(&created)
            .ok_or_else(|| JobError::Database("corrupt created_at".to_string()))?,
        updated_at: parse_rfc3339(&updated)
            .ok_or_else(|| JobError::Database("corrupt updated_at".to_string()))?,
        completed_at: completed.as_deref().and_then(parse_rfc3339),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn audience() -> TargetAudience {
        TargetAudience {
            age_range: Some("25-34".to_string()),
            region: Some("EU".to_string()),
            ..Default::default()
        }
    }

    fn orchestrator() -> JobOrchestrator {
        JobOrchestrator::new(Store::memory().unwrap(), None, Duration::from_secs(5))
    }

    struct RecordingDispatcher {
        calls: AtomicU32,
        fail: bool,
    }

    #[async_trait]
    impl DispatchTrigger for RecordingDispatcher {
        async fn dispatch(
            &self,
            _job_id: &str,
            _subject_url: &str,
            _audience: &TargetAudience,
        ) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("worker intake returned 503");
            }
            Ok(())
        }
    }

    struct HangingDispatcher;

    #[async_trait]
    impl DispatchTrigger for HangingDispatcher {
        async fn dispatch(
            &self,
            _job_id: &str,
            _subject_url: &str,
            _audience: &TargetAudience,
        ) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    #[test]
    fn test_url_normalization_defaults_to_https() {
        assert_eq!(
            normalize_subject_url("example.com/pricing").unwrap(),
            "https://example.com/pricing"
        );
        assert_eq!(
            normalize_subject_url("http://example.com").unwrap(),
            "http://example.com/"
        );
    }

    #[test]
    fn test_url_normalization_rejects_garbage() {
        assert!(matches!(
            normalize_subject_url("").unwrap_err(),
            JobError::Validation(_)
        ));
        assert!(matches!(
            normalize_subject_url("ftp://example.com").unwrap_err(),
            JobError::Validation(_)
        ));
        assert!(matches!(
            normalize_subject_url("https://").unwrap_err(),
            JobError::Validation(_)
        ));
    }

    #[test]
    fn test_create_requires_audience() {
        let jobs = orchestrator();
        let err = jobs.create_job("example.com", None, None).unwrap_err();
        assert!(matches!(err, JobError::Validation(_)));
    }

    #[test]
    fn test_create_persists_pending_job() {
        let jobs = orchestrator();
        let id = jobs
            .create_job("example.com", Some(&audience()), Some("u1"))
            .unwrap();
        let job = jobs.get_status(&id).unwrap();
        assert_eq!(job.status, RunStatus::Pending);
        assert_eq!(job.subject_url, "https://example.com/");
        assert_eq!(job.user_id.as_deref(), Some("u1"));
        assert!(job.result.is_none());
    }

    #[test]
    fn test_get_status_unknown_job() {
        let jobs = orchestrator();
        assert!(matches!(
            jobs.get_status("nope").unwrap_err(),
            JobError::NotFound { .. }
        ));
    }

    #[test]
    fn test_happy_path_transitions() {
        let jobs = orchestrator();
        let id = jobs.create_job("example.com", Some(&audience()), None).unwrap();

        jobs.report_status(&id, JobUpdate::Processing).unwrap();
        let done = jobs
            .report_status(&id, JobUpdate::Completed(serde_json::json!({"score": 80})))
            .unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        assert_eq!(done.result.unwrap()["score"], 80);
        assert!(done.completed_at.is_some());
    }

    #[test]
    fn test_terminal_state_is_never_overwritten() {
        let jobs = orchestrator();
        let id = jobs.create_job("example.com", Some(&audience()), None).unwrap();
        jobs.report_status(&id, JobUpdate::Processing).unwrap();
        jobs.report_status(&id, JobUpdate::Completed(serde_json::json!({})))
            .unwrap();

        let err = jobs.report_status(&id, JobUpdate::Processing).unwrap_err();
        assert_eq!(
            err,
            JobError::InvalidTransition {
                from: RunStatus::Completed,
                to: RunStatus::Processing
            }
        );
        assert_eq!(jobs.get_status(&id).unwrap().status, RunStatus::Completed);
    }

    #[test]
    fn test_pending_can_fail_directly() {
        let jobs = orchestrator();
        let id = jobs.create_job("example.com", Some(&audience()), None).unwrap();
        let job = jobs
            .report_status(&id, JobUpdate::Failed("unreachable host".to_string()))
            .unwrap();
        assert_eq!(job.status, RunStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("unreachable host"));
    }

    #[test]
    fn test_completed_requires_processing_first() {
        let jobs = orchestrator();
        let id = jobs.create_job("example.com", Some(&audience()), None).unwrap();
        let err = jobs
            .report_status(&id, JobUpdate::Completed(serde_json::json!({})))
            .unwrap_err();
        assert!(matches!(err, JobError::InvalidTransition { .. }));
    }

    #[test]
    fn test_claim_is_one_shot() {
        let jobs = orchestrator();
        let id = jobs.create_job("example.com", Some(&audience()), None).unwrap();

        jobs.claim(&id, "u1").unwrap();
        assert_eq!(jobs.get_status(&id).unwrap().user_id.as_deref(), Some("u1"));

        let err = jobs.claim(&id, "u2").unwrap_err();
        assert!(matches!(err, JobError::AlreadyClaimed { .. }));
        assert_eq!(jobs.get_status(&id).unwrap().user_id.as_deref(), Some("u1"));

        assert!(matches!(
            jobs.claim("nope", "u1").unwrap_err(),
            JobError::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn test_dispatch_failure_leaves_job_pending() {
        let dispatcher = Arc::new(RecordingDispatcher {
            calls: AtomicU32::new(0),
            fail: true,
        });
        let jobs = JobOrchestrator::new(
            Store::memory().unwrap(),
            Some(dispatcher.clone()),
            Duration::from_secs(5),
        );
        let id = jobs.create_job("example.com", Some(&audience()), None).unwrap();

        let err = jobs.dispatch(&id).await.unwrap_err();
        assert!(matches!(err, JobError::Dispatch(_)));
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(jobs.get_status(&id).unwrap().status, RunStatus::Pending);

        // Retry is the caller's move and goes through cleanly
        let dispatcher_ok = Arc::new(RecordingDispatcher {
            calls: AtomicU32::new(0),
            fail: false,
        });
        let jobs_ok = JobOrchestrator::new(
            Store::memory().unwrap(),
            Some(dispatcher_ok),
            Duration::from_secs(5),
        );
        let id = jobs_ok
            .create_job("example.com", Some(&audience()), None)
            .unwrap();
        jobs_ok.dispatch(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_dispatch_timeout_surfaces_as_dispatch_error() {
        let jobs = JobOrchestrator::new(
            Store::memory().unwrap(),
            Some(Arc::new(HangingDispatcher)),
            Duration::from_millis(20),
        );
        let id = jobs.create_job("example.com", Some(&audience()), None).unwrap();

        let err = jobs.dispatch(&id).await.unwrap_err();
        assert!(matches!(err, JobError::Dispatch(_)));
        assert_eq!(jobs.get_status(&id).unwrap().status, RunStatus::Pending);
    }

    #[tokio::test]
    async fn test_dispatch_without_trigger_configured() {
        let jobs = orchestrator();
        let id = jobs.create_job("example.com", Some(&audience()), None).unwrap();
        assert!(matches!(
            jobs.dispatch(&id).await.unwrap_err(),
            JobError::Dispatch(_)
        ));
    }
}
