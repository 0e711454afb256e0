//! External collaborator seams: the opinion provider and the scrape-worker
//! dispatch trigger. Both are trait objects so tests can substitute mocks.

pub mod dispatch;
pub mod openai;

use crate::model::TargetAudience;
use async_trait::async_trait;

/// Raw completion returned by an opinion provider.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub text: String,
    pub provider: String,
    pub model: String,
}

/// One panelist's way of obtaining an opinion. The coordinator owns parsing;
/// implementations only move text.
#[async_trait]
pub trait OpinionClient: Send + Sync {
    async fn opinion(
        &self,
        model: &str,
        subject: &str,
        max_tokens: u32,
    ) -> anyhow::Result<ProviderResponse>;

    fn provider_name(&self) -> &'static str;
}

/// Fire-and-forget hand-off to the external scrape+analysis worker.
/// At-most-once per call; the orchestrator retries by calling again.
#[async_trait]
pub trait DispatchTrigger: Send + Sync {
    async fn dispatch(
        &self,
        job_id: &str,
        subject_url: &str,
        audience: &TargetAudience,
    ) -> anyhow::Result<()>;
}
