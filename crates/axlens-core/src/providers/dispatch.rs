use super::DispatchTrigger;
use crate::model::TargetAudience;
use async_trait::async_trait;
use serde_json::json;

/// HTTP dispatch trigger: posts the job to the external scrape+analysis
/// worker's intake endpoint. The worker reports back through the status
/// callback surface, never through this call's response body.
pub struct HttpDispatcher {
    pub endpoint: String,
    pub auth_token: Option<String>,
    pub client: reqwest::Client,
}

impl HttpDispatcher {
    pub fn new(endpoint: String, auth_token: Option<String>) -> Self {
        Self {
            endpoint,
            auth_token,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl DispatchTrigger for HttpDispatcher {
    async fn dispatch(
        &self,
        job_id: &str,
        subject_url: &str,
        audience: &TargetAudience,
    ) -> anyhow::Result<()> {
        let body = json!({
            "job_id": job_id,
            "subject_url": subject_url,
            "audience": audience,
        });

        let mut req = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .json(&body);
        if let Some(token) = &self.auth_token {
            req = req.header("Authorization", format!("Bearer {token}"));
        }

        let resp = req.send().await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let error_text = resp.text().await.unwrap_or_else(|_| String::new());
            anyhow::bail!("dispatch trigger error (status {}): {}", status, error_text);
        }
        Ok(())
    }
}
