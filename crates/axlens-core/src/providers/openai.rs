use super::{OpinionClient, ProviderResponse};
use async_trait::async_trait;
use serde_json::json;

/// OpenAI-compatible chat-completions client. The panelist model id is passed
/// per call since one endpoint serves the whole panel.
pub struct OpenAIClient {
    pub api_key: String,
    pub base_url: String,
    pub temperature: f32,
    pub client: reqwest::Client,
}

impl OpenAIClient {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            base_url: "https://api.openai.com/v1".to_string(),
            temperature: 0.2,
            client: reqwest::Client::new(),
        }
    }

    /// Point at a compatible non-OpenAI endpoint.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl OpinionClient for OpenAIClient {
    async fn opinion(
        &self,
        model: &str,
        subject: &str,
        max_tokens: u32,
    ) -> anyhow::Result<ProviderResponse> {
        let url = format!("{}/chat/completions", self.base_url);

        let body = json!({
            "model": model,
            "messages": [{ "role": "user", "content": subject }],
            "temperature": self.temperature,
            "max_tokens": max_tokens,
        });

        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let error_text = resp.text().await.unwrap_or_else(|_| String::new());
            anyhow::bail!("opinion provider error (status {}): {}", status, error_text);
        }

        let json: serde_json::Value = resp.json().await?;

        // Parse choices[0].message.content
        let text = json
            .pointer("/choices/0/message/content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("provider response missing content"))?
            .to_string();

        Ok(ProviderResponse {
            text,
            provider: "openai".to_string(),
            model: model.to_string(),
        })
    }

    fn provider_name(&self) -> &'static str {
        "openai"
    }
}
