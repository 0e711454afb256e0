//! Runtime configuration for the evaluation core.

use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreConfig {
    #[serde(default)]
    pub panel: PanelConfig,
    #[serde(default)]
    pub credits: CreditConfig,
    #[serde(default)]
    pub limits: LimitConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PanelConfig {
    /// Panelist model configurations. Disabled entries are kept for history
    /// but never started and never counted toward council completeness.
    #[serde(default)]
    pub models: Vec<PanelModelConfig>,
    /// Upper bound on one opinion-provider call, in seconds.
    #[serde(default = "default_provider_timeout_secs")]
    pub provider_timeout_secs: u64,
    /// Output-size hint passed to the provider.
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    /// A pair left `processing` longer than this is failed on re-check.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            models: Vec::new(),
            provider_timeout_secs: default_provider_timeout_secs(),
            max_output_tokens: default_max_output_tokens(),
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PanelModelConfig {
    /// Stable panelist identity used as half of the (evaluation, model) key.
    pub id: String,
    /// Provider family ("openai", "fake", ...).
    pub provider: String,
    /// Provider-side model identifier.
    pub model: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditConfig {
    /// Credits seeded into a fresh account on first access.
    #[serde(default = "default_signup_bonus")]
    pub signup_bonus: i64,
    /// Principal whose fresh account is seeded with `admin_bonus` instead.
    #[serde(default)]
    pub admin_principal: Option<String>,
    #[serde(default = "default_admin_bonus")]
    pub admin_bonus: i64,
}

impl Default for CreditConfig {
    fn default() -> Self {
        Self {
            signup_bonus: default_signup_bonus(),
            admin_principal: None,
            admin_bonus: default_admin_bonus(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitConfig {
    /// Upper bound on one dispatch-trigger call, in seconds.
    #[serde(default = "default_dispatch_timeout_secs")]
    pub dispatch_timeout_secs: u64,
    /// Sliding window for voucher redemption attempts, in seconds.
    #[serde(default = "default_redeem_window_secs")]
    pub redeem_window_secs: u64,
    /// Attempts allowed per client identity inside one window.
    #[serde(default = "default_redeem_max_attempts")]
    pub redeem_max_attempts: u32,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            dispatch_timeout_secs: default_dispatch_timeout_secs(),
            redeem_window_secs: default_redeem_window_secs(),
            redeem_max_attempts: default_redeem_max_attempts(),
        }
    }
}

fn default_provider_timeout_secs() -> u64 {
    60
}
fn default_max_output_tokens() -> u32 {
    2000
}
fn default_stale_after_secs() -> u64 {
    600
}
fn default_signup_bonus() -> i64 {
    3
}
fn default_admin_bonus() -> i64 {
    100
}
fn default_dispatch_timeout_secs() -> u64 {
    30
}
fn default_redeem_window_secs() -> u64 {
    60
}
fn default_redeem_max_attempts() -> u32 {
    5
}
fn default_true() -> bool {
    true
}

impl CoreConfig {
    pub fn from_yaml_str(s: &str) -> anyhow::Result<Self> {
        let cfg: Self = serde_yaml::from_str(s)?;
        Ok(cfg)
    }

    pub fn from_yaml_path(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config {}: {}", path.display(), e))?;
        Self::from_yaml_str(&raw)
    }
}

impl PanelConfig {
    pub fn enabled_models(&self) -> impl Iterator<Item = &PanelModelConfig> {
        self.models.iter().filter(|m| m.enabled)
    }

    pub fn model(&self, id: &str) -> Option<&PanelModelConfig> {
        self.models.iter().find(|m| m.id == id && m.enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = CoreConfig::default();
        assert_eq!(cfg.panel.provider_timeout_secs, 60);
        assert_eq!(cfg.credits.signup_bonus, 3);
        assert_eq!(cfg.limits.redeem_max_attempts, 5);
        assert!(cfg.panel.models.is_empty());
    }

    #[test]
    fn yaml_round_trip_with_partial_fields() {
        let cfg = CoreConfig::from_yaml_str(
            r#"
panel:
  provider_timeout_secs: 10
  models:
    - id: gpt4o
      provider: openai
      model: gpt-4o
    - id: legacy
      provider: openai
      model: gpt-3.5-turbo
      enabled: false
credits:
  signup_bonus: 5
  admin_principal: admin@axlens.dev
"#,
        )
        .unwrap();

        assert_eq!(cfg.panel.provider_timeout_secs, 10);
        assert_eq!(cfg.panel.models.len(), 2);
        assert!(cfg.panel.models[0].enabled, "enabled defaults to true");
        assert_eq!(cfg.panel.enabled_models().count(), 1);
        assert!(cfg.panel.model("legacy").is_none(), "disabled model hidden");
        assert_eq!(cfg.credits.signup_bonus, 5);
        assert_eq!(cfg.credits.admin_principal.as_deref(), Some("admin@axlens.dev"));
        // Untouched section keeps defaults
        assert_eq!(cfg.limits.dispatch_timeout_secs, 30);
    }
}
