//! Opinion prompt construction and response parsing.
//!
//! The provider returns free text; anything that does not contain one JSON
//! object of the expected shape is a provider failure, never a partial
//! success.

use crate::model::{AxOpinion, FactorScore, TargetAudience};

pub(crate) fn build_subject_prompt(subject_url: &str, audience: &TargetAudience) -> String {
    let mut audience_lines = Vec::new();
    if let Some(age) = &audience.age_range {
        audience_lines.push(format!("age range: {age}"));
    }
    if let Some(region) = &audience.region {
        audience_lines.push(format!("region: {region}"));
    }
    if let Some(occupation) = &audience.occupation {
        audience_lines.push(format!("occupation: {occupation}"));
    }
    if !audience.interests.is_empty() {
        audience_lines.push(format!("interests: {}", audience.interests.join(", ")));
    }
    if let Some(description) = &audience.description {
        audience_lines.push(description.clone());
    }

    format!(
        "You are assessing how well an automated agent can use a website on \
         behalf of a human.\n\n\
         ### Subject:\n{}\n\n\
         ### Target audience:\n{}\n\n\
         Rate the agent experience. Output ONLY JSON with\n\
         {{ \"score\": 0-100, \"anps\": -100..100, \
         \"factors\": [{{\"name\": string, \"score\": 0-100}}], \
         \"accessibility\": string, \"recommendations\": [string] }}.",
        subject_url,
        audience_lines.join("\n")
    )
}

/// Parse one structured opinion out of provider text.
pub fn parse_opinion(text: &str) -> anyhow::Result<AxOpinion> {
    let text = text.trim();
    let json_start_idx = text
        .find('{')
        .ok_or_else(|| anyhow::anyhow!("No JSON start ({{) found in opinion output"))?;
    let json_segment = &text[json_start_idx..];

    let val: serde_json::Value = serde_json::Deserializer::from_str(json_segment)
        .into_iter::<serde_json::Value>()
        .next()
        .ok_or_else(|| anyhow::anyhow!("No JSON object found in extracted text"))?
        .map_err(|e| anyhow::anyhow!("Invalid JSON: {}", e))?;

    let score = val
        .get("score")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| anyhow::anyhow!("Opinion JSON missing 'score' field"))?;
    if score > 100 {
        anyhow::bail!("Opinion score out of range: {}", score);
    }

    let anps = val
        .get("anps")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| anyhow::anyhow!("Opinion JSON missing 'anps' field"))?;
    let anps = i32::try_from(anps).map_err(|_| anyhow::anyhow!("ANPS out of range: {}", anps))?;

    let mut factors = Vec::new();
    if let Some(raw) = val.get("factors") {
        let list = raw
            .as_array()
            .ok_or_else(|| anyhow::anyhow!("'factors' is not an array"))?;
        for entry in list {
            let name = entry
                .get("name")
                .and_then(|v| v.as_str())
                .ok_or_else(|| anyhow::anyhow!("factor missing 'name'"))?;
            let factor_score = entry
                .get("score")
                .and_then(|v| v.as_u64())
                .filter(|s| *s <= 100)
                .ok_or_else(|| anyhow::anyhow!("factor '{}' has no valid score", name))?;
            factors.push(FactorScore {
                name: name.to_string(),
                score: factor_score as u8,
            });
        }
    }

    let accessibility = val
        .get("accessibility")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    let mut recommendations = Vec::new();
    if let Some(raw) = val.get("recommendations") {
        let list = raw
            .as_array()
            .ok_or_else(|| anyhow::anyhow!("'recommendations' is not an array"))?;
        for entry in list {
            let rec = entry
                .as_str()
                .ok_or_else(|| anyhow::anyhow!("non-string recommendation entry"))?;
            recommendations.push(rec.to_string());
        }
    }

    Ok(AxOpinion {
        score: score as u8,
        anps,
        factors,
        accessibility,
        recommendations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_clean_json() {
        let op = parse_opinion(
            r#"{"score": 82, "anps": 40, "factors": [{"name": "navigation", "score": 90}],
                "accessibility": "mostly fine", "recommendations": ["add aria labels"]}"#,
        )
        .unwrap();
        assert_eq!(op.score, 82);
        assert_eq!(op.anps, 40);
        assert_eq!(op.factors.len(), 1);
        assert_eq!(op.recommendations, vec!["add aria labels"]);
    }

    #[test]
    fn test_parses_json_wrapped_in_prose() {
        let op = parse_opinion(
            "Here is my assessment:\n```json\n{\"score\": 55, \"anps\": -10}\n```\nHope it helps!",
        )
        .unwrap();
        assert_eq!(op.score, 55);
        assert_eq!(op.anps, -10);
        assert!(op.factors.is_empty());
        assert_eq!(op.accessibility, "");
    }

    #[test]
    fn test_rejects_missing_fields_and_bad_ranges() {
        assert!(parse_opinion("no json at all").is_err());
        assert!(parse_opinion(r#"{"anps": 10}"#).is_err(), "score required");
        assert!(parse_opinion(r#"{"score": 10}"#).is_err(), "anps required");
        assert!(parse_opinion(r#"{"score": 101, "anps": 0}"#).is_err());
        assert!(parse_opinion(r#"{"score": -3, "anps": 0}"#).is_err());
        assert!(
            parse_opinion(r#"{"score": 50, "anps": 0, "factors": [{"score": 200}]}"#).is_err(),
            "malformed factor fails the whole parse"
        );
        assert!(
            parse_opinion(r#"{"score": 50, "anps": 0, "recommendations": [1, 2]}"#).is_err()
        );
    }

    #[test]
    fn test_prompt_mentions_subject_and_audience() {
        let prompt = build_subject_prompt(
            "https://example.com/",
            &TargetAudience {
                age_range: Some("25-34".to_string()),
                interests: vec!["cycling".to_string()],
                ..Default::default()
            },
        );
        assert!(prompt.contains("https://example.com/"));
        assert!(prompt.contains("age range: 25-34"));
        assert!(prompt.contains("cycling"));
        assert!(prompt.contains("Output ONLY JSON"));
    }
}
