use anyhow::Result;
use serde::Serialize;
use serde_json::json;
use tamer_core::{AppConfig, UsageCounters};
use tamer_llm::ModelInfo;

pub(crate) fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Configuration as JSON with every provider's stored key masked.
pub(crate) fn redact_config_for_display(cfg: &AppConfig) -> Result<serde_json::Value> {
    let mut value = serde_json::to_value(cfg)?;
    if let Some(providers) = value
        .get_mut("providers")
        .and_then(|entry| entry.as_object_mut())
    {
        for provider in providers.values_mut() {
            if let Some(provider) = provider.as_object_mut()
                && provider.contains_key("api_key")
            {
                provider.insert("api_key".to_string(), json!("***REDACTED***"));
            }
        }
    }
    Ok(value)
}

pub(crate) fn model_lines(models: &[ModelInfo]) -> Vec<String> {
    models
        .iter()
        .map(|model| match &model.name {
            Some(name) => format!("{}  ({name})", model.id),
            None => model.id.clone(),
        })
        .collect()
}

/// End-of-session report; empty when no request was made.
pub(crate) fn usage_report(usage: &UsageCounters) -> Vec<String> {
    if usage.total_requests == 0 {
        return Vec::new();
    }
    vec![
        "Session usage:".to_string(),
        format!("  requests:          {}", usage.total_requests),
        format!("  prompt tokens:     {}", usage.total_prompt_tokens),
        format!("  completion tokens: {}", usage.total_completion_tokens),
    ]
}
