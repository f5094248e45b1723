use anyhow::{Result, bail};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tamer_core::{GenerationConfig, ProviderConfig};
use tamer_errors::ApiError;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: Option<String>,
}

/// `{base}/models` for a chat completions endpoint.
pub fn models_url(endpoint: &str) -> String {
    let trimmed = endpoint.trim_end_matches('/');
    let base = trimmed
        .strip_suffix("/chat/completions")
        .or_else(|| trimmed.strip_suffix("/completions"))
        .unwrap_or(trimmed);
    format!("{base}/models")
}

/// List the provider's models whose id or name contains `filter`
/// (case-insensitive).
/// Any failure is logged and yields an empty list.
pub fn fetch_models(
    provider: &ProviderConfig,
    generation: &GenerationConfig,
    filter: Option<&str>,
) -> Vec<ModelInfo> {
    match try_fetch_models(provider, generation) {
        Ok(models) => filter_models(models, filter),
        Err(err) => {
            warn!(error = %err, endpoint = %provider.endpoint, "model listing failed");
            Vec::new()
        }
    }
}

fn try_fetch_models(
    provider: &ProviderConfig,
    generation: &GenerationConfig,
) -> Result<Vec<ModelInfo>> {
    let url = models_url(&provider.endpoint);
    debug!(url = %url, "fetching model list");
    let client = Client::builder()
        .timeout(Duration::from_secs(generation.timeout_seconds))
        .build()?;
    let mut request = client.get(&url);
    if let Some(key) = provider.resolve_api_key() {
        request = request.bearer_auth(key);
    }
    for (name, value) in &provider.extra_headers {
        request = request.header(name.as_str(), value.as_str());
    }
    let resp = request.send()?;
    let status = resp.status();
    let body = resp.text()?;
    if !status.is_success() {
        bail!(ApiError::from_response(status.as_u16(), &body));
    }
    let value: Value = serde_json::from_str(&body)?;
    Ok(parse_models(&value))
}

/// Accepts `{"data": [...]}` or a bare array of model objects.
fn parse_models(value: &Value) -> Vec<ModelInfo> {
    let entries = value
        .get("data")
        .and_then(|v| v.as_array())
        .or_else(|| value.as_array());
    let Some(entries) = entries else {
        return Vec::new();
    };
    let mut models: Vec<ModelInfo> = entries
        .iter()
        .filter_map(|entry| {
            let id = entry
                .get("id")
                .or_else(|| entry.get("name"))
                .and_then(|v| v.as_str())?
                .to_string();
            let name = entry
                .get("name")
                .and_then(|v| v.as_str())
                .filter(|name| *name != id)
                .map(ToString::to_string);
            Some(ModelInfo { id, name })
        })
        .collect();
    models.sort_by(|a, b| a.id.cmp(&b.id));
    models.dedup_by(|a, b| a.id == b.id);
    models
}

fn filter_models(models: Vec<ModelInfo>, filter: Option<&str>) -> Vec<ModelInfo> {
    let Some(needle) = filter.map(str::trim).filter(|f| !f.is_empty()) else {
        return models;
    };
    let needle = needle.to_lowercase();
    models
        .into_iter()
        .filter(|model| {
            model.id.to_lowercase().contains(&needle)
                || model
                    .name
                    .as_deref()
                    .is_some_and(|name| name.to_lowercase().contains(&needle))
        })
        .collect()
}
