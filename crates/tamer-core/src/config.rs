use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Overrides the per-user configuration directory.
pub const CONFIG_DIR_ENV: &str = "TAMER_CONFIG_DIR";

pub fn config_dir() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
        let dir = dir.trim();
        if !dir.is_empty() {
            return Some(PathBuf::from(dir));
        }
    }
    let home = std::env::var("HOME")
        .ok()
        .or_else(|| std::env::var("USERPROFILE").ok())?;
    Some(Path::new(&home).join(".tamer"))
}

pub fn demo_dir(config_dir: &Path) -> PathBuf {
    config_dir.join("demo")
}

pub fn history_path(config_dir: &Path) -> PathBuf {
    config_dir.join("history.txt")
}

fn project_dir(workspace: &Path) -> PathBuf {
    workspace.join(".tamer")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Key into `providers` selecting the active endpoint.
    pub current_llm: String,
    pub providers: BTreeMap<String, ProviderConfig>,
    pub llm: GenerationConfig,
    pub ui: UiConfig,
    pub demo: PlaybackConfig,
    /// Free-form text placed ahead of the assistant persona in the system
    /// message.
    pub user_content: String,
    /// Seed the code block numbering instruction once per session.
    pub educational_prompt: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        let mut providers = BTreeMap::new();
        providers.insert(
            "openrouter".to_string(),
            ProviderConfig {
                endpoint: "https://openrouter.ai/api/v1/chat/completions".to_string(),
                model: "meta-llama/llama-3.3-70b-instruct:free".to_string(),
                api_key_env: "OPENROUTER_API_KEY".to_string(),
                extra_headers: BTreeMap::from([
                    (
                        "HTTP-Referer".to_string(),
                        "https://github.com/tamer-cli/tamer".to_string(),
                    ),
                    ("X-Title".to_string(), "Tamer".to_string()),
                ]),
                ..ProviderConfig::default()
            },
        );
        providers.insert(
            "openai".to_string(),
            ProviderConfig {
                endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
                model: "gpt-4o-mini".to_string(),
                api_key_env: "OPENAI_API_KEY".to_string(),
                ..ProviderConfig::default()
            },
        );
        providers.insert(
            "pollinations".to_string(),
            ProviderConfig {
                endpoint: "https://text.pollinations.ai/openai".to_string(),
                model: "openai".to_string(),
                requires_api_key: false,
                ..ProviderConfig::default()
            },
        );
        Self {
            current_llm: "openrouter".to_string(),
            providers,
            llm: GenerationConfig::default(),
            ui: UiConfig::default(),
            demo: PlaybackConfig::default(),
            user_content: String::new(),
            educational_prompt: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProviderConfig {
    pub endpoint: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Environment variable consulted before `api_key`.
    pub api_key_env: String,
    /// Anonymous tiers set this to false; requests then go out without an
    /// `Authorization` header.
    pub requires_api_key: bool,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_headers: BTreeMap<String, String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            model: String::new(),
            api_key: None,
            api_key_env: String::new(),
            requires_api_key: true,
            extra_headers: BTreeMap::new(),
        }
    }
}

impl ProviderConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        let from_env = if self.api_key_env.trim().is_empty() {
            None
        } else {
            std::env::var(self.api_key_env.trim())
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        from_env.or_else(|| {
            self.api_key
                .as_ref()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        })
    }
}

/// Sampling parameters. Optional values are sent only when they differ
/// from the provider default.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GenerationConfig {
    pub temperature: f64,
    pub max_tokens: Option<u32>,
    pub top_p: f64,
    pub frequency_penalty: f64,
    pub presence_penalty: f64,
    pub stop: Option<Vec<String>>,
    pub seed: Option<i64>,
    pub timeout_seconds: u64,
    pub max_retries: u8,
    pub retry_base_ms: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 0.8,
            max_tokens: None,
            top_p: 1.0,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            stop: None,
            seed: None,
            timeout_seconds: 60,
            max_retries: 2,
            retry_base_ms: 400,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UiConfig {
    /// Pause after each live redraw while streaming.
    pub refresh_delay_ms: u64,
    /// syntect theme used for fenced code.
    pub code_theme: String,
    pub debug: bool,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            refresh_delay_ms: 10,
            code_theme: "base16-ocean.dark".to_string(),
            debug: false,
        }
    }
}

/// Demo playback timing, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlaybackConfig {
    pub typing_delay_per_char: f64,
    pub typing_delay_variance: f64,
    pub pause_after_input: f64,
    pub output_delay: f64,
    /// Multiplier for synthesized output chunk delays; 0 replays instantly.
    pub chunk_delay_scale: f64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            typing_delay_per_char: 0.03,
            typing_delay_variance: 0.02,
            pause_after_input: 0.5,
            output_delay: 1.0,
            chunk_delay_scale: 1.0,
        }
    }
}

impl AppConfig {
    pub fn user_settings_path() -> Option<PathBuf> {
        config_dir().map(|dir| dir.join("settings.json"))
    }

    pub fn project_settings_path(workspace: &Path) -> PathBuf {
        project_dir(workspace).join("settings.json")
    }

    pub fn legacy_toml_path() -> Option<PathBuf> {
        config_dir().map(|dir| dir.join("config.toml"))
    }

    pub fn load(workspace: &Path) -> Result<Self> {
        let mut merged = serde_json::to_value(Self::default())?;

        if let Some(legacy) = Self::legacy_toml_path()
            && legacy.exists()
        {
            let raw = fs::read_to_string(legacy)?;
            let legacy_cfg: AppConfig = toml::from_str(&raw)?;
            merge_json_value(&mut merged, &serde_json::to_value(legacy_cfg)?);
        }

        let mut paths = Vec::new();
        if let Some(user) = Self::user_settings_path() {
            paths.push(user);
        }
        paths.push(Self::project_settings_path(workspace));

        for path in paths {
            if !path.exists() {
                continue;
            }
            let raw = fs::read_to_string(&path)?;
            let value: serde_json::Value = serde_json::from_str(&raw)
                .map_err(|err| anyhow!("invalid settings file {}: {err}", path.display()))?;
            merge_json_value(&mut merged, &value);
        }

        Ok(serde_json::from_value(merged)?)
    }

    /// Load the configuration, writing the defaults to the user settings
    /// file first when no layer exists yet.
    pub fn ensure(workspace: &Path) -> Result<Self> {
        let user = Self::user_settings_path();
        if Self::project_settings_path(workspace).exists()
            || Self::legacy_toml_path().is_some_and(|p| p.exists())
            || user.as_ref().is_some_and(|p| p.exists())
        {
            return Self::load(workspace);
        }
        let cfg = Self::default();
        if user.is_some() {
            cfg.save()?;
        }
        Ok(cfg)
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::user_settings_path()
            .ok_or_else(|| anyhow!("cannot determine the configuration directory"))?;
        fs::create_dir_all(
            path.parent()
                .ok_or_else(|| anyhow!("invalid config path"))?,
        )?;
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    pub fn current_provider(&self) -> Result<&ProviderConfig> {
        self.providers.get(&self.current_llm).ok_or_else(|| {
            let known: Vec<&str> = self.providers.keys().map(String::as_str).collect();
            anyhow!(
                "unknown provider '{}' in current_llm (configured: {})",
                self.current_llm,
                known.join(", ")
            )
        })
    }
}

fn merge_json_value(base: &mut serde_json::Value, overlay: &serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_obj), serde_json::Value::Object(overlay_obj)) => {
            for (key, overlay_value) in overlay_obj {
                if let Some(base_value) = base_obj.get_mut(key) {
                    merge_json_value(base_value, overlay_value);
                } else {
                    base_obj.insert(key.clone(), overlay_value.clone());
                }
            }
        }
        (base_slot, overlay_value) => {
            *base_slot = overlay_value.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn defaults_include_an_anonymous_provider() {
        let cfg = AppConfig::default();
        assert!(cfg.current_provider().is_ok());
        let anonymous = cfg.providers.get("pollinations").expect("pollinations");
        assert!(!anonymous.requires_api_key);
        let openrouter = cfg.providers.get("openrouter").expect("openrouter");
        assert!(openrouter.requires_api_key);
        assert!(openrouter.extra_headers.contains_key("HTTP-Referer"));
    }

    #[test]
    fn unknown_current_provider_is_reported() {
        let cfg = AppConfig {
            current_llm: "missing".to_string(),
            ..AppConfig::default()
        };
        let err = cfg.current_provider().expect_err("unknown provider");
        assert!(err.to_string().contains("missing"));
        assert!(err.to_string().contains("openrouter"));
    }

    #[test]
    fn resolve_api_key_prefers_env_then_config() {
        let mut provider = ProviderConfig {
            api_key: Some("  config-key  ".to_string()),
            api_key_env: "TAMER_CORE_TEST_KEY".to_string(),
            ..ProviderConfig::default()
        };
        // SAFETY: test-only process-level env mutation.
        unsafe {
            std::env::remove_var("TAMER_CORE_TEST_KEY");
        }
        assert_eq!(provider.resolve_api_key().as_deref(), Some("config-key"));

        // SAFETY: test-only process-level env mutation.
        unsafe {
            std::env::set_var("TAMER_CORE_TEST_KEY", "env-key");
        }
        assert_eq!(provider.resolve_api_key().as_deref(), Some("env-key"));

        // SAFETY: test-only process-level env mutation.
        unsafe {
            std::env::set_var("TAMER_CORE_TEST_KEY", "   ");
        }
        provider.api_key = Some(" ".to_string());
        assert_eq!(provider.resolve_api_key(), None);

        // SAFETY: test-only process-level env mutation.
        unsafe {
            std::env::remove_var("TAMER_CORE_TEST_KEY");
        }
    }

    #[test]
    fn project_layer_overrides_nested_fields_only() {
        let workspace = tempfile::tempdir().expect("workspace");
        let user_dir = tempfile::tempdir().expect("user dir");
        // SAFETY: test-only process-level env mutation.
        unsafe {
            std::env::set_var(CONFIG_DIR_ENV, user_dir.path());
        }
        let project = AppConfig::project_settings_path(workspace.path());
        fs::create_dir_all(project.parent().expect("parent")).expect("project dir");
        fs::write(
            &project,
            r#"{"current_llm":"pollinations","llm":{"temperature":0.2},"providers":{"openai":{"model":"gpt-4.1"}}}"#,
        )
        .expect("write project settings");

        let cfg = AppConfig::load(workspace.path()).expect("load");
        assert_eq!(cfg.current_llm, "pollinations");
        assert!((cfg.llm.temperature - 0.2).abs() < f64::EPSILON);
        assert_eq!(cfg.llm.timeout_seconds, 60);
        let openai = cfg.providers.get("openai").expect("openai");
        assert_eq!(openai.model, "gpt-4.1");
        assert!(openai.endpoint.contains("api.openai.com"));

        // SAFETY: test-only process-level env mutation.
        unsafe {
            std::env::remove_var(CONFIG_DIR_ENV);
        }
    }

    #[test]
    fn merge_replaces_scalars_and_extends_objects() {
        let mut base = json!({"a": 1, "nested": {"x": true, "y": "keep"}});
        merge_json_value(&mut base, &json!({"a": 2, "nested": {"x": false}, "b": [1]}));
        assert_eq!(
            base,
            json!({"a": 2, "nested": {"x": false, "y": "keep"}, "b": [1]})
        );
    }

    proptest! {
        #[test]
        fn merge_json_value_is_idempotent_for_flat_objects(
            base in prop::collection::btree_map("[a-z]{1,8}", any::<i64>(), 0..12),
            overlay in prop::collection::btree_map("[a-z]{1,8}", any::<i64>(), 0..12),
        ) {
            let mut base_value = json!(base);
            let overlay_value = json!(overlay);
            merge_json_value(&mut base_value, &overlay_value);
            let once = base_value.clone();
            merge_json_value(&mut base_value, &overlay_value);
            prop_assert_eq!(base_value, once);
        }
    }
}
