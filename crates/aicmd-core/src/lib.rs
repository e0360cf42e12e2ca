use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub type Result<T> = anyhow::Result<T>;

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";
pub const DEFAULT_API_KEY_ENV: &str = "OPENAI_API_KEY";

/// Overrides the per-user state directory (`~/.aicmd` by default).
pub const STATE_DIR_ENV: &str = "AICMD_HOME";
/// When set, `ResultCache` recomputes every call and never touches disk.
pub const NO_CACHE_ENV: &str = "AICMD_NO_CACHE";
/// When set, executed commands are not appended to the shell history file.
pub const NO_HISTORY_ENV: &str = "AICMD_NO_HISTORY";

pub const CACHE_FILE: &str = "cache.json";
pub const HISTORY_FILE: &str = "history.json";
pub const SETTINGS_FILE: &str = "settings.json";
pub const LOG_FILE: &str = "observe.log";

pub fn state_dir() -> PathBuf {
    resolve_state_dir(
        std::env::var(STATE_DIR_ENV).ok().as_deref(),
        home_dir().as_deref(),
    )
}

fn resolve_state_dir(override_dir: Option<&str>, home: Option<&Path>) -> PathBuf {
    if let Some(dir) = override_dir.map(str::trim).filter(|d| !d.is_empty()) {
        return PathBuf::from(dir);
    }
    match home {
        Some(home) => home.join(".aicmd"),
        None => PathBuf::from(".aicmd"),
    }
}

pub fn home_dir() -> Option<PathBuf> {
    std::env::var("HOME")
        .ok()
        .or_else(|| std::env::var("USERPROFILE").ok())
        .filter(|value| !value.trim().is_empty())
        .map(PathBuf::from)
}

/// Reads an environment toggle at the point of use. Unset, empty, `0` and
/// `false` all mean "off".
pub fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|value| flag_value_is_set(&value))
        .unwrap_or(false)
}

pub fn flag_value_is_set(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    !(normalized.is_empty() || normalized == "0" || normalized == "false" || normalized == "no")
}

/// Failures the CLI reports with a dedicated exit status.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AicmdError {
    #[error("no API key available: {0}")]
    MissingCredential(String),
    #[error("aborted: {0}")]
    Aborted(String),
    #[error("invalid selection '{input}' (expected 0..{count})")]
    InvalidSelection { input: String, count: usize },
    #[error("context index {index} out of range (catalog has {count} providers)")]
    InvalidContextIndex { index: usize, count: usize },
    #[error("interrupted")]
    Interrupted,
}

/// A single turn of a conversation with the chat service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role")]
pub enum ChatMessage {
    #[serde(rename = "system")]
    System { content: String },
    #[serde(rename = "user")]
    User { content: String },
    #[serde(rename = "assistant")]
    Assistant { content: String },
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::System {
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::User {
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::Assistant {
            content: content.into(),
        }
    }

    pub fn role(&self) -> &'static str {
        match self {
            Self::System { .. } => "system",
            Self::User { .. } => "user",
            Self::Assistant { .. } => "assistant",
        }
    }

    pub fn content(&self) -> &str {
        match self {
            Self::System { content } | Self::User { content } | Self::Assistant { content } => {
                content
            }
        }
    }

    pub fn is_system(&self) -> bool {
        matches!(self, Self::System { .. })
    }
}

/// Parameters of one call to the completion service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
    pub n: u32,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            temperature: 0.0,
            max_tokens: 50,
            top_p: 1.0,
            n: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
    pub max_tokens: u32,
}

/// Host facts that shape generated commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    /// OS family as reported by the standard library (`linux`, `macos`, ...).
    pub family: String,
    /// Absolute path of the user's shell.
    pub shell: String,
}

impl Platform {
    pub fn detect() -> Self {
        let shell = std::env::var("SHELL")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| default_shell().to_string());
        Self {
            family: std::env::consts::OS.to_string(),
            shell,
        }
    }

    pub fn shell_name(&self) -> &str {
        Path::new(&self.shell)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(self.shell.as_str())
    }

    pub fn describe(&self) -> String {
        format!(
            "The user is running {} with the {} shell ({}).",
            self.family,
            self.shell_name(),
            self.shell
        )
    }
}

fn default_shell() -> &'static str {
    if cfg!(windows) { "cmd.exe" } else { "/bin/sh" }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub cache: CacheConfig,
    pub history: HistoryConfig,
    pub pipeline: PipelineConfig,
}

impl AppConfig {
    pub fn settings_path(state_dir: &Path) -> PathBuf {
        state_dir.join(SETTINGS_FILE)
    }

    pub fn legacy_toml_path(state_dir: &Path) -> PathBuf {
        state_dir.join("config.toml")
    }

    pub fn load(state_dir: &Path) -> Result<Self> {
        let mut merged = serde_json::to_value(Self::default())?;

        let legacy = Self::legacy_toml_path(state_dir);
        if legacy.exists() {
            let raw = fs::read_to_string(legacy)?;
            let legacy_cfg: AppConfig = toml::from_str(&raw)?;
            merge_json_value(&mut merged, &serde_json::to_value(legacy_cfg)?);
        }

        let settings = Self::settings_path(state_dir);
        if settings.exists() {
            let raw = fs::read_to_string(settings)?;
            let value: serde_json::Value = serde_json::from_str(&raw)?;
            merge_json_value(&mut merged, &value);
        }

        Ok(serde_json::from_value(merged)?)
    }

    pub fn ensure(state_dir: &Path) -> Result<Self> {
        if Self::settings_path(state_dir).exists() || Self::legacy_toml_path(state_dir).exists() {
            return Self::load(state_dir);
        }
        let cfg = Self::default();
        cfg.save(state_dir)?;
        Ok(cfg)
    }

    pub fn save(&self, state_dir: &Path) -> Result<()> {
        fs::create_dir_all(state_dir)?;
        fs::write(
            Self::settings_path(state_dir),
            serde_json::to_vec_pretty(self)?,
        )?;
        Ok(())
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

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub model: String,
    pub endpoint: String,
    pub api_key: Option<String>,
    pub api_key_env: String,
    /// Plain-text key file read when neither the env var nor `api_key` is set.
    /// Relative paths are resolved against `$HOME`.
    pub key_file: String,
    pub timeout_seconds: u64,
    pub max_retries: u8,
    pub retry_base_ms: u64,
    pub chat_temperature: f32,
    pub chat_max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key: None,
            api_key_env: DEFAULT_API_KEY_ENV.to_string(),
            key_file: ".config/openai".to_string(),
            timeout_seconds: 60,
            max_retries: 3,
            retry_base_ms: 400,
            chat_temperature: 0.7,
            chat_max_tokens: 1024,
        }
    }
}

impl LlmConfig {
    pub fn key_file_path(&self) -> Option<PathBuf> {
        let raw = self.key_file.trim();
        if raw.is_empty() {
            return None;
        }
        let path = Path::new(raw);
        if path.is_absolute() {
            return Some(path.to_path_buf());
        }
        let relative = raw.strip_prefix("~/").unwrap_or(raw);
        home_dir().map(|home| home.join(relative))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub maxsize: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { maxsize: 128 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub limit: usize,
    pub word_budget: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            limit: 50,
            word_budget: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub alternatives: u32,
    pub command_max_tokens: u32,
    pub explain_max_tokens: u32,
    pub alternatives_temperature: f32,
    pub context_char_limit: usize,
    pub fallback_command: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            alternatives: 5,
            command_max_tokens: 50,
            explain_max_tokens: 300,
            alternatives_temperature: 0.7,
            context_char_limit: 3000,
            fallback_command: "echo 'No command found.'".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

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

    #[test]
    fn state_dir_prefers_override_then_home() {
        assert_eq!(
            resolve_state_dir(Some("/tmp/aicmd-x"), Some(Path::new("/home/u"))),
            PathBuf::from("/tmp/aicmd-x")
        );
        assert_eq!(
            resolve_state_dir(Some("  "), Some(Path::new("/home/u"))),
            PathBuf::from("/home/u/.aicmd")
        );
        assert_eq!(resolve_state_dir(None, None), PathBuf::from(".aicmd"));
    }

    #[test]
    fn flag_values() {
        for on in ["1", "true", "yes", "on", "anything"] {
            assert!(flag_value_is_set(on), "{on} should enable");
        }
        for off in ["", " ", "0", "false", "FALSE", "no"] {
            assert!(!flag_value_is_set(off), "{off:?} should disable");
        }
    }

    #[test]
    fn chat_message_serializes_with_role_tag() {
        let msg = ChatMessage::user("list files");
        let value = serde_json::to_value(&msg).expect("serialize");
        assert_eq!(value, json!({"role": "user", "content": "list files"}));
        let back: ChatMessage = serde_json::from_value(value).expect("deserialize");
        assert_eq!(back, msg);
        assert!(ChatMessage::system("x").is_system());
        assert_eq!(ChatMessage::assistant("y").role(), "assistant");
    }

    #[test]
    fn config_layers_settings_over_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(
            AppConfig::settings_path(dir.path()),
            r#"{"cache":{"maxsize":7},"llm":{"model":"gpt-test"}}"#,
        )
        .expect("write settings");
        let cfg = AppConfig::load(dir.path()).expect("load");
        assert_eq!(cfg.cache.maxsize, 7);
        assert_eq!(cfg.llm.model, "gpt-test");
        assert_eq!(cfg.llm.api_key_env, DEFAULT_API_KEY_ENV);
        assert_eq!(cfg.history.limit, 50);
        assert_eq!(cfg.history.word_budget, 2000);
    }

    #[test]
    fn legacy_toml_is_applied_under_json_settings() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(
            AppConfig::legacy_toml_path(dir.path()),
            "[history]\nlimit = 10\nword_budget = 300\n",
        )
        .expect("write toml");
        fs::write(
            AppConfig::settings_path(dir.path()),
            r#"{"history":{"limit":20}}"#,
        )
        .expect("write settings");
        let cfg = AppConfig::load(dir.path()).expect("load");
        assert_eq!(cfg.history.limit, 20);
        assert_eq!(cfg.history.word_budget, 300);
    }

    #[test]
    fn ensure_writes_defaults_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = dir.path().join("state");
        let cfg = AppConfig::ensure(&state).expect("ensure");
        assert_eq!(cfg.pipeline.alternatives, 5);
        assert!(AppConfig::settings_path(&state).exists());
    }

    #[test]
    fn platform_shell_name_strips_directory() {
        let platform = Platform {
            family: "linux".to_string(),
            shell: "/usr/bin/zsh".to_string(),
        };
        assert_eq!(platform.shell_name(), "zsh");
        assert!(platform.describe().contains("linux"));
    }

    #[test]
    fn absolute_key_file_is_used_verbatim() {
        let cfg = LlmConfig {
            key_file: "/etc/aicmd/key".to_string(),
            ..LlmConfig::default()
        };
        assert_eq!(cfg.key_file_path(), Some(PathBuf::from("/etc/aicmd/key")));
        let empty = LlmConfig {
            key_file: String::new(),
            ..LlmConfig::default()
        };
        assert_eq!(empty.key_file_path(), None);
    }
}
