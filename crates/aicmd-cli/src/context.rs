use aicmd_core::{AicmdError, LlmConfig};
use anyhow::{Result, anyhow};
use std::fs;
use std::io::IsTerminal;
use std::path::Path;

/// Where the API key for this invocation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KeySource {
    Environment,
    Settings,
    KeyFile,
    Prompt,
}

/// Make the API key visible to the HTTP client through `llm.api_key_env`.
///
/// Lookup order: the environment, `llm.api_key`, the key file, then a hidden
/// prompt whose answer is written back to the key file. A non-interactive
/// terminal or an empty answer is a missing credential.
pub(crate) fn ensure_api_key(cfg: &LlmConfig, json_mode: bool) -> Result<KeySource> {
    let env_key = cfg.api_key_env.trim();
    if env_key.is_empty() {
        return Err(anyhow!(
            "llm.api_key_env is empty; set it in settings.json"
        ));
    }

    if std::env::var(env_key)
        .map(|value| !value.trim().is_empty())
        .unwrap_or(false)
    {
        return Ok(KeySource::Environment);
    }

    if let Some((key, source)) = stored_api_key(cfg) {
        // SAFETY: We set process-local environment for this CLI process before any threads start.
        unsafe {
            std::env::set_var(env_key, key);
        }
        return Ok(source);
    }

    let key_file = cfg.key_file_path();
    let interactive = std::io::stdin().is_terminal() && std::io::stderr().is_terminal();
    if json_mode || !interactive {
        return Err(AicmdError::MissingCredential(format!(
            "set {env_key} or write the key to {}",
            key_file
                .as_deref()
                .map_or_else(|| cfg.key_file.clone(), |p| p.display().to_string())
        ))
        .into());
    }

    eprintln!("No API key found.");
    let key = rpassword::prompt_password("Please enter your API key: ")?;
    let trimmed = key.trim();
    if trimmed.is_empty() {
        return Err(AicmdError::MissingCredential("no API key provided".to_string()).into());
    }
    if let Some(path) = key_file {
        save_key_file(&path, trimmed)?;
        eprintln!("saved API key in {}", path.display());
    }
    // SAFETY: We set process-local environment for this CLI process before any threads start.
    unsafe {
        std::env::set_var(env_key, trimmed);
    }
    Ok(KeySource::Prompt)
}

/// A key from settings or the key file, whichever is found first.
fn stored_api_key(cfg: &LlmConfig) -> Option<(String, KeySource)> {
    if let Some(key) = cfg
        .api_key
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        return Some((key.to_string(), KeySource::Settings));
    }
    let raw = fs::read_to_string(cfg.key_file_path()?).ok()?;
    let key = raw.trim();
    (!key.is_empty()).then(|| (key.to_string(), KeySource::KeyFile))
}

pub(crate) fn save_key_file(path: &Path, key: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, key)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(path)?.permissions();
        perms.set_mode(0o600);
        fs::set_permissions(path, perms)?;
    }
    Ok(())
}
