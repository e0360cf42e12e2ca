//! On-disk state owned by a single invocation: the result cache and the chat
//! history. Both files are reloaded on every use and rewritten whole.

use anyhow::{Result, anyhow};
use std::fs;
use std::io::Write;
use std::path::Path;

mod cache;
mod history;

pub use cache::{CachedValue, ResultCache, fingerprint};
pub use history::{
    ConversationStore, cap_to_limit, ensure_system_preamble, non_system_words, trim_to_budget,
    word_count,
};

/// Write `bytes` to a sibling temp file and rename it over `path`, so readers
/// see either the old blob or the new one. Concurrent writers still race:
/// the last rename wins.
pub(crate) fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow!("invalid state path {}", path.display()))?;
    fs::create_dir_all(parent)?;
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow!("invalid state path {}", path.display()))?;
    let tmp = parent.join(format!(".{file_name}.{}.tmp", std::process::id()));
    {
        let mut f = fs::File::create(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    if let Err(err) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(err.into());
    }
    Ok(())
}

/// Remove `path` if present. Removing an absent file is not an error.
pub(crate) fn remove_if_present(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err.into()),
    }
}
