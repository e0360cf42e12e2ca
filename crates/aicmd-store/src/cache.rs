use crate::{remove_if_present, write_atomically};
use aicmd_core::{CACHE_FILE, NO_CACHE_ENV, env_flag};
use aicmd_observe::Observer;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const CACHE_FORMAT_VERSION: u32 = 1;

/// A memoized result: either one text or an ordered list of texts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CachedValue {
    Text(String),
    List(Vec<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    key: String,
    value: CachedValue,
}

/// Entries are kept in insertion order; index 0 is the oldest.
#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheFile {
    #[serde(default)]
    version: u32,
    entries: Vec<CacheEntry>,
}

/// Fingerprint of an operation name and its ordered argument values.
///
/// Every component is length-prefixed, so `["ab", "c"]` and `["a", "bc"]`
/// produce different keys.
pub fn fingerprint(operation: &str, args: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"aicmd:");
    for part in std::iter::once(operation).chain(args.iter().copied()) {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Bounded, insertion-ordered memoization of expensive calls, persisted as
/// one JSON blob.
///
/// Nothing is held in memory between calls: every lookup reloads the file,
/// so separate invocations see each other's entries. Two processes inserting
/// at the same time can lose one insertion (last writer wins).
pub struct ResultCache {
    path: PathBuf,
    maxsize: usize,
    observer: Arc<Observer>,
    bypass_override: Option<bool>,
}

impl ResultCache {
    pub fn new(state_dir: &Path, maxsize: usize, observer: Arc<Observer>) -> Self {
        Self {
            path: state_dir.join(CACHE_FILE),
            maxsize,
            observer,
            bypass_override: None,
        }
    }

    /// Pin the bypass decision instead of reading `AICMD_NO_CACHE`.
    pub fn with_bypass(mut self, bypass: bool) -> Self {
        self.bypass_override = Some(bypass);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn maxsize(&self) -> usize {
        self.maxsize
    }

    fn bypassed(&self) -> bool {
        self.bypass_override
            .unwrap_or_else(|| env_flag(NO_CACHE_ENV))
    }

    /// Return the stored result for `(operation, args)` or compute, store and
    /// return it. A failed computation is propagated and nothing is stored.
    pub fn cached<F>(&self, operation: &str, args: &[&str], compute: F) -> Result<CachedValue>
    where
        F: FnOnce() -> Result<CachedValue>,
    {
        self.cached_if(operation, args, |_| true, compute)
    }

    pub fn cached_text<F>(&self, operation: &str, args: &[&str], compute: F) -> Result<String>
    where
        F: FnOnce() -> Result<String>,
    {
        let value = self.cached_if(
            operation,
            args,
            |v| matches!(v, CachedValue::Text(_)),
            || compute().map(CachedValue::Text),
        )?;
        Ok(match value {
            CachedValue::Text(text) => text,
            CachedValue::List(items) => items.join("\n"),
        })
    }

    pub fn cached_list<F>(&self, operation: &str, args: &[&str], compute: F) -> Result<Vec<String>>
    where
        F: FnOnce() -> Result<Vec<String>>,
    {
        let value = self.cached_if(
            operation,
            args,
            |v| matches!(v, CachedValue::List(_)),
            || compute().map(CachedValue::List),
        )?;
        Ok(match value {
            CachedValue::List(items) => items,
            CachedValue::Text(text) => vec![text],
        })
    }

    /// A stored value rejected by `accept` counts as a miss.
    fn cached_if<A, F>(
        &self,
        operation: &str,
        args: &[&str],
        accept: A,
        compute: F,
    ) -> Result<CachedValue>
    where
        A: Fn(&CachedValue) -> bool,
        F: FnOnce() -> Result<CachedValue>,
    {
        if self.bypassed() {
            self.observer
                .record("CACHE_BYPASS", &format!("op={operation}"));
            return compute();
        }

        let key = fingerprint(operation, args);
        if let Some(entry) = self
            .load()
            .entries
            .into_iter()
            .find(|entry| entry.key == key)
            && accept(&entry.value)
        {
            self.observer
                .record("CACHE_HIT", &format!("op={operation} key={}", &key[..12]));
            return Ok(entry.value);
        }

        self.observer
            .record("CACHE_MISS", &format!("op={operation} key={}", &key[..12]));
        let value = compute()?;
        self.insert(key, value.clone())?;
        Ok(value)
    }

    /// Reload, replace-or-append, evict oldest beyond `maxsize`, persist.
    /// Reloading after the computation keeps entries other invocations wrote
    /// while it ran.
    fn insert(&self, key: String, value: CachedValue) -> Result<()> {
        let mut file = self.load();
        file.entries.retain(|entry| entry.key != key);
        file.entries.push(CacheEntry { key, value });
        let overflow = file.entries.len().saturating_sub(self.maxsize);
        if overflow > 0 {
            file.entries.drain(..overflow);
            self.observer
                .record("CACHE_EVICT", &format!("evicted={overflow}"));
        }
        file.version = CACHE_FORMAT_VERSION;
        write_atomically(&self.path, &serde_json::to_vec(&file)?)
    }

    /// Missing, unreadable or corrupt files all load as empty.
    fn load(&self) -> CacheFile {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return CacheFile::default(),
            Err(err) => {
                self.observer.warn_log(&format!(
                    "cache file {} unreadable, treating as empty: {err}",
                    self.path.display()
                ));
                return CacheFile::default();
            }
        };
        match serde_json::from_slice::<CacheFile>(&raw) {
            Ok(file) => file,
            Err(err) => {
                self.observer.warn_log(&format!(
                    "cache file {} is corrupt, treating as empty: {err}",
                    self.path.display()
                ));
                CacheFile::default()
            }
        }
    }

    /// Number of persisted entries.
    pub fn len(&self) -> usize {
        self.load().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `(operation, args)` currently has a stored result.
    pub fn contains(&self, operation: &str, args: &[&str]) -> bool {
        let key = fingerprint(operation, args);
        self.load().entries.iter().any(|entry| entry.key == key)
    }

    /// Delete the whole cache file. Returns whether a file was removed.
    pub fn clear(&self) -> Result<bool> {
        remove_if_present(&self.path)
    }
}
