//! Host-state context for command generation.
//!
//! A [`ContextCatalog`] is a fixed, ordered list of providers, each of which
//! inspects one aspect of the machine by shelling out. The
//! [`ContextSelector`] picks a provider for a query (explicitly or by asking
//! the completion service) and fetches its text through the result cache.

use aicmd_core::{AicmdError, CompletionRequest};
use aicmd_llm::LlmClient;
use aicmd_observe::Observer;
use aicmd_store::ResultCache;
use anyhow::Result;
use serde::Serialize;
use std::process::Command;
use std::sync::Arc;

pub const SELECT_CONTEXT_OP: &str = "select_context";
pub const DEFAULT_CONTEXT_CHAR_LIMIT: usize = 3000;
const SELECT_MAX_TOKENS: u32 = 8;

pub type ContextSource = Box<dyn Fn() -> String + Send + Sync>;

pub struct ContextProvider {
    index: usize,
    name: String,
    source: ContextSource,
}

impl ContextProvider {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the provider. Never fails: problems become part of the text.
    pub fn collect(&self) -> String {
        (self.source)()
    }
}

impl std::fmt::Debug for ContextProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextProvider")
            .field("index", &self.index)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Catalog entry as listed by `ai --list-context`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderSummary {
    pub index: usize,
    pub name: String,
}

/// Immutable, ordered registry of context providers.
#[derive(Debug)]
pub struct ContextCatalog {
    providers: Vec<ContextProvider>,
}

impl ContextCatalog {
    /// Build a catalog from `(name, source)` pairs. Indices follow the order given.
    pub fn new<I, S>(sources: I) -> Self
    where
        I: IntoIterator<Item = (S, ContextSource)>,
        S: Into<String>,
    {
        let providers = sources
            .into_iter()
            .enumerate()
            .map(|(index, (name, source))| ContextProvider {
                index,
                name: name.into(),
                source,
            })
            .collect();
        Self { providers }
    }

    pub fn builtin() -> Self {
        let table: [(&str, &'static str, &'static [&'static str]); 7] = [
            ("files", "ls", &["-la"]),
            ("processes", "ps", &["aux"]),
            ("users", "getent", &["passwd"]),
            ("groups", "getent", &["group"]),
            ("interfaces", "ip", &["addr"]),
            ("routes", "ip", &["route"]),
            ("firewall", "iptables", &["-S"]),
        ];
        Self::new(table.into_iter().map(|(name, program, args)| {
            let source: ContextSource = Box::new(move || run_inspection(program, args));
            (name, source)
        }))
    }

    pub fn get(&self, index: usize) -> Option<&ContextProvider> {
        self.providers.get(index)
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.providers.iter().map(ContextProvider::name).collect()
    }

    pub fn summaries(&self) -> Vec<ProviderSummary> {
        self.providers
            .iter()
            .map(|p| ProviderSummary {
                index: p.index,
                name: p.name.clone(),
            })
            .collect()
    }

    /// Reject an explicit index that does not name a provider.
    pub fn validate_index(&self, index: usize) -> Result<(), AicmdError> {
        if index < self.len() {
            Ok(())
        } else {
            Err(AicmdError::InvalidContextIndex {
                index,
                count: self.len(),
            })
        }
    }

    /// Numbered menu shown to the completion service.
    fn menu(&self) -> String {
        self.providers
            .iter()
            .map(|p| format!("{}: {}", p.index, p.name))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Raw stdout of `program args`. A missing binary or a failing command
/// yields a one-line note instead of an error.
pub fn run_inspection(program: &str, args: &[&str]) -> String {
    let rendered = std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ");
    let Ok(output) = Command::new(program).args(args).output() else {
        return format!("{rendered}: unavailable on this host");
    };
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    if output.status.success() || !stdout.trim().is_empty() {
        return stdout;
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    format!("{rendered}: unavailable ({})", stderr.trim())
}

/// Truncate to at most `limit` characters without splitting a code point.
pub fn truncate_chars(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((byte_index, _)) => &text[..byte_index],
        None => text,
    }
}

/// Parse a selector reply into a provider index. Anything that is not a
/// single in-range integer means "no context".
pub fn parse_selection(reply: &str, count: usize) -> Option<usize> {
    let token = reply
        .split_whitespace()
        .next()?
        .trim_matches(|c: char| !(c.is_ascii_digit() || c == '-'));
    let value: i64 = token.parse().ok()?;
    usize::try_from(value).ok().filter(|index| *index < count)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextMode {
    None,
    Auto,
    Explicit(usize),
}

/// Text fetched from one provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedContext {
    pub index: usize,
    pub name: String,
    pub text: String,
}

pub struct ContextSelector<'a> {
    catalog: &'a ContextCatalog,
    cache: &'a ResultCache,
    llm: &'a dyn LlmClient,
    observer: Arc<Observer>,
    char_limit: usize,
}

impl<'a> ContextSelector<'a> {
    pub fn new(
        catalog: &'a ContextCatalog,
        cache: &'a ResultCache,
        llm: &'a dyn LlmClient,
        observer: Arc<Observer>,
    ) -> Self {
        Self {
            catalog,
            cache,
            llm,
            observer,
            char_limit: DEFAULT_CONTEXT_CHAR_LIMIT,
        }
    }

    pub fn with_char_limit(mut self, char_limit: usize) -> Self {
        self.char_limit = char_limit;
        self
    }

    /// Ask the completion service which provider fits `query`.
    pub fn select(&self, query: &str) -> Result<Option<usize>> {
        if self.catalog.is_empty() {
            return Ok(None);
        }
        let reply = self.cache.cached_text(SELECT_CONTEXT_OP, &[query], || {
            let req = CompletionRequest {
                max_tokens: SELECT_MAX_TOKENS,
                ..CompletionRequest::new(self.selection_prompt(query))
            };
            Ok(self
                .llm
                .complete(&req)?
                .into_iter()
                .next()
                .unwrap_or_default()
                .trim()
                .to_string())
        })?;
        let selected = parse_selection(&reply, self.catalog.len());
        match selected {
            Some(index) => self
                .observer
                .record("CONTEXT_SELECT", &format!("index={index}")),
            None if reply.trim() == "-1" => self.observer.record("CONTEXT_SELECT", "index=none"),
            None => self.observer.warn_log(&format!(
                "context selector returned unusable reply {reply:?}; continuing without context"
            )),
        }
        Ok(selected)
    }

    fn selection_prompt(&self, query: &str) -> String {
        format!(
            "Pick the information source that best helps write a shell command for the request below.\n\
             Reply with the number only, or -1 if none helps.\n\n{}\n\nRequest: {query}",
            self.catalog.menu()
        )
    }

    /// Run provider `index` through the cache, truncated to the char limit.
    pub fn fetch(&self, index: usize) -> Result<Option<ResolvedContext>> {
        let Some(provider) = self.catalog.get(index) else {
            return Ok(None);
        };
        let operation = format!("context:{}", provider.name());
        let limit = self.char_limit.to_string();
        let text = self.cache.cached_text(&operation, &[limit.as_str()], || {
            Ok(truncate_chars(&provider.collect(), self.char_limit).to_string())
        })?;
        Ok(Some(ResolvedContext {
            index,
            name: provider.name().to_string(),
            text,
        }))
    }

    pub fn resolve(&self, mode: ContextMode, query: &str) -> Result<Option<ResolvedContext>> {
        match mode {
            ContextMode::None => Ok(None),
            ContextMode::Auto => match self.select(query)? {
                Some(index) => self.fetch(index),
                None => Ok(None),
            },
            ContextMode::Explicit(index) => {
                self.catalog.validate_index(index)?;
                self.fetch(index)
            }
        }
    }
}
