//! Test doubles shared by the workspace: a scripted completion/chat client
//! and a scratch state directory wired to a silent observer.

use aicmd_core::{ChatRequest, CompletionRequest, Platform};
use aicmd_llm::LlmClient;
use aicmd_observe::Observer;
use aicmd_store::{ConversationStore, ResultCache};
use anyhow::{Result, anyhow};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

enum Scripted<T> {
    Reply(T),
    Fail(String),
}

#[derive(Default)]
struct ScriptState {
    completions: VecDeque<Scripted<Vec<String>>>,
    chats: VecDeque<Scripted<String>>,
    completion_requests: Vec<CompletionRequest>,
    chat_requests: Vec<ChatRequest>,
}

/// An `LlmClient` that replays queued replies in order and records every
/// request it receives. An exhausted queue is an error.
#[derive(Default)]
pub struct ScriptedLlm {
    state: Mutex<ScriptState>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one completion reply holding a single choice.
    pub fn with_completion(self, text: impl Into<String>) -> Self {
        self.with_choices(vec![text.into()])
    }

    /// Queue one completion reply holding several choices.
    pub fn with_choices<I, S>(self, choices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.push_completion(Scripted::Reply(choices.into_iter().map(Into::into).collect()));
        self
    }

    pub fn with_completion_failure(self, message: impl Into<String>) -> Self {
        self.push_completion(Scripted::Fail(message.into()));
        self
    }

    pub fn with_chat(self, reply: impl Into<String>) -> Self {
        self.push_chat(Scripted::Reply(reply.into()));
        self
    }

    pub fn with_chat_failure(self, message: impl Into<String>) -> Self {
        self.push_chat(Scripted::Fail(message.into()));
        self
    }

    fn push_completion(&self, item: Scripted<Vec<String>>) {
        if let Ok(mut guard) = self.state.lock() {
            guard.completions.push_back(item);
        }
    }

    fn push_chat(&self, item: Scripted<String>) {
        if let Ok(mut guard) = self.state.lock() {
            guard.chats.push_back(item);
        }
    }

    pub fn completion_calls(&self) -> usize {
        self.state
            .lock()
            .map(|guard| guard.completion_requests.len())
            .unwrap_or_default()
    }

    pub fn chat_calls(&self) -> usize {
        self.state
            .lock()
            .map(|guard| guard.chat_requests.len())
            .unwrap_or_default()
    }

    pub fn completion_requests(&self) -> Vec<CompletionRequest> {
        self.state
            .lock()
            .map(|guard| guard.completion_requests.clone())
            .unwrap_or_default()
    }

    pub fn chat_requests(&self) -> Vec<ChatRequest> {
        self.state
            .lock()
            .map(|guard| guard.chat_requests.clone())
            .unwrap_or_default()
    }
}

impl LlmClient for ScriptedLlm {
    fn complete(&self, req: &CompletionRequest) -> Result<Vec<String>> {
        let mut guard = self
            .state
            .lock()
            .map_err(|_| anyhow!("scripted llm mutex poisoned"))?;
        guard.completion_requests.push(req.clone());
        match guard.completions.pop_front() {
            Some(Scripted::Reply(choices)) => Ok(choices),
            Some(Scripted::Fail(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("scripted llm exhausted (completion)")),
        }
    }

    fn chat(&self, req: &ChatRequest) -> Result<String> {
        let mut guard = self
            .state
            .lock()
            .map_err(|_| anyhow!("scripted llm mutex poisoned"))?;
        guard.chat_requests.push(req.clone());
        match guard.chats.pop_front() {
            Some(Scripted::Reply(reply)) => Ok(reply),
            Some(Scripted::Fail(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("scripted llm exhausted (chat)")),
        }
    }
}

/// Throwaway state directory with stores pointed at it.
pub struct ScratchState {
    dir: TempDir,
    observer: Arc<Observer>,
}

impl ScratchState {
    pub fn new() -> Result<Self> {
        Ok(Self {
            dir: tempfile::tempdir()?,
            observer: Arc::new(Observer::silent()),
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn observer(&self) -> Arc<Observer> {
        Arc::clone(&self.observer)
    }

    /// A cache that ignores `AICMD_NO_CACHE` so tests are not affected by
    /// the caller's environment.
    pub fn cache(&self, maxsize: usize) -> ResultCache {
        ResultCache::new(self.path(), maxsize, self.observer()).with_bypass(false)
    }

    pub fn history(&self, limit: usize, word_budget: usize) -> ConversationStore {
        ConversationStore::new(self.path(), limit, word_budget, self.observer())
    }
}

pub fn linux_bash() -> Platform {
    Platform {
        family: "linux".to_string(),
        shell: "/bin/bash".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replays_in_order_and_records_requests() {
        let llm = ScriptedLlm::new()
            .with_completion("ls")
            .with_choices(["a", "b"])
            .with_chat("hello");
        assert_eq!(
            llm.complete(&CompletionRequest::new("one")).expect("first"),
            vec!["ls"]
        );
        assert_eq!(
            llm.complete(&CompletionRequest::new("two")).expect("second"),
            vec!["a", "b"]
        );
        assert!(llm.complete(&CompletionRequest::new("three")).is_err());
        assert_eq!(llm.completion_calls(), 3);
        assert_eq!(llm.completion_requests()[1].prompt, "two");

        let req = ChatRequest {
            messages: Vec::new(),
            temperature: None,
            max_tokens: 16,
        };
        assert_eq!(llm.chat(&req).expect("chat"), "hello");
        assert_eq!(llm.chat_calls(), 1);
    }

    #[test]
    fn scripted_failures_surface_as_errors() {
        let llm = ScriptedLlm::new().with_completion_failure("service down");
        let err = llm
            .complete(&CompletionRequest::new("q"))
            .expect_err("scripted failure");
        assert!(err.to_string().contains("service down"));
    }

    #[test]
    fn scratch_state_points_stores_at_temp_dir() {
        let scratch = ScratchState::new().expect("scratch");
        let cache = scratch.cache(4);
        assert!(cache.path().starts_with(scratch.path()));
        let history = scratch.history(10, 100);
        assert!(history.path().starts_with(scratch.path()));
    }
}
