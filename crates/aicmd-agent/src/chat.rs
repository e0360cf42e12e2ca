use aicmd_core::{ChatMessage, LlmConfig, Platform};
use aicmd_llm::{LlmClient, chat_request};
use aicmd_observe::Observer;
use aicmd_store::{ConversationStore, ensure_system_preamble};
use anyhow::Result;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Line-oriented terminal for the chat loop.
pub trait ChatIo {
    /// Next user line, or `None` at end of input.
    fn read_line(&mut self) -> Result<Option<String>>;
    fn show_reply(&mut self, reply: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatEnd {
    /// `exit`, `quit` or end of input.
    Finished,
    /// The interrupt flag was raised; history is saved.
    Interrupted,
}

/// Multi-turn conversation persisted through a [`ConversationStore`].
pub struct ChatSession<'a> {
    llm: &'a dyn LlmClient,
    store: &'a ConversationStore,
    platform: &'a Platform,
    temperature: f32,
    max_tokens: u32,
    observer: Arc<Observer>,
    interrupted: Option<Arc<AtomicBool>>,
}

impl<'a> ChatSession<'a> {
    pub fn new(
        llm: &'a dyn LlmClient,
        store: &'a ConversationStore,
        platform: &'a Platform,
        cfg: &LlmConfig,
        observer: Arc<Observer>,
    ) -> Self {
        Self {
            llm,
            store,
            platform,
            temperature: cfg.chat_temperature,
            max_tokens: cfg.chat_max_tokens,
            observer,
            interrupted: None,
        }
    }

    pub fn with_interrupt_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupted = Some(flag);
        self
    }

    fn interrupted(&self) -> bool {
        self.interrupted
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    pub fn run(&self, io: &mut dyn ChatIo) -> Result<ChatEnd> {
        let mut turns = self.store.load_for_chat(self.platform);
        loop {
            if self.interrupted() {
                return Ok(ChatEnd::Interrupted);
            }
            let Some(line) = io.read_line()? else {
                return Ok(ChatEnd::Finished);
            };
            if self.interrupted() {
                return Ok(ChatEnd::Interrupted);
            }
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if matches!(line.to_ascii_lowercase().as_str(), "exit" | "quit") {
                return Ok(ChatEnd::Finished);
            }
            let reply = self.exchange(&mut turns, line)?;
            io.show_reply(&reply);
        }
    }

    /// One round trip. Both turns are saved before this returns; a failed
    /// chat call leaves the user turn saved.
    pub fn exchange(&self, turns: &mut Vec<ChatMessage>, line: &str) -> Result<String> {
        ensure_system_preamble(turns, self.platform);
        self.store.append_and_save(turns, ChatMessage::user(line))?;
        let reply = self
            .llm
            .chat(&chat_request(turns, self.temperature, self.max_tokens))?;
        self.store
            .append_and_save(turns, ChatMessage::assistant(reply.clone()))?;
        self.observer
            .record("CHAT_TURN", &format!("turns={}", turns.len()));
        Ok(reply)
    }
}
