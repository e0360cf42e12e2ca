use crate::{remove_if_present, write_atomically};
use aicmd_core::{ChatMessage, HISTORY_FILE, Platform};
use aicmd_observe::Observer;
use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Words across every turn except the system turn.
pub fn non_system_words(turns: &[ChatMessage]) -> usize {
    turns
        .iter()
        .filter(|turn| !turn.is_system())
        .map(|turn| word_count(turn.content()))
        .sum()
}

/// Drop the oldest non-system turns until the non-system word count fits
/// `budget`. A leading system turn is never removed.
pub fn trim_to_budget(turns: &mut Vec<ChatMessage>, budget: usize) -> usize {
    let first_removable = usize::from(turns.first().is_some_and(ChatMessage::is_system));
    let mut words = non_system_words(turns);
    let mut removed = 0;
    while words > budget && turns.len() > first_removable {
        let dropped = turns.remove(first_removable);
        if !dropped.is_system() {
            words -= word_count(dropped.content());
        }
        removed += 1;
    }
    removed
}

/// Keep only the most recent `limit` turns. A leading system turn stays at
/// index 0 and counts toward the limit.
pub fn cap_to_limit(turns: &mut Vec<ChatMessage>, limit: usize) {
    if turns.len() <= limit {
        return;
    }
    if limit > 0 && turns.first().is_some_and(ChatMessage::is_system) {
        let excess = turns.len() - limit;
        turns.drain(1..1 + excess);
    } else {
        let excess = turns.len() - limit;
        turns.drain(..excess);
    }
}

/// Ordered chat turns persisted as one JSON array, bounded by a word budget
/// and a turn limit on every save.
pub struct ConversationStore {
    path: PathBuf,
    limit: usize,
    word_budget: usize,
    observer: Arc<Observer>,
}

impl ConversationStore {
    pub fn new(
        state_dir: &Path,
        limit: usize,
        word_budget: usize,
        observer: Arc<Observer>,
    ) -> Self {
        Self {
            path: state_dir.join(HISTORY_FILE),
            limit,
            word_budget,
            observer,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn word_budget(&self) -> usize {
        self.word_budget
    }

    /// Persisted turns, or an empty history when the file is absent or unusable.
    pub fn load(&self) -> Vec<ChatMessage> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(err) => {
                self.observer.warn_log(&format!(
                    "history file {} unreadable, starting fresh: {err}",
                    self.path.display()
                ));
                return Vec::new();
            }
        };
        match serde_json::from_slice::<Vec<ChatMessage>>(&raw) {
            Ok(turns) => turns,
            Err(err) => {
                self.observer.warn_log(&format!(
                    "history file {} is corrupt, starting fresh: {err}",
                    self.path.display()
                ));
                Vec::new()
            }
        }
    }

    /// Push `new_turn`, trim to the word budget, cap to the turn limit, persist.
    pub fn append_and_save(
        &self,
        turns: &mut Vec<ChatMessage>,
        new_turn: ChatMessage,
    ) -> Result<()> {
        turns.push(new_turn);
        let removed = trim_to_budget(turns, self.word_budget);
        if removed > 0 {
            self.observer.record(
                "HISTORY_TRIM",
                &format!("removed={removed} budget={}", self.word_budget),
            );
        }
        cap_to_limit(turns, self.limit);
        self.save(turns)
    }

    pub fn save(&self, turns: &[ChatMessage]) -> Result<()> {
        write_atomically(&self.path, &serde_json::to_vec_pretty(turns)?)
    }

    /// Delete the persisted history. Deleting an absent file is not an error.
    pub fn reset(&self) -> Result<bool> {
        let removed = remove_if_present(&self.path)?;
        if removed {
            self.observer.record("HISTORY_RESET", &self.path.display().to_string());
        }
        Ok(removed)
    }
}

/// Make sure turn 0 is the one system turn. Synthesizes a platform preamble
/// when none exists and drops system turns found anywhere else. Returns
/// whether a preamble was inserted.
pub fn ensure_system_preamble(turns: &mut Vec<ChatMessage>, platform: &Platform) -> bool {
    let leading = turns.first().is_some_and(ChatMessage::is_system);
    let mut index = 0;
    turns.retain(|turn| {
        let keep = !turn.is_system() || (leading && index == 0);
        index += 1;
        keep
    });
    if leading {
        return false;
    }
    turns.insert(0, ChatMessage::system(system_preamble(platform)));
    true
}

fn system_preamble(platform: &Platform) -> String {
    format!(
        "You are a helpful assistant for the command line. {} \
         When the user asks for a command, answer with commands that work in that shell \
         and explain briefly.",
        platform.describe()
    )
}

impl ConversationStore {
    /// Load and normalize a history for a new chat session.
    pub fn load_for_chat(&self, platform: &Platform) -> Vec<ChatMessage> {
        let mut turns = self.load();
        if ensure_system_preamble(&mut turns, platform) {
            self.observer.record("HISTORY_PREAMBLE", "synthesized system turn");
        }
        turns
    }
}
