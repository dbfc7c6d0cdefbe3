use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tracing::warn;

pub const DEFAULT_HISTORY_FILE_PATH: &str = "~/.promptline_history";
pub const DEFAULT_HISTORY_SIZE: usize = 50;

/// The most recent prompts, oldest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct History {
    #[serde(skip)]
    path: Option<PathBuf>,
    #[serde(skip)]
    limit: usize,
    entries: VecDeque<String>,
}

impl History {
    pub fn in_memory(limit: usize) -> Self {
        History {
            path: None,
            limit: limit.max(1),
            entries: VecDeque::new(),
        }
    }

    /// Loads the history file, starting empty if it does not exist yet.
    pub fn load(file_path: &str, limit: usize) -> Result<Self> {
        let path = PathBuf::from(shellexpand::tilde(file_path).to_string());
        let mut history = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read history file {}", path.display()))?;
            serde_json::from_str::<History>(&content)
                .with_context(|| format!("Corrupt history file {}", path.display()))?
        } else {
            History::in_memory(limit)
        };

        history.path = Some(path);
        history.limit = limit.max(1);
        history.trim();
        Ok(history)
    }

    /// Like `load`, but an unreadable file leaves the chat with a history kept in memory only.
    /// The file is not touched so it can be repaired by hand.
    pub fn open(file_path: &str, limit: usize) -> Self {
        History::load(file_path, limit).unwrap_or_else(|e| {
            warn!("{e:#}; history will not be saved this session");
            History::in_memory(limit)
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn entries(&self) -> impl Iterator<Item = &String> {
        self.entries.iter()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&String> {
        self.entries.back()
    }

    /// Records a prompt. A repeat of the latest entry is not stored twice.
    pub fn push(&mut self, prompt: &str) -> Result<()> {
        let prompt = prompt.trim();
        if prompt.is_empty() || self.last().map(String::as_str) == Some(prompt) {
            return Ok(());
        }
        self.entries.push_back(prompt.to_string());
        self.trim();
        self.save()
    }

    pub fn clear(&mut self) -> Result<()> {
        self.entries.clear();
        self.save()
    }

    fn trim(&mut self) {
        while self.entries.len() > self.limit {
            self.entries.pop_front();
        }
    }

    fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write history file {}", path.display()))
    }
}
