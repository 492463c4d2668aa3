//! Per-agent chat history (JSON, locked) and agent memory (markdown, unlocked since only the
//! single in-flight run for that agent ever writes it).

use std::path::{Path, PathBuf};

use tayfa_store::{atomic_write_file, LockedJsonStore};
use tayfa_types::{
    append_chat_entry_bounded, push_memory_section, ChatHistoryEntry, MemorySection, Result,
};

#[derive(Clone)]
pub struct HistoryStore {
    store: LockedJsonStore,
    state_dir: PathBuf,
}

impl HistoryStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            store: LockedJsonStore::new(),
            state_dir: state_dir.into(),
        }
    }

    fn chat_history_path(&self, agent: &str) -> PathBuf {
        self.state_dir.join("chat_history").join(format!("{agent}.json"))
    }

    /// Appends one invocation record to `agent`'s chat history, trimming to
    /// [`tayfa_types::MAX_CHAT_HISTORY`].
    pub async fn append_chat_entry(&self, agent: &str, entry: ChatHistoryEntry) -> Result<()> {
        let path = self.chat_history_path(agent);
        self.store
            .update(&path, Vec::new(), move |mut log: Vec<ChatHistoryEntry>| {
                append_chat_entry_bounded(&mut log, entry.clone());
                log
            })
            .await?;
        Ok(())
    }
}

fn memory_path(workdir: &str, agent: &str) -> PathBuf {
    Path::new(workdir).join(".tayfa").join(agent).join("memory.md")
}

/// Reads `agent`'s memory file under `workdir`, returning an empty string if it doesn't exist
/// yet (a brand-new agent has no history to inject).
pub async fn read_memory(workdir: &str, agent: &str) -> String {
    let path = memory_path(workdir, agent);
    tokio::fs::read_to_string(&path).await.unwrap_or_default()
}

/// Prepends `section` to the agent's memory file, trimming to
/// [`tayfa_types::MAX_MEMORY_ENTRIES`], and atomically rewrites the file.
pub async fn append_memory_section(workdir: &str, agent: &str, section: MemorySection) -> Result<()> {
    let path = memory_path(workdir, agent);
    let existing = tokio::fs::read_to_string(&path).await.unwrap_or_default();
    let updated = push_memory_section(&existing, section);
    atomic_write_file(&path, updated.as_bytes()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tayfa_types::ErrorType;

    #[tokio::test]
    async fn chat_history_appends_and_trims() {
        let dir = tempfile::tempdir().unwrap();
        let history = HistoryStore::new(dir.path());
        for i in 0..3 {
            history
                .append_chat_entry(
                    "dev",
                    ChatHistoryEntry {
                        timestamp: chrono::Utc::now(),
                        prompt: format!("prompt {i}"),
                        result: "ok".into(),
                        model: "sonnet".into(),
                        cost_usd: 0.01,
                        duration_sec: 1.0,
                        num_turns: 1,
                        task_id: "T001".into(),
                        success: true,
                        error_type: None,
                        session_id: None,
                    },
                )
                .await
                .unwrap();
        }
        let path = history.chat_history_path("dev");
        let log: Vec<ChatHistoryEntry> = history.store.read(&path, Vec::new()).await.unwrap();
        assert_eq!(log.len(), 3);
    }

    #[tokio::test]
    async fn memory_round_trips_through_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let workdir = dir.path().to_str().unwrap();
        append_memory_section(workdir, "dev", MemorySection::summary("did a thing", "ctx"))
            .await
            .unwrap();
        let rendered = read_memory(workdir, "dev").await;
        assert!(rendered.contains("did a thing"));
    }

    #[test]
    fn error_type_is_serializable_for_chat_history() {
        let entry_error = Some(ErrorType::Timeout);
        assert!(entry_error.is_some());
    }
}
