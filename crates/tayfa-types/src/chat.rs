use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorType;

/// The cap on chat-history entries kept per agent (oldest dropped first on append).
pub const MAX_CHAT_HISTORY: usize = 1000;

/// The cap on memory sections kept in an agent's `memory.md` (oldest dropped first on append).
pub const MAX_MEMORY_ENTRIES: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatHistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub prompt: String,
    pub result: String,
    pub model: String,
    pub cost_usd: f64,
    pub duration_sec: f64,
    pub num_turns: u32,
    pub task_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<ErrorType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

pub fn append_chat_entry_bounded(log: &mut Vec<ChatHistoryEntry>, entry: ChatHistoryEntry) {
    log.push(entry);
    if log.len() > MAX_CHAT_HISTORY {
        let overflow = log.len() - MAX_CHAT_HISTORY;
        log.drain(0..overflow);
    }
}

/// A single newest-first timestamped section of an agent's memory file.
#[derive(Debug, Clone)]
pub struct MemorySection {
    pub timestamp: DateTime<Utc>,
    pub heading: String,
    pub body: String,
}

impl MemorySection {
    pub fn render(&self) -> String {
        format!(
            "## {} — {}\n{}\n",
            self.timestamp.to_rfc3339(),
            self.heading,
            self.body.trim()
        )
    }

    pub fn interrupted(error: &str, traceback: Option<&str>) -> Self {
        let mut body = format!("Run was interrupted: {error}");
        if let Some(tb) = traceback {
            body.push_str("\n\n```\n");
            body.push_str(tb);
            body.push_str("\n```\n");
        }
        Self {
            timestamp: Utc::now(),
            heading: "INTERRUPTED".to_string(),
            body,
        }
    }

    pub fn summary(summary: &str, context: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            heading: "Summary".to_string(),
            body: format!("{summary}\n\n### Context\n{context}"),
        }
    }
}

/// Parses the newest-first sections out of a rendered memory file.
pub fn parse_memory_sections(markdown: &str) -> Vec<MemorySection> {
    let mut sections = Vec::new();
    for block in markdown.split("\n## ").filter(|b| !b.trim().is_empty()) {
        let block = block.strip_prefix("## ").unwrap_or(block);
        let Some((header, body)) = block.split_once('\n') else {
            continue;
        };
        let Some((ts_str, heading)) = header.split_once(" — ") else {
            continue;
        };
        let Ok(timestamp) = DateTime::parse_from_rfc3339(ts_str.trim()) else {
            continue;
        };
        sections.push(MemorySection {
            timestamp: timestamp.with_timezone(&Utc),
            heading: heading.trim().to_string(),
            body: body.trim().to_string(),
        });
    }
    sections
}

/// Prepends `section` and trims to `MAX_MEMORY_ENTRIES`, rendering back to markdown.
pub fn push_memory_section(existing: &str, section: MemorySection) -> String {
    let mut sections = parse_memory_sections(existing);
    sections.insert(0, section);
    sections.truncate(MAX_MEMORY_ENTRIES);
    sections
        .iter()
        .map(MemorySection::render)
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_sections() {
        let rendered = push_memory_section("", MemorySection::summary("did the thing", "ctx"));
        let parsed = parse_memory_sections(&rendered);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].heading, "Summary");
    }

    #[test]
    fn trims_to_max_entries_newest_first() {
        let mut markdown = String::new();
        for i in 0..(MAX_MEMORY_ENTRIES + 3) {
            markdown = push_memory_section(
                &markdown,
                MemorySection::summary(&format!("entry {i}"), "ctx"),
            );
        }
        let parsed = parse_memory_sections(&markdown);
        assert_eq!(parsed.len(), MAX_MEMORY_ENTRIES);
        assert!(parsed[0].body.contains(&format!(
            "entry {}",
            MAX_MEMORY_ENTRIES + 2
        )));
    }
}
