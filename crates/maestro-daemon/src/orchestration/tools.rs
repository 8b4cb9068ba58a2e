//! Tool-usage tally derived from a worker transcript.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::session::TranscriptMessage;

/// Counts of tool invocations by class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolUsage {
    pub reads: u32,
    pub writes: u32,
    pub edits: u32,
    pub shell: u32,
    pub search: u32,
    pub web: u32,
    pub sub_spawns: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ToolClass {
    Read,
    Write,
    Edit,
    Shell,
    Search,
    Web,
    SubSpawn,
}

/// Tool calls rendered inline as `Name(args)`, one per line.
#[allow(clippy::unwrap_used)] // literal pattern covered by tests
static INLINE_CALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^[\s●⏺*>-]*(Read|Write|Edit|MultiEdit|NotebookEdit|Bash|Grep|Glob|LS|WebFetch|WebSearch|Task|Agent)\(",
    )
    .unwrap()
});

fn classify(name: &str) -> Option<ToolClass> {
    Some(match name {
        "Read" | "NotebookRead" => ToolClass::Read,
        "Write" => ToolClass::Write,
        "Edit" | "MultiEdit" | "NotebookEdit" => ToolClass::Edit,
        "Bash" | "BashOutput" => ToolClass::Shell,
        "Grep" | "Glob" | "LS" => ToolClass::Search,
        "WebFetch" | "WebSearch" => ToolClass::Web,
        "Task" | "Agent" => ToolClass::SubSpawn,
        _ => return None,
    })
}

impl ToolUsage {
    fn bump(&mut self, class: ToolClass) {
        let slot = match class {
            ToolClass::Read => &mut self.reads,
            ToolClass::Write => &mut self.writes,
            ToolClass::Edit => &mut self.edits,
            ToolClass::Shell => &mut self.shell,
            ToolClass::Search => &mut self.search,
            ToolClass::Web => &mut self.web,
            ToolClass::SubSpawn => &mut self.sub_spawns,
        };
        *slot = slot.saturating_add(1);
    }

    /// Recount from scratch over a full transcript.
    ///
    /// Structured `tool_use` blocks are counted by tool name; plain-text
    /// assistant messages are scanned for inline `Name(...)` call lines.
    pub fn from_transcript(messages: &[TranscriptMessage]) -> Self {
        let mut usage = Self::default();
        for message in messages.iter().filter(|m| m.is_assistant()) {
            for (_, name) in message.content.tool_uses() {
                if let Some(class) = classify(name) {
                    usage.bump(class);
                }
            }
            for caps in INLINE_CALL.captures_iter(&message.content.plain_text()) {
                if let Some(class) = caps.get(1).and_then(|m| classify(m.as_str())) {
                    usage.bump(class);
                }
            }
        }
        usage
    }

    pub const fn add(&mut self, other: &Self) {
        self.reads = self.reads.saturating_add(other.reads);
        self.writes = self.writes.saturating_add(other.writes);
        self.edits = self.edits.saturating_add(other.edits);
        self.shell = self.shell.saturating_add(other.shell);
        self.search = self.search.saturating_add(other.search);
        self.web = self.web.saturating_add(other.web);
        self.sub_spawns = self.sub_spawns.saturating_add(other.sub_spawns);
    }

    pub const fn total(&self) -> u32 {
        self.reads
            .saturating_add(self.writes)
            .saturating_add(self.edits)
            .saturating_add(self.shell)
            .saturating_add(self.search)
            .saturating_add(self.web)
            .saturating_add(self.sub_spawns)
    }
}
