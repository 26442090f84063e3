// crates/lore-server/src/jsonl.rs
// Parses assistant session JSONL logs into indexable snapshots.
//
// JSONL format (one JSON object per line):
//   - user:      human prompt (string content) or tool_result (array content)
//   - assistant: text and tool_use content blocks
//   - other:     progress/system/summary entries, ignored here
// Lines that fail to parse are counted and skipped, never fatal.

use std::collections::HashMap;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

use serde::Deserialize;

use crate::db::IndexedSessionInsert;
use crate::identity;

// ---------------------------------------------------------------------------
// Raw wire shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawEntry {
    #[serde(rename = "type")]
    entry_type: Option<String>,
    message: Option<RawMessage>,
    timestamp: Option<String>,
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
    cwd: Option<String>,
    #[serde(rename = "gitBranch")]
    git_branch: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(default)]
    content: RawContent,
}

/// User prompts arrive as a bare string; assistant turns and tool results
/// arrive as block arrays.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawContent {
    Text(String),
    Blocks(Vec<RawBlock>),
}

impl Default for RawContent {
    fn default() -> Self {
        RawContent::Blocks(Vec::new())
    }
}

#[derive(Debug, Deserialize)]
struct RawBlock {
    #[serde(rename = "type")]
    block_type: Option<String>,
    text: Option<String>,
    name: Option<String>,
}

// ---------------------------------------------------------------------------
// Parsed output
// ---------------------------------------------------------------------------

/// One user-assistant pair, in encounter order.
#[derive(Debug, Clone, Default)]
pub struct Exchange {
    pub user_text: String,
    pub assistant_text: String,
    pub timestamp: Option<String>,
}

/// Everything extracted from one session file.
#[derive(Debug, Clone, Default)]
pub struct ParsedSessionFile {
    pub session_id: Option<String>,
    pub cwd: Option<String>,
    pub git_branch: Option<String>,
    pub exchanges: Vec<Exchange>,
    /// Tool name -> call count, from assistant tool_use blocks.
    pub tool_calls: HashMap<String, u64>,
    pub first_timestamp: Option<String>,
    pub last_timestamp: Option<String>,
    /// Lines that failed to parse.
    pub parse_errors: u64,
}

impl ParsedSessionFile {
    pub fn total_tool_calls(&self) -> u64 {
        self.tool_calls.values().sum()
    }
}

/// Parse a session file from disk.
pub fn parse_session_file(path: &Path) -> io::Result<ParsedSessionFile> {
    let file = std::fs::File::open(path)?;
    Ok(parse_session_lines(BufReader::new(file)))
}

/// Parse newline-delimited session records from any reader.
pub fn parse_session_lines<R: BufRead>(reader: R) -> ParsedSessionFile {
    let mut parsed = ParsedSessionFile::default();
    let mut pending_user: Option<(String, Option<String>)> = None;

    for line in reader.lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => {
                parsed.parse_errors += 1;
                continue;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let entry: RawEntry = match serde_json::from_str(&line) {
            Ok(e) => e,
            Err(_) => {
                parsed.parse_errors += 1;
                continue;
            }
        };

        if parsed.session_id.is_none() {
            parsed.session_id = entry.session_id.clone();
        }
        if parsed.cwd.is_none() {
            parsed.cwd = entry.cwd.clone();
        }
        if parsed.git_branch.is_none() {
            parsed.git_branch = entry.git_branch.clone();
        }
        if let Some(ref ts) = entry.timestamp {
            if parsed.first_timestamp.is_none() {
                parsed.first_timestamp = Some(ts.clone());
            }
            parsed.last_timestamp = Some(ts.clone());
        }

        match entry.entry_type.as_deref() {
            Some("user") => {
                let text = user_text(&entry);
                if !text.is_empty() {
                    // A dangling user turn (no assistant reply yet) closes as
                    // an exchange with an empty answer.
                    if let Some((user, timestamp)) = pending_user.take() {
                        parsed.exchanges.push(Exchange {
                            user_text: user,
                            assistant_text: String::new(),
                            timestamp,
                        });
                    }
                    pending_user = Some((text, entry.timestamp.clone()));
                }
            }
            Some("assistant") => {
                let (text, tools) = assistant_content(&entry);
                for tool in tools {
                    *parsed.tool_calls.entry(tool).or_insert(0) += 1;
                }
                match pending_user.take() {
                    Some((user, timestamp)) => {
                        parsed.exchanges.push(Exchange {
                            user_text: user,
                            assistant_text: text,
                            timestamp,
                        });
                    }
                    None => {
                        // Continuation turn: extend the previous exchange.
                        if !text.is_empty() {
                            if let Some(last) = parsed.exchanges.last_mut() {
                                if !last.assistant_text.is_empty() {
                                    last.assistant_text.push('\n');
                                }
                                last.assistant_text.push_str(&text);
                            }
                        }
                    }
                }
            }
            _ => {}
        }
    }

    if let Some((user, timestamp)) = pending_user {
        parsed.exchanges.push(Exchange {
            user_text: user,
            assistant_text: String::new(),
            timestamp,
        });
    }

    parsed
}

/// Text of a user entry: either the bare string or concatenated text
/// blocks. Tool results (array content without text blocks) come back
/// empty and are not treated as prompts.
fn user_text(entry: &RawEntry) -> String {
    match entry.message.as_ref().map(|m| &m.content) {
        Some(RawContent::Text(text)) => text.trim().to_string(),
        Some(RawContent::Blocks(blocks)) => blocks
            .iter()
            .filter(|b| b.block_type.as_deref() == Some("text"))
            .filter_map(|b| b.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string(),
        None => String::new(),
    }
}

/// Text and tool names of an assistant entry.
fn assistant_content(entry: &RawEntry) -> (String, Vec<String>) {
    let mut texts = Vec::new();
    let mut tools = Vec::new();
    if let Some(RawContent::Blocks(blocks)) = entry.message.as_ref().map(|m| &m.content) {
        for block in blocks {
            match block.block_type.as_deref() {
                Some("text") => {
                    if let Some(ref text) = block.text {
                        texts.push(text.as_str());
                    }
                }
                Some("tool_use") => {
                    if let Some(ref name) = block.name {
                        tools.push(name.clone());
                    }
                }
                _ => {}
            }
        }
    }
    (texts.join("\n").trim().to_string(), tools)
}

/// Turn a parsed file into an indexable snapshot. The content column is the
/// concatenated exchange text; the project id derives from the session cwd.
pub fn to_indexed_session(
    parsed: &ParsedSessionFile,
    workstation_id: &str,
    file_mtime: Option<i64>,
) -> IndexedSessionInsert {
    let mut content = String::new();
    for exchange in &parsed.exchanges {
        if !content.is_empty() {
            content.push('\n');
        }
        content.push_str(&exchange.user_text);
        if !exchange.assistant_text.is_empty() {
            content.push('\n');
            content.push_str(&exchange.assistant_text);
        }
    }

    IndexedSessionInsert {
        workstation_id: workstation_id.to_string(),
        project_id: identity::project_id(parsed.cwd.as_deref().unwrap_or("")),
        session_id: parsed.session_id.clone().unwrap_or_default(),
        exchange_count: parsed.exchanges.len() as i64,
        tool_call_count: parsed.total_tool_calls() as i64,
        file_mtime,
        content,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const SAMPLE: &str = r#"{"type":"user","message":{"content":"why does the test hang"},"timestamp":"2026-07-01T10:00:00Z","sessionId":"sess-1","cwd":"/home/u/proj","gitBranch":"main"}
{"type":"assistant","message":{"content":[{"type":"text","text":"Looking at the runner."},{"type":"tool_use","name":"read_file"}]},"timestamp":"2026-07-01T10:00:05Z","sessionId":"sess-1"}
{"type":"user","message":{"content":[{"type":"tool_result"}]},"timestamp":"2026-07-01T10:00:06Z"}
{"type":"assistant","message":{"content":[{"type":"text","text":"The runner waits on a closed channel."},{"type":"tool_use","name":"read_file"},{"type":"tool_use","name":"grep"}]},"timestamp":"2026-07-01T10:00:09Z"}
not valid json at all
{"type":"user","message":{"content":"fix it"},"timestamp":"2026-07-01T10:01:00Z"}
"#;

    #[test]
    fn parses_exchanges_in_encounter_order() {
        let parsed = parse_session_lines(Cursor::new(SAMPLE));

        assert_eq!(parsed.session_id.as_deref(), Some("sess-1"));
        assert_eq!(parsed.cwd.as_deref(), Some("/home/u/proj"));
        assert_eq!(parsed.git_branch.as_deref(), Some("main"));
        assert_eq!(parsed.parse_errors, 1);

        // Two exchanges: the answered question and the trailing prompt
        assert_eq!(parsed.exchanges.len(), 2);
        assert_eq!(parsed.exchanges[0].user_text, "why does the test hang");
        assert!(parsed.exchanges[0]
            .assistant_text
            .contains("Looking at the runner."));
        // The continuation assistant turn extended the same exchange
        assert!(parsed.exchanges[0]
            .assistant_text
            .contains("waits on a closed channel"));
        assert_eq!(parsed.exchanges[1].user_text, "fix it");
        assert!(parsed.exchanges[1].assistant_text.is_empty());
    }

    #[test]
    fn tool_usage_is_counted_per_name() {
        let parsed = parse_session_lines(Cursor::new(SAMPLE));
        assert_eq!(parsed.tool_calls.get("read_file"), Some(&2));
        assert_eq!(parsed.tool_calls.get("grep"), Some(&1));
        assert_eq!(parsed.total_tool_calls(), 3);
    }

    #[test]
    fn timestamps_track_first_and_last() {
        let parsed = parse_session_lines(Cursor::new(SAMPLE));
        assert_eq!(
            parsed.first_timestamp.as_deref(),
            Some("2026-07-01T10:00:00Z")
        );
        assert_eq!(
            parsed.last_timestamp.as_deref(),
            Some("2026-07-01T10:01:00Z")
        );
    }

    #[test]
    fn malformed_lines_are_skipped_not_fatal() {
        let garbage = "not json\n{broken\n\n";
        let parsed = parse_session_lines(Cursor::new(garbage));
        assert_eq!(parsed.parse_errors, 2);
        assert!(parsed.exchanges.is_empty());
    }

    #[test]
    fn indexed_snapshot_carries_counts_and_content() {
        let parsed = parse_session_lines(Cursor::new(SAMPLE));
        let insert = to_indexed_session(&parsed, "aabbccdd", Some(1234));

        assert_eq!(insert.workstation_id, "aabbccdd");
        assert_eq!(insert.project_id, identity::project_id("/home/u/proj"));
        assert_eq!(insert.session_id, "sess-1");
        assert_eq!(insert.exchange_count, 2);
        assert_eq!(insert.tool_call_count, 3);
        assert_eq!(insert.file_mtime, Some(1234));
        assert!(insert.content.contains("why does the test hang"));
        assert!(insert.content.contains("fix it"));
    }
}
