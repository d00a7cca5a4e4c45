// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Transcript repair: keeps model-facing history legally paired and bounded.
//!
//! Two transforms run as a single pass immediately before a model call:
//!
//! 1. [`strip_oversized_tool_results`] — tool results over a character cap are
//!    rewritten to `head + notice + tail`. Non-tool messages are untouched.
//! 2. [`repair_tool_pairing`] — every tool-call block gets a matching
//!    tool-result later in the sequence (synthesizing one if missing); a
//!    tool-result whose tool-call was never emitted is dropped.
use std::collections::HashSet;

use nimbus_model::{Message, MessageContent, Role, ToolResultContent};
use nimbus_tools::OutputCategory;

/// Default cap (characters) for a single tool result before it is stripped.
pub const DEFAULT_MAX_TOOL_RESULT_CHARS: usize = 3000;

/// Canned content used for a tool-call whose result never arrived.
pub const SYNTHETIC_ERROR: &str =
    "[no result was recorded for this tool call before the turn ended]";

/// Outcome of a [`repair_tool_pairing`] pass, reported to callers for telemetry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepairReport {
    pub synthesized: usize,
    pub dropped_orphans: usize,
}

/// Deterministic, content-aware truncation used for a single tool result.
///
/// Returns `content` unchanged when it fits within `cap_tokens`. Otherwise
/// applies a category-specific extraction strategy that preserves the most
/// useful portion of the output. Dispatching on [`OutputCategory`] (not on
/// tool names) keeps this independent of the concrete tool list; each tool
/// declares its own category.
///
/// - [`OutputCategory::HeadTail`]: keep the first 60 + last 40 lines so both
///   the command preamble and the final result are visible.
/// - [`OutputCategory::MatchList`]: keep leading matches; the tail is not
///   preserved because later matches are less relevant.
/// - [`OutputCategory::FileContent`]: balanced head + tail with a separator.
/// - [`OutputCategory::Generic`]: hard-truncate at the nearest line boundary.
pub fn smart_truncate(content: &str, category: OutputCategory, cap_tokens: usize) -> String {
    if cap_tokens == 0 {
        return content.to_string();
    }
    smart_truncate_chars(content, category, cap_tokens * 4)
}

/// Byte-boundary-safe cut point at or before `index` — never lands inside a
/// multi-byte UTF-8 character.
fn floor_char_boundary(content: &str, index: usize) -> usize {
    if index >= content.len() {
        return content.len();
    }
    let mut i = index;
    while i > 0 && !content.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn smart_truncate_chars(content: &str, category: OutputCategory, cap_chars: usize) -> String {
    if content.len() <= cap_chars {
        return content.to_string();
    }
    let cap_chars = floor_char_boundary(content, cap_chars);
    let omitted_bytes = content.len().saturating_sub(cap_chars);
    match category {
        OutputCategory::HeadTail => head_tail_lines(
            content,
            cap_chars,
            60,
            40,
            &format!("[... {{lines}} lines / {omitted_bytes} bytes omitted ...]"),
        ),
        OutputCategory::MatchList => head_lines(
            content,
            cap_chars,
            &format!(
                "[... {{lines}} more matches omitted ({omitted_bytes} bytes); \
                     use a more specific pattern to see them ...]"
            ),
        ),
        OutputCategory::FileContent => head_tail_lines(
            content,
            cap_chars,
            usize::MAX,
            usize::MAX,
            &format!(
                "[... {{lines}} lines omitted ({omitted_bytes} bytes); \
                     use read_file with offset/limit to see more ...]"
            ),
        ),
        OutputCategory::Generic => {
            let cut = content[..cap_chars]
                .rfind('\n')
                .map(|p| p + 1)
                .unwrap_or(cap_chars);
            format!(
                "{}\n[... {omitted_bytes} bytes omitted; \
                 content truncated to fit context budget ...]",
                &content[..cut]
            )
        }
    }
}

/// Rewrite any tool result longer than `max_chars` using [`smart_truncate`],
/// dispatching on the category the originating tool declared (looked up via
/// `category_for`, keyed by tool name). Non-tool messages pass through
/// untouched. A result whose originating `tool-call` is missing from this
/// transcript slice falls back to `OutputCategory::Generic`.
pub fn strip_oversized_tool_results(
    messages: &mut [Message],
    max_chars: usize,
    category_for: impl Fn(&str) -> OutputCategory,
) -> usize {
    let tool_names: std::collections::HashMap<&str, &str> = messages
        .iter()
        .filter_map(|m| match &m.content {
            MessageContent::ToolCall { tool_call_id, function } => {
                Some((tool_call_id.as_str(), function.name.as_str()))
            }
            _ => None,
        })
        .collect();

    let mut stripped = 0;
    for msg in messages.iter_mut() {
        if let MessageContent::ToolResult { tool_call_id, content } = &mut msg.content {
            if let ToolResultContent::Text(text) = content {
                if text.len() > max_chars {
                    let category = tool_names
                        .get(tool_call_id.as_str())
                        .map(|name| category_for(name))
                        .unwrap_or_default();
                    *text = smart_truncate_chars(text, category, max_chars);
                    stripped += 1;
                }
            }
        }
    }
    stripped
}

/// Walk messages in order, enforcing tool-call/tool-result pairing.
///
/// Every assistant `tool-call` block must have exactly one matching
/// `tool-result` later in the sequence; missing ones get a synthetic error
/// result appended right after the message that introduced the orphan call.
/// A `tool-result` whose `tool_call_id` was never issued as a `tool-call` is
/// dropped entirely.
pub fn repair_tool_pairing(messages: Vec<Message>) -> (Vec<Message>, RepairReport) {
    let issued: HashSet<&str> = messages
        .iter()
        .filter_map(|m| match &m.content {
            MessageContent::ToolCall { tool_call_id, .. } => Some(tool_call_id.as_str()),
            _ => None,
        })
        .collect();
    let answered: HashSet<&str> = messages
        .iter()
        .filter_map(|m| match &m.content {
            MessageContent::ToolResult { tool_call_id, .. } => Some(tool_call_id.as_str()),
            _ => None,
        })
        .collect();

    let mut report = RepairReport::default();
    let mut out = Vec::with_capacity(messages.len());
    for msg in messages {
        match &msg.content {
            MessageContent::ToolResult { tool_call_id, .. } => {
                if issued.contains(tool_call_id.as_str()) {
                    out.push(msg);
                } else {
                    report.dropped_orphans += 1;
                }
            }
            MessageContent::ToolCall { tool_call_id, .. } => {
                let id = tool_call_id.clone();
                out.push(msg);
                if !answered.contains(id.as_str()) {
                    out.push(Message::tool_result(id, SYNTHETIC_ERROR));
                    report.synthesized += 1;
                }
            }
            _ => out.push(msg),
        }
    }
    (out, report)
}

/// Convenience: run both transforms in the order the router applies them.
pub fn repair_transcript(
    mut messages: Vec<Message>,
    max_tool_result_chars: usize,
    category_for: impl Fn(&str) -> OutputCategory,
) -> (Vec<Message>, usize, RepairReport) {
    let stripped = strip_oversized_tool_results(&mut messages, max_tool_result_chars, category_for);
    let (repaired, report) = repair_tool_pairing(messages);
    (repaired, stripped, report)
}

fn head_lines(content: &str, cap_chars: usize, notice_template: &str) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let mut kept = String::with_capacity(cap_chars);
    let mut kept_count = 0usize;
    for line in &lines {
        let needed = if kept.is_empty() { line.len() } else { line.len() + 1 };
        if kept.len() + needed > cap_chars {
            break;
        }
        if !kept.is_empty() {
            kept.push('\n');
        }
        kept.push_str(line);
        kept_count += 1;
    }
    let omitted = lines.len().saturating_sub(kept_count);
    if omitted == 0 {
        return content[..cap_chars.min(content.len())].to_string();
    }
    let notice = notice_template.replace("{lines}", &omitted.to_string());
    format!("{kept}\n{notice}")
}

fn head_tail_lines(
    content: &str,
    cap_chars: usize,
    max_head: usize,
    max_tail: usize,
    notice_template: &str,
) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let half_cap = cap_chars / 2;

    let mut head = String::with_capacity(half_cap);
    let mut head_count = 0usize;
    for line in lines.iter().take(max_head) {
        let needed = if head.is_empty() { line.len() } else { line.len() + 1 };
        if head.len() + needed > half_cap {
            break;
        }
        if !head.is_empty() {
            head.push('\n');
        }
        head.push_str(line);
        head_count += 1;
    }

    let mut tail_lines: Vec<&str> = Vec::new();
    let mut tail_chars = 0usize;
    for line in lines.iter().rev().take(max_tail) {
        let needed = if tail_lines.is_empty() { line.len() } else { line.len() + 1 };
        if tail_chars + needed > half_cap {
            break;
        }
        tail_chars += needed;
        tail_lines.push(line);
    }
    tail_lines.reverse();
    let tail_count = tail_lines.len();
    let tail = tail_lines.join("\n");

    let omitted = lines.len().saturating_sub(head_count + tail_count);
    if omitted == 0 {
        return content[..cap_chars.min(content.len())].to_string();
    }
    let notice = notice_template.replace("{lines}", &omitted.to_string());
    format!("{head}\n{notice}\n{tail}")
}
