// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Explicit per-tier prompt assembly.
//!
//! Replaces string concatenation with a value type whose segments can be
//! asserted independently: [`PromptBuilder`]. Each segment is built by its
//! own function, matching the teacher's section-builder-function pattern.
use chrono::Utc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Tier1,
    Tier2,
    Worker,
}

/// A single registered tool's name and one-line purpose, as surfaced to the model.
#[derive(Debug, Clone)]
pub struct ToolSummary {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Default)]
pub struct PromptBuilder {
    pub persona: String,
    pub core_memory: String,
    pub capability_manifest: String,
    pub time_context: String,
    pub tier_tail: String,
}

impl PromptBuilder {
    /// Assemble the final system prompt text in the fixed order from §4.4:
    /// persona, core working memory, capability manifest, per-tier tail.
    pub fn render(&self) -> String {
        let mut sections = vec![self.persona.clone()];
        if !self.core_memory.is_empty() {
            sections.push(format!("## Core Working Memory\n\n{}", self.core_memory));
        }
        if !self.capability_manifest.is_empty() {
            sections.push(self.capability_manifest.clone());
        }
        if !self.tier_tail.is_empty() {
            sections.push(self.tier_tail.clone());
        }
        sections.join("\n\n")
    }
}

const BASE_PERSONA: &str =
    "You are a background agent daemon serving a single local user. \
     You execute tool calls, answer questions, and keep a running awareness \
     of scheduled and background work. Be direct and concise.";

/// Core Working Memory: the full contents of a small user-editable text
/// file, capped at `cap_tokens` (≈ 4 chars/token), truncated from the tail
/// since the most recently edited content sits at the top of the file.
pub fn build_core_memory_section(raw: &str, cap_tokens: usize) -> String {
    let cap_chars = cap_tokens * 4;
    if raw.len() <= cap_chars {
        raw.to_string()
    } else {
        format!("{}\n[... core memory truncated to fit budget ...]", &raw[..cap_chars])
    }
}

/// Capability Manifest: enumerate every registered tool's name and one-line
/// purpose so the model "knows itself".
pub fn build_capability_manifest(tools: &[ToolSummary]) -> String {
    if tools.is_empty() {
        return String::new();
    }
    let mut out = String::from("## Available Tools\n\n");
    for tool in tools {
        out.push_str(&format!("- `{}` — {}\n", tool.name, tool.description));
    }
    out
}

/// Tier 1 tail: terse, explicitly refuses code generation, optionally
/// surfaces distilled tier-2 "wisdom" so it can mimic past deep reasoning.
pub fn tier1_tail(wisdom: &[String]) -> String {
    let mut out = String::from(
        "You are the fast local tier. Keep answers short. \
         Do not write or generate code — escalate to the deep tier for that.",
    );
    if !wisdom.is_empty() {
        out.push_str("\n\n## Past deep-tier reasoning\n\n");
        for w in wisdom {
            out.push_str(&format!("- {w}\n"));
        }
    }
    out
}

/// Tier 2 tail: lists long-term memory categories and binds the current time.
pub fn tier2_tail(memory_categories: &[String]) -> String {
    let mut out = String::from("You are the deep cloud tier. You may write code, plan, and use tools freely.");
    if !memory_categories.is_empty() {
        out.push_str(&format!(
            "\n\nLong-term memory categories available via search: {}",
            memory_categories.join(", ")
        ));
    }
    out.push_str(&format!("\n\nCurrent time: {}", Utc::now().to_rfc3339()));
    out
}

/// Worker tail: a minimal tail for the background worker-engine backend,
/// which has no interactive tier tail requirements of its own.
pub fn worker_tail() -> String {
    "You are the background worker tier, processing a queued task with no user present.".to_string()
}

pub fn build_prompt(
    tier: Tier,
    core_memory: &str,
    core_memory_cap_tokens: usize,
    tools: &[ToolSummary],
    wisdom: &[String],
    memory_categories: &[String],
) -> PromptBuilder {
    let tier_tail = match tier {
        Tier::Tier1 => tier1_tail(wisdom),
        Tier::Tier2 => tier2_tail(memory_categories),
        Tier::Worker => worker_tail(),
    };
    PromptBuilder {
        persona: BASE_PERSONA.to_string(),
        core_memory: build_core_memory_section(core_memory, core_memory_cap_tokens),
        capability_manifest: build_capability_manifest(tools),
        time_context: Utc::now().to_rfc3339(),
        tier_tail,
    }
}
