// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The memory interface the router depends on (implementation-supplied:
//! on-disk vector memory is out of scope here). A deterministic in-memory
//! stub is provided for tests and for running without a real backend.
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub struct MemoryChunk {
    pub category: String,
    pub content: String,
    pub score: f32,
}

#[async_trait]
pub trait MemoryInterface: Send + Sync {
    async fn search_memory(&self, category: &str, query: &str, k: usize) -> anyhow::Result<Vec<MemoryChunk>>;
    async fn memorize(&self, category: &str, content: &str) -> anyhow::Result<()>;
    async fn cognitive_map(&self) -> anyhow::Result<Vec<String>>;
    async fn forget_memory(&self, category: &str, content_match: &str) -> anyhow::Result<usize>;
}

/// Deterministic substring-scored in-memory store. Good enough to exercise
/// Auto-RAG and wisdom-distillation semantics without a real vector index.
#[derive(Default)]
pub struct InMemoryMemory {
    store: Mutex<HashMap<String, Vec<String>>>,
}

impl InMemoryMemory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MemoryInterface for InMemoryMemory {
    async fn search_memory(&self, category: &str, query: &str, k: usize) -> anyhow::Result<Vec<MemoryChunk>> {
        let store = self.store.lock().await;
        let Some(items) = store.get(category) else { return Ok(vec![]) };
        let query_words: Vec<&str> = query.split_whitespace().collect();
        let mut scored: Vec<MemoryChunk> = items
            .iter()
            .map(|content| {
                let score = query_words
                    .iter()
                    .filter(|w| content.to_lowercase().contains(&w.to_lowercase()))
                    .count() as f32;
                MemoryChunk { category: category.to_string(), content: content.clone(), score }
            })
            .filter(|c| c.score > 0.0)
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }

    async fn memorize(&self, category: &str, content: &str) -> anyhow::Result<()> {
        self.store
            .lock()
            .await
            .entry(category.to_string())
            .or_default()
            .push(content.to_string());
        Ok(())
    }

    async fn cognitive_map(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.store.lock().await.keys().cloned().collect())
    }

    async fn forget_memory(&self, category: &str, content_match: &str) -> anyhow::Result<usize> {
        let mut store = self.store.lock().await;
        let Some(items) = store.get_mut(category) else { return Ok(0) };
        let before = items.len();
        items.retain(|c| !c.contains(content_match));
        Ok(before - items.len())
    }
}

/// Auto-RAG pre-injection (§4.4): for every known category, fetch the top-K
/// most similar chunks (K≤2), take the global top N (N=3), and prepend a
/// labelled context block to `user_message`. Never fails the pipeline — any
/// retrieval error falls through with the original message unchanged.
pub async fn auto_rag_prepend(
    memory: &dyn MemoryInterface,
    user_message: &str,
    top_k_per_category: usize,
    top_n_global: usize,
) -> String {
    let categories = match memory.cognitive_map().await {
        Ok(c) => c,
        Err(_) => return user_message.to_string(),
    };
    let mut all_chunks = Vec::new();
    for category in categories {
        if let Ok(chunks) = memory.search_memory(&category, user_message, top_k_per_category).await {
            all_chunks.extend(chunks);
        }
    }
    if all_chunks.is_empty() {
        return user_message.to_string();
    }
    all_chunks.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    all_chunks.truncate(top_n_global);

    let mut blocks = String::new();
    for chunk in &all_chunks {
        blocks.push_str(&format!("[{}] {}\n", chunk.category, chunk.content));
    }
    format!("{blocks}\n{user_message}")
}

pub const WISDOM_CATEGORY: &str = "cloud_wisdom";

/// Post-stream distillation (§4.4): if a tier-2 response was long or any
/// tool was called, fire-and-forget a wisdom record for tier-1 reuse.
pub async fn distill_wisdom(memory: &dyn MemoryInterface, prompt: &str, full_text: &str, any_tool_called: bool, min_chars: usize) {
    if full_text.len() < min_chars && !any_tool_called {
        return;
    }
    let record = format!("When asked to: \"{prompt}\", the optimal approach is:\n{full_text}");
    let _ = memory.memorize(WISDOM_CATEGORY, &record).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn search_memory_empty_category_returns_empty() {
        let mem = InMemoryMemory::new();
        let chunks = mem.search_memory("nope", "hello", 2).await.unwrap();
        assert!(chunks.is_empty());
    }

    #[tokio::test]
    async fn memorize_then_search_finds_matching_substring() {
        let mem = InMemoryMemory::new();
        mem.memorize("docs", "rust ownership explained").await.unwrap();
        mem.memorize("docs", "unrelated gardening tips").await.unwrap();
        let chunks = mem.search_memory("docs", "rust ownership", 2).await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].content.contains("ownership"));
    }

    #[tokio::test]
    async fn auto_rag_prepends_matching_chunks() {
        let mem = InMemoryMemory::new();
        mem.memorize("project", "the build uses cargo workspaces").await.unwrap();
        let out = auto_rag_prepend(&mem, "how do cargo workspaces work", 2, 3).await;
        assert!(out.contains("[project]"));
        assert!(out.ends_with("how do cargo workspaces work"));
    }

    #[tokio::test]
    async fn auto_rag_passes_through_on_no_matches() {
        let mem = InMemoryMemory::new();
        let out = auto_rag_prepend(&mem, "hello", 2, 3).await;
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn auto_rag_passes_through_on_empty_memory_without_failing() {
        let mem = InMemoryMemory::new();
        mem.memorize("x", "irrelevant").await.unwrap();
        let out = auto_rag_prepend(&mem, "completely unrelated query", 2, 3).await;
        assert_eq!(out, "completely unrelated query");
    }

    #[tokio::test]
    async fn distill_wisdom_skips_short_untooled_responses() {
        let mem = InMemoryMemory::new();
        distill_wisdom(&mem, "hi", "short reply", false, 800).await;
        assert!(mem.cognitive_map().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn distill_wisdom_stores_long_responses() {
        let mem = InMemoryMemory::new();
        let long = "x".repeat(900);
        distill_wisdom(&mem, "explain", &long, false, 800).await;
        let chunks = mem.search_memory(WISDOM_CATEGORY, "explain", 1).await.unwrap();
        assert_eq!(chunks.len(), 1);
    }

    #[tokio::test]
    async fn distill_wisdom_stores_when_tool_was_called_even_if_short() {
        let mem = InMemoryMemory::new();
        distill_wisdom(&mem, "run it", "ok done", true, 800).await;
        let chunks = mem.search_memory(WISDOM_CATEGORY, "run", 1).await.unwrap();
        assert_eq!(chunks.len(), 1);
    }

    #[tokio::test]
    async fn forget_memory_removes_matching_entries() {
        let mem = InMemoryMemory::new();
        mem.memorize("docs", "keep this").await.unwrap();
        mem.memorize("docs", "drop this one").await.unwrap();
        let removed = mem.forget_memory("docs", "drop").await.unwrap();
        assert_eq!(removed, 1);
    }
}
