// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Candidate fallback chains and exponential backoff with jitter for model calls.
use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

use nimbus_config::ModelCandidate;
use rand::Rng;
use regex::Regex;
use tracing::{info, warn};

const COOLDOWN: Duration = Duration::from_secs(60);

/// Substrings that mark a context-overflow error. These are never retried
/// and never trigger a fallback — the caller must shrink the prompt instead.
const CONTEXT_OVERFLOW_MARKERS: &[&str] = &[
    "context length",
    "context_length_exceeded",
    "token limit",
    "maximum context",
    "too many tokens",
];

pub fn is_context_overflow(err: &anyhow::Error) -> bool {
    let msg = err.to_string().to_lowercase();
    CONTEXT_OVERFLOW_MARKERS.iter().any(|m| msg.contains(m))
}

/// One failed attempt recorded while walking the fallback chain.
#[derive(Debug, Clone)]
pub struct Attempt {
    pub provider: String,
    pub model: String,
    pub error: String,
}

/// Successful outcome of [`run_with_model_fallback`].
pub struct FallbackOutcome<T> {
    pub result: T,
    pub provider: String,
    pub model: String,
    pub attempts: Vec<Attempt>,
}

/// Tracks per-candidate cooldowns after a failed attempt, keyed by `provider/model`.
#[derive(Debug, Default)]
pub struct CooldownMap {
    unlock_at: HashMap<String, Instant>,
}

impl CooldownMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(candidate: &ModelCandidate) -> String {
        format!("{}/{}", candidate.provider, candidate.name)
    }

    pub fn is_cooling_down(&self, candidate: &ModelCandidate) -> bool {
        self.unlock_at
            .get(&Self::key(candidate))
            .is_some_and(|t| Instant::now() < *t)
    }

    pub fn cool_down(&mut self, candidate: &ModelCandidate) {
        self.unlock_at
            .insert(Self::key(candidate), Instant::now() + COOLDOWN);
    }
}

/// Retry policy for a single backend call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            min_delay: Duration::from_millis(300),
            max_delay: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

/// Returns `true` for errors worth retrying: HTTP 429, 5xx, or a handful of
/// network-level codes. `false` for 4xx and unclassified errors.
pub fn is_retryable(status: Option<u16>) -> bool {
    match status {
        Some(429) => true,
        Some(s) if (500..600).contains(&s) => true,
        Some(_) => false,
        None => false,
    }
}

fn backoff_delay(policy: &RetryPolicy, attempt: u32, retry_after: Option<Duration>) -> Duration {
    let base = policy
        .min_delay
        .mul_f64(2f64.powi(attempt.saturating_sub(1) as i32))
        .clamp(policy.min_delay, policy.max_delay);
    let base = retry_after.map(|ra| ra.max(base)).unwrap_or(base);
    let jitter_frac = rand::thread_rng().gen_range(-policy.jitter..=policy.jitter);
    base.mul_f64((1.0 + jitter_frac).max(0.0))
        .clamp(policy.min_delay, policy.max_delay)
}

/// Extracts an HTTP-like status code embedded in an error's message, e.g.
/// the `503` in `"503 service unavailable"`. Errors that don't carry a
/// recognizable status resolve to `None`, which `is_retryable` treats as
/// non-retryable.
fn extract_status(err: &anyhow::Error) -> Option<u16> {
    let msg = err.to_string();
    Regex::new(r"\b([1-5][0-9]{2})\b")
        .ok()?
        .captures(&msg)?
        .get(1)?
        .as_str()
        .parse()
        .ok()
}

/// Retry a fallible async operation with exponential backoff and jitter.
///
/// `should_retry(&err, attempt)` may veto a retry for a specific error.
/// `retry_after` lets the caller surface a provider-supplied `Retry-After`.
pub async fn retry<F, Fut, T>(
    policy: &RetryPolicy,
    mut run: F,
    should_retry: impl Fn(&anyhow::Error, u32) -> bool,
    retry_after: impl Fn(&anyhow::Error) -> Option<Duration>,
) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match run().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if attempt >= policy.attempts || !should_retry(&e, attempt) {
                    return Err(e);
                }
                let delay = backoff_delay(&policy, attempt, retry_after(&e));
                warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying after backoff");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Walk `[primary, ...fallbacks]`, skipping candidates in cooldown (unless
/// it is the only one left), retrying each with [`retry`]. Context-overflow
/// errors are rethrown immediately without consulting any further candidate.
pub async fn run_with_model_fallback<F, Fut, T>(
    primary: &ModelCandidate,
    fallbacks: &[ModelCandidate],
    cooldowns: &mut CooldownMap,
    policy: &RetryPolicy,
    mut run: F,
) -> anyhow::Result<FallbackOutcome<T>>
where
    F: FnMut(&ModelCandidate) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut candidates: Vec<&ModelCandidate> = Vec::with_capacity(1 + fallbacks.len());
    candidates.push(primary);
    for c in fallbacks {
        if !candidates.iter().any(|existing| existing.provider == c.provider && existing.name == c.name) {
            candidates.push(c);
        }
    }

    let mut attempts = Vec::new();
    let last_index = candidates.len() - 1;
    for (i, candidate) in candidates.iter().enumerate() {
        if cooldowns.is_cooling_down(candidate) && i != last_index {
            continue;
        }
        let result = retry(
            policy,
            || run(candidate),
            |err, _attempt| is_retryable(extract_status(err)),
            |_err| None,
        )
        .await;
        match result {
            Ok(result) => {
                return Ok(FallbackOutcome {
                    result,
                    provider: candidate.provider.clone(),
                    model: candidate.name.clone(),
                    attempts,
                })
            }
            Err(e) if is_context_overflow(&e) => return Err(e),
            Err(e) => {
                info!(provider = %candidate.provider, model = %candidate.name, error = %e, "candidate failed, cooling down");
                attempts.push(Attempt {
                    provider: candidate.provider.clone(),
                    model: candidate.name.clone(),
                    error: e.to_string(),
                });
                cooldowns.cool_down(candidate);
            }
        }
    }
    anyhow::bail!(
        "All models failed ({}): {}",
        attempts.len(),
        attempts.last().map(|a| a.error.as_str()).unwrap_or("no attempts made")
    )
}
