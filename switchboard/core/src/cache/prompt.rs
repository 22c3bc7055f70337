//! Partial-Prompt Cache
//!
//! Vendor-assisted caching of stable prompt segments. Callers mark individual
//! messages with a [`CacheControl`]; backends that support prompt caching
//! bill those segments at a discount after the first write. Backends that do
//! not simply receive an ordinary multi-turn call.
//!
//! [`PromptCache`] wraps one backend instance and keeps the token bookkeeping
//! that hit rate, tokens saved and cost savings are derived from.
//!
//! ```text
//! [system: policy ✱][user: repo map ✱][user: question]
//!  └────── stable prefix (marked ✱) ──────┘└ dynamic ┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::backend::{Backend, BackendRequest, BackendResponse, ChatMessage, MessageRole};
use crate::error::BackendError;

// ============================================================================
// Markers
// ============================================================================

/// Cache kind. Vendors currently define only one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheKind {
    /// Lives until its TTL lapses
    #[default]
    Ephemeral,
}

/// Lifetime of a cached segment
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheTtl {
    /// Vendor default
    #[default]
    #[serde(rename = "5m")]
    FiveMinutes,
    /// Extended lifetime, billed at a higher write rate
    #[serde(rename = "1h")]
    OneHour,
}

impl CacheTtl {
    /// Wire name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FiveMinutes => "5m",
            Self::OneHour => "1h",
        }
    }

    /// Lifetime as a duration
    #[must_use]
    pub fn duration(self) -> Duration {
        match self {
            Self::FiveMinutes => Duration::from_secs(5 * 60),
            Self::OneHour => Duration::from_secs(60 * 60),
        }
    }
}

/// Per-message cache marker
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheControl {
    /// Marker type, serialized as `type`
    #[serde(rename = "type")]
    pub kind: CacheKind,
    /// How long the segment stays cached
    #[serde(default)]
    pub ttl: CacheTtl,
}

impl CacheControl {
    /// Ephemeral marker with the default five-minute lifetime
    #[must_use]
    pub fn ephemeral() -> Self {
        Self::default()
    }

    /// Same marker with a different lifetime
    #[must_use]
    pub fn with_ttl(mut self, ttl: CacheTtl) -> Self {
        self.ttl = ttl;
        self
    }
}

/// Chat message that may carry a cache marker
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedMessage {
    /// Speaker
    pub role: MessageRole,
    /// Message text
    pub content: String,
    /// Present when this message ends a cacheable prefix
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<CacheControl>,
}

impl CachedMessage {
    /// Unmarked (dynamic) message
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            cache_control: None,
        }
    }

    /// Message marked cacheable for `ttl`
    pub fn cached(role: MessageRole, content: impl Into<String>, ttl: CacheTtl) -> Self {
        Self {
            cache_control: Some(CacheControl::ephemeral().with_ttl(ttl)),
            ..Self::new(role, content)
        }
    }

    /// Whether the message carries a marker
    #[must_use]
    pub fn is_cacheable(&self) -> bool {
        self.cache_control.is_some()
    }

    /// Drop the marker
    #[must_use]
    pub fn to_chat_message(&self) -> ChatMessage {
        ChatMessage {
            role: self.role,
            content: self.content.clone(),
        }
    }
}

/// SHA-256 over the marked segments only; `None` when nothing is marked
///
/// Unmarked content never contributes, so changing the dynamic tail of a
/// conversation leaves the key untouched.
#[must_use]
pub fn stable_prefix_key(messages: &[CachedMessage]) -> Option<String> {
    let mut hasher = Sha256::new();
    let mut marked = false;
    for message in messages {
        let Some(control) = message.cache_control else {
            continue;
        };
        marked = true;
        hasher.update(message.role.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(control.ttl.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(message.content.as_bytes());
        hasher.update([0u8]);
    }
    marked.then(|| hex::encode(hasher.finalize()))
}

// ============================================================================
// Usage & Pricing
// ============================================================================

/// Token accounting reported by one call
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheUsage {
    /// Ordinary (uncached) input tokens
    pub input_tokens: u64,
    /// Generated tokens
    pub output_tokens: u64,
    /// Input tokens written to the cache
    pub cache_creation_input_tokens: u64,
    /// Input tokens served from the cache
    pub cache_read_input_tokens: u64,
}

/// Response plus its cache accounting
#[derive(Clone, Debug, PartialEq)]
pub struct CachedChatResponse {
    /// The generated answer
    pub response: BackendResponse,
    /// Token accounting for this call
    pub usage: CacheUsage,
}

/// Price multipliers relative to ordinary input tokens
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CachePricing {
    /// Share of a cache-read token counted as saved
    pub tokens_saved_ratio: f64,
    /// Cost of writing one token to the cache
    pub cache_write_multiplier: f64,
    /// Cost of reading one token from the cache
    pub cache_read_multiplier: f64,
}

impl Default for CachePricing {
    fn default() -> Self {
        Self {
            tokens_saved_ratio: 0.9,
            cache_write_multiplier: 1.25,
            cache_read_multiplier: 0.1,
        }
    }
}

/// Accumulated bookkeeping for one backend instance
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PromptCacheStats {
    /// Tokens written to the cache
    pub cache_creation_tokens: u64,
    /// Tokens served from the cache
    pub cache_read_tokens: u64,
    /// Uncached input tokens
    pub input_tokens: u64,
    /// Generated tokens
    pub output_tokens: u64,
    /// Calls that read from the cache
    pub hits: u64,
    /// Calls that only wrote to the cache
    pub misses: u64,
}

impl PromptCacheStats {
    /// Fold one call's usage in
    pub fn record(&mut self, usage: &CacheUsage) {
        self.cache_creation_tokens += usage.cache_creation_input_tokens;
        self.cache_read_tokens += usage.cache_read_input_tokens;
        self.input_tokens += usage.input_tokens;
        self.output_tokens += usage.output_tokens;

        if usage.cache_read_input_tokens > 0 {
            self.hits += 1;
        } else if usage.cache_creation_input_tokens > 0 {
            self.misses += 1;
        }
    }

    /// Percentage of cache attempts that hit; 0 with no attempts
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let attempts = self.hits + self.misses;
        if attempts == 0 {
            return 0.0;
        }
        self.hits as f64 / attempts as f64 * 100.0
    }

    /// Input tokens effectively not paid for
    #[must_use]
    pub fn tokens_saved(&self, pricing: &CachePricing) -> u64 {
        (self.cache_read_tokens as f64 * pricing.tokens_saved_ratio).round() as u64
    }

    /// Percent cheaper than sending every token uncached; 0 with no input
    ///
    /// Negative while cache writes have not yet been amortized by reads.
    #[must_use]
    pub fn cost_savings_percent(&self, pricing: &CachePricing) -> f64 {
        let without = (self.input_tokens + self.cache_creation_tokens + self.cache_read_tokens) as f64;
        if without == 0.0 {
            return 0.0;
        }
        let with = self.input_tokens as f64
            + self.cache_creation_tokens as f64 * pricing.cache_write_multiplier
            + self.cache_read_tokens as f64 * pricing.cache_read_multiplier;
        (without - with) / without * 100.0
    }
}

// ============================================================================
// Prompt Cache
// ============================================================================

/// Prompt-cache front for one backend instance
pub struct PromptCache {
    backend: Arc<dyn Backend>,
    enabled: bool,
    pricing: CachePricing,
    stats: Mutex<PromptCacheStats>,
}

impl std::fmt::Debug for PromptCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromptCache")
            .field("backend", &self.backend.name())
            .field("enabled", &self.enabled)
            .field("stats", &*self.stats.lock())
            .finish()
    }
}

impl PromptCache {
    /// Front `backend`; when `enabled` is false markers are stripped
    pub fn new(backend: Arc<dyn Backend>, enabled: bool) -> Self {
        Self {
            backend,
            enabled,
            pricing: CachePricing::default(),
            stats: Mutex::new(PromptCacheStats::default()),
        }
    }

    /// Replace the default multipliers
    #[must_use]
    pub fn with_pricing(mut self, pricing: CachePricing) -> Self {
        self.pricing = pricing;
        self
    }

    /// Whether markers are forwarded
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// The fronted backend
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Multipliers used for savings figures
    pub fn pricing(&self) -> &CachePricing {
        &self.pricing
    }

    /// Multi-turn call honoring cache markers
    ///
    /// When disabled, markers are stripped and only plain input/output tokens
    /// are counted.
    pub async fn chat(
        &self,
        messages: &[CachedMessage],
        request: &BackendRequest,
    ) -> Result<CachedChatResponse, BackendError> {
        if !self.enabled {
            let plain: Vec<ChatMessage> =
                messages.iter().map(CachedMessage::to_chat_message).collect();
            let response = self.backend.chat(&plain, request).await?;
            let usage = CacheUsage {
                input_tokens: u64::from(response.prompt_tokens),
                output_tokens: u64::from(response.completion_tokens),
                ..CacheUsage::default()
            };
            self.stats.lock().record(&usage);
            return Ok(CachedChatResponse { response, usage });
        }

        if !self.backend.supports_prompt_caching() {
            tracing::debug!(
                backend = %self.backend.name(),
                "Prompt caching unsupported, sending plain chat"
            );
        }

        let result = self.backend.chat_with_prompt_cache(messages, request).await?;
        let usage = result.usage;
        self.stats.lock().record(&usage);
        tracing::debug!(
            backend = %self.backend.name(),
            cache_read = usage.cache_read_input_tokens,
            cache_creation = usage.cache_creation_input_tokens,
            "Prompt cache usage"
        );
        Ok(result)
    }

    /// Snapshot of accumulated bookkeeping
    pub fn stats(&self) -> PromptCacheStats {
        *self.stats.lock()
    }

    /// Hit rate in percent
    pub fn hit_rate(&self) -> f64 {
        self.stats().hit_rate()
    }

    /// See [`PromptCacheStats::tokens_saved`]
    pub fn tokens_saved(&self) -> u64 {
        self.stats().tokens_saved(&self.pricing)
    }

    /// See [`PromptCacheStats::cost_savings_percent`]
    pub fn cost_savings_percent(&self) -> f64 {
        self.stats().cost_savings_percent(&self.pricing)
    }

    /// Zero all counters
    pub fn reset(&self) {
        *self.stats.lock() = PromptCacheStats::default();
    }
}
