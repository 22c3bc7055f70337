//! Response Cache
//!
//! Full-response memoization keyed by a SHA-256 of backend id, model and
//! prompt. Entries never expire and capacity is unbounded: this is a
//! development aid for repeated runs over the same inputs, not an LRU.
//!
//! [`CachedBackend`] puts the cache in front of any backend and is itself a
//! [`Backend`], so the registry can hold it in place of the raw handle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::backend::{Backend, BackendRequest, BackendResponse, ChatMessage};
use crate::cache::prompt::{CachedChatResponse, CachedMessage};
use crate::config::BackendType;
use crate::error::BackendError;

// ============================================================================
// Keys
// ============================================================================

fn digest(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

/// Key for a single-shot call, optionally with a structured-output schema
#[must_use]
pub fn single_shot_key(backend_id: &str, model: &str, prompt: &str, schema: Option<&Value>) -> String {
    match schema {
        Some(schema) => digest(&[
            backend_id.as_bytes(),
            model.as_bytes(),
            prompt.as_bytes(),
            schema.to_string().as_bytes(),
        ]),
        None => digest(&[backend_id.as_bytes(), model.as_bytes(), prompt.as_bytes()]),
    }
}

/// Key for a multi-turn call
#[must_use]
pub fn conversation_key(backend_id: &str, model: &str, messages: &[ChatMessage]) -> String {
    let serialized = serde_json::to_string(messages).unwrap_or_default();
    digest(&[backend_id.as_bytes(), model.as_bytes(), serialized.as_bytes()])
}

// ============================================================================
// Cache
// ============================================================================

#[derive(Debug)]
struct CacheEntry {
    text: String,
    created_at: DateTime<Utc>,
    hits: AtomicU64,
}

/// Counters snapshot
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct ResponseCacheStats {
    /// Lookups served from the cache
    pub hits: u64,
    /// Lookups that found nothing, including every lookup while disabled
    pub misses: u64,
    /// Stored responses
    pub entries: usize,
    /// Percentage of lookups that hit; 0 with no lookups
    pub hit_rate: f64,
}

/// Shared key → response text store
#[derive(Debug)]
pub struct ResponseCache {
    enabled: bool,
    entries: DashMap<String, CacheEntry>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ResponseCache {
    /// When disabled every lookup misses and every store is dropped; the
    /// counters still move.
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            entries: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Whether lookups can hit and stores are kept
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Look up `key`, counting the hit or miss
    pub fn get(&self, key: &str) -> Option<String> {
        let found = if self.enabled {
            self.entries.get(key).map(|entry| {
                entry.hits.fetch_add(1, Ordering::Relaxed);
                entry.text.clone()
            })
        } else {
            None
        };

        let counter = if found.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    /// Store `text` under `key`
    pub fn set(&self, key: String, text: String) {
        if !self.enabled {
            return;
        }
        self.entries.insert(
            key,
            CacheEntry {
                text,
                created_at: Utc::now(),
                hits: AtomicU64::new(0),
            },
        );
    }

    /// When `key` was stored
    pub fn created_at(&self, key: &str) -> Option<DateTime<Utc>> {
        self.entries.get(key).map(|entry| entry.created_at)
    }

    /// Times `key` was served
    pub fn entry_hits(&self, key: &str) -> Option<u64> {
        self.entries
            .get(key)
            .map(|entry| entry.hits.load(Ordering::Relaxed))
    }

    /// Number of stored responses
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is stored
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Counters snapshot
    pub fn stats(&self) -> ResponseCacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        ResponseCacheStats {
            hits,
            misses,
            entries: self.entries.len(),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64 * 100.0
            },
        }
    }

    /// Drop every entry and zero the counters
    pub fn clear(&self) {
        self.entries.clear();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

// ============================================================================
// Cached Backend
// ============================================================================

/// Backend decorator that consults a [`ResponseCache`] first
pub struct CachedBackend {
    inner: Arc<dyn Backend>,
    cache: Arc<ResponseCache>,
}

impl std::fmt::Debug for CachedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedBackend")
            .field("inner", &self.inner.name())
            .field("cache", &self.cache.stats())
            .finish()
    }
}

impl CachedBackend {
    /// Put `cache` in front of `inner`
    pub fn new(inner: Arc<dyn Backend>, cache: Arc<ResponseCache>) -> Self {
        Self { inner, cache }
    }

    /// The wrapped backend
    pub fn inner(&self) -> &Arc<dyn Backend> {
        &self.inner
    }

    /// The shared cache
    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }
}

#[async_trait]
impl Backend for CachedBackend {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn kind(&self) -> BackendType {
        self.inner.kind()
    }

    fn model(&self) -> &str {
        self.inner.model()
    }

    async fn initialize(&self) -> Result<(), BackendError> {
        self.inner.initialize().await
    }

    async fn execute(&self, request: &BackendRequest) -> Result<BackendResponse, BackendError> {
        let key = single_shot_key(self.name(), self.model(), &request.prompt, None);
        if let Some(text) = self.cache.get(&key) {
            tracing::debug!(backend = %self.name(), "Response cache hit");
            return Ok(BackendResponse::estimated(&request.prompt, text, self.model()));
        }

        let response = self.inner.execute(request).await?;
        if response.error.is_none() {
            self.cache.set(key, response.text.clone());
        }
        Ok(response)
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        request: &BackendRequest,
    ) -> Result<BackendResponse, BackendError> {
        let key = conversation_key(self.name(), self.model(), messages);
        if let Some(text) = self.cache.get(&key) {
            tracing::debug!(backend = %self.name(), "Response cache hit (chat)");
            let prompt: String = messages.iter().map(|m| m.content.as_str()).collect();
            return Ok(BackendResponse::estimated(&prompt, text, self.model()));
        }

        let response = self.inner.chat(messages, request).await?;
        if response.error.is_none() {
            self.cache.set(key, response.text.clone());
        }
        Ok(response)
    }

    async fn generate_structured(
        &self,
        request: &BackendRequest,
        schema: &Value,
    ) -> Result<Value, BackendError> {
        let key = single_shot_key(self.name(), self.model(), &request.prompt, Some(schema));
        if let Some(text) = self.cache.get(&key) {
            match serde_json::from_str(&text) {
                Ok(value) => {
                    tracing::debug!(backend = %self.name(), "Response cache hit (structured)");
                    return Ok(value);
                }
                Err(e) => {
                    tracing::warn!(backend = %self.name(), error = %e, "Discarding unreadable cache entry");
                }
            }
        }

        let value = self.inner.generate_structured(request, schema).await?;
        self.cache.set(key, value.to_string());
        Ok(value)
    }

    fn supports_prompt_caching(&self) -> bool {
        self.inner.supports_prompt_caching()
    }

    async fn chat_with_prompt_cache(
        &self,
        messages: &[CachedMessage],
        request: &BackendRequest,
    ) -> Result<CachedChatResponse, BackendError> {
        self.inner.chat_with_prompt_cache(messages, request).await
    }

    async fn shutdown(&self) -> Result<(), BackendError> {
        self.inner.shutdown().await
    }
}
