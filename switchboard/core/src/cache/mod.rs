//! Prompt Caching
//!
//! Two independent mechanisms, toggled separately in
//! [`CacheConfig`](crate::config::CacheConfig):
//!
//! - [`response`]: full-response memoization in front of any backend
//! - [`prompt`]: vendor-assisted caching of marked prompt segments, with
//!   per-backend token bookkeeping

pub mod prompt;
pub mod response;

pub use prompt::{
    CacheControl, CacheKind, CachePricing, CacheTtl, CacheUsage, CachedChatResponse,
    CachedMessage, PromptCache, PromptCacheStats,
};
pub use response::{CachedBackend, ResponseCache, ResponseCacheStats};
