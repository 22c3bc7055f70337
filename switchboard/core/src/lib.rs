//! Switchboard Core - Role-Based LLM Backend Routing
//!
//! This crate routes text-generation requests across interchangeable language
//! model backends. Callers ask for a backend by *role* (planner, coder,
//! reviewer, ...) and the registry resolves it through a primary / fallback /
//! default chain. Vendor integrations live outside this crate and plug in
//! through the [`Backend`] trait and a [`BackendFactory`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Registry                            │
//! │  select(role) ──► primary ─► fallbacks ─► default            │
//! │  execute(role, prompt) ──► RetryEngine ──► dyn Backend       │
//! │        │                                       │             │
//! │        ▼                                       ▼             │
//! │  MetricsCollector                     CachedBackend (opt.)   │
//! │  (p50 / p95, tokens)                  PromptCache (opt.)     │
//! └──────────────────────────────────────────────────────────────┘
//!           ▲
//!           │ ParallelValidator probes every backend at startup
//! ```
//!
//! # Key Types
//!
//! - [`Registry`]: role routing, retries, metrics and shutdown
//! - [`RegistryConfig`]: validated configuration (TOML or builder)
//! - [`Backend`]: the contract every backend implements
//! - [`RetryEngine`]: bounded exponential backoff with cancellation
//! - [`MetricsCollector`]: append-only event log with derived summaries
//! - [`ResponseCache`] / [`PromptCache`]: the two caching layers
//! - [`ErrorCode`]: closed failure taxonomy driving retry decisions
//!
//! # Quick Start
//!
//! ```ignore
//! use switchboard_core::{BackendFactory, Registry, RegistryConfig, Role};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     switchboard_core::telemetry::init_tracing("info");
//!
//!     let config = RegistryConfig::from_path("switchboard.toml".as_ref())?;
//!     let registry = Registry::new(config, &BackendFactory::with_builtin()).await?;
//!
//!     let response = registry
//!         .execute(Role::Coder, "Write a tokenizer", &CancellationToken::new())
//!         .await?;
//!     println!("{}", response.text);
//!
//!     registry.shutdown().await?;
//!     Ok(())
//! }
//! ```

#![deny(missing_docs)]

pub mod backend;
pub mod cache;
pub mod config;
pub mod error;
pub mod routing;
pub mod telemetry;

pub use backend::{
    Backend, BackendFactory, BackendRequest, BackendResponse, ChatMessage, MessageRole,
    MockBackend,
};
pub use cache::{
    CacheControl, CachePricing, CacheTtl, CachedBackend, CachedMessage, PromptCache,
    PromptCacheStats, ResponseCache,
};
pub use config::{
    BackendDescriptor, BackendType, CacheConfig, ConfigError, RegistryConfig, RetryPolicy, Role,
    RoleAssignment,
};
pub use error::{BackendError, ErrorCode, RegistryError};
pub use routing::{
    MetricEvent, MetricStatus, MetricsCollector, MetricsFilter, MetricsSink, MetricsSummary,
    ParallelValidator, Registry, RetryEngine, RetryError, ValidationError,
};
